use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    types::{ConsoleLine, MapPoint, TopTalkers},
    utils::human_readable_size,
};

/// Receives the dashboard's three output streams. Called from the aggregator
/// thread and from lookup tasks on the runtime, so implementations must be
/// cheap and non-blocking.
pub trait DashboardSink: Send + Sync + 'static {
    fn top_talkers(&self, snapshot: &TopTalkers);

    /// The current console window, oldest line first.
    fn console(&self, lines: &[ConsoleLine]);

    fn map_point(&self, point: MapPoint);
}

/// Renders everything through `tracing`.
pub struct LogSink {
    last_line: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            last_line: AtomicU64::new(0),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DashboardSink for LogSink {
    fn top_talkers(&self, snapshot: &TopTalkers) {
        let talkers = snapshot
            .entries
            .iter()
            .map(|(address, bytes)| format!("{address}={}", human_readable_size(*bytes)))
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            "Total {} | top: [{}]",
            human_readable_size(snapshot.total_bytes),
            talkers
        );
    }

    fn console(&self, lines: &[ConsoleLine]) {
        // Ids start at 0, so `last_line` holds the next unseen id.
        let next = self.last_line.load(Ordering::Relaxed);
        for line in lines.iter().filter(|line| line.id >= next) {
            debug!("#{} {}", line.id, line.text);
        }
        if let Some(last) = lines.last() {
            self.last_line.fetch_max(last.id + 1, Ordering::Relaxed);
        }
    }

    fn map_point(&self, point: MapPoint) {
        info!(
            "{} ({}, {}) at {:.2},{:.2}: {}",
            point.record.query,
            point.record.city,
            point.record.country,
            point.lat,
            point.lon,
            human_readable_size(point.traffic)
        );
    }
}

/// Keeps the latest frame of each output for a UI to poll.
pub struct LatestFrames {
    top_talkers: ArcSwap<TopTalkers>,
    console: ArcSwap<Vec<ConsoleLine>>,
    map_points: Mutex<VecDeque<MapPoint>>,
    max_map_points: usize,
}

impl LatestFrames {
    pub fn new(max_map_points: usize) -> Self {
        Self {
            top_talkers: ArcSwap::from_pointee(TopTalkers::default()),
            console: ArcSwap::from_pointee(Vec::new()),
            map_points: Mutex::new(VecDeque::with_capacity(max_map_points)),
            max_map_points,
        }
    }

    pub fn latest_top_talkers(&self) -> Arc<TopTalkers> {
        self.top_talkers.load_full()
    }

    pub fn latest_console(&self) -> Arc<Vec<ConsoleLine>> {
        self.console.load_full()
    }

    /// Takes the map points received since the last call.
    pub fn drain_map_points(&self) -> Vec<MapPoint> {
        self.map_points.lock().drain(..).collect()
    }
}

impl DashboardSink for LatestFrames {
    fn top_talkers(&self, snapshot: &TopTalkers) {
        self.top_talkers.store(Arc::new(snapshot.clone()));
    }

    fn console(&self, lines: &[ConsoleLine]) {
        self.console.store(Arc::new(lines.to_vec()));
    }

    fn map_point(&self, point: MapPoint) {
        if self.max_map_points == 0 {
            return;
        }
        let mut points = self.map_points.lock();
        if points.len() >= self.max_map_points {
            points.pop_front();
        }
        points.push_back(point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoRecord, GeoStatus};

    fn point(query: &str) -> MapPoint {
        let record = GeoRecord {
            query: query.into(),
            status: GeoStatus::Success,
            lat: Some(1.0),
            lon: Some(2.0),
            ..Default::default()
        };
        MapPoint::from_record(Arc::new(record), 10).unwrap()
    }

    #[test]
    fn latest_frames_keeps_newest_state() {
        let frames = LatestFrames::new(2);
        frames.top_talkers(&TopTalkers {
            entries: vec![("1.1.1.1".into(), 5)],
            total_bytes: 5,
        });
        assert_eq!(frames.latest_top_talkers().total_bytes, 5);

        let lines = vec![ConsoleLine {
            id: 3,
            text: "a -> b".into(),
        }];
        frames.console(&lines);
        assert_eq!(*frames.latest_console(), lines);

        for query in ["a", "b", "c"] {
            frames.map_point(point(query));
        }
        let drained = frames.drain_map_points();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].record.query, "b");
        assert!(frames.drain_map_points().is_empty());
    }

    #[test]
    fn log_sink_tracks_seen_console_lines() {
        let sink = LogSink::new();
        let lines: Vec<ConsoleLine> = (0..3)
            .map(|id| ConsoleLine {
                id,
                text: format!("line {id}"),
            })
            .collect();
        sink.console(&lines);
        assert_eq!(sink.last_line.load(Ordering::Relaxed), 3);
        sink.console(&lines[..1]);
        assert_eq!(sink.last_line.load(Ordering::Relaxed), 3);
    }
}
