use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{tick, Receiver};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::{
    aggregator::TrafficAggregator,
    config::{AggregatorConfig, TickConfig},
    error::DashboardError,
    geo::GeoCache,
    ingest::IngestStats,
    sink::DashboardSink,
    threads::ThreadManager,
    types::{MapPoint, PacketEvent},
};

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub ingested: AtomicU64,
    pub snapshots: AtomicU64,
    pub flushes: AtomicU64,
    pub resets: AtomicU64,
    pub lookups_dispatched: AtomicU64,
    pub map_points: AtomicU64,
    pub map_points_dropped: AtomicU64,
}

/// Runs the aggregator on a single worker thread.
///
/// Ingest and every tick handler are serialized through one `select!` loop,
/// so the traffic table and delta queue have exactly one writer.
pub struct TrafficPipeline {
    aggregator_config: AggregatorConfig,
    ticks: TickConfig,
    thread_manager: ThreadManager,
    stats: Arc<PipelineStats>,
}

impl TrafficPipeline {
    pub fn new(aggregator_config: AggregatorConfig, ticks: TickConfig) -> Self {
        info!(
            "Tracking up to {} addresses, top {} charted",
            aggregator_config.capacity, aggregator_config.top_n_for_chart
        );
        Self {
            aggregator_config,
            ticks,
            thread_manager: ThreadManager::new(),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn start(
        &mut self,
        events: Receiver<PacketEvent>,
        geo: Arc<GeoCache>,
        sink: Arc<dyn DashboardSink>,
        ingest_stats: Arc<IngestStats>,
        runtime: Handle,
    ) -> Result<(), DashboardError> {
        let mut aggregator = TrafficAggregator::new(&self.aggregator_config);
        let top_n = self.aggregator_config.top_n_for_chart;
        let ticks = self.ticks.clone();
        let stats = self.stats.clone();

        self.thread_manager
            .spawn("aggregator", move |exit, shutdown_rx| {
                let snapshot_tick = tick(ticks.snapshot_interval);
                let flush_tick = tick(ticks.delta_flush_interval);
                let reset_tick = tick(ticks.reset_interval);
                let console_tick = tick(ticks.console_interval);
                let stats_tick = tick(ticks.stats_interval);

                while !exit.load(Ordering::Relaxed) {
                    crossbeam_channel::select! {
                        recv(events) -> maybe_event => {
                            let Ok(event) = maybe_event else {
                                info!("Ingest channel closed");
                                break;
                            };
                            aggregator.ingest(event);
                            stats.ingested.fetch_add(1, Ordering::Relaxed);
                        }
                        recv(snapshot_tick) -> _ => {
                            sink.top_talkers(&aggregator.top_talkers(top_n));
                            stats.snapshots.fetch_add(1, Ordering::Relaxed);
                        }
                        recv(flush_tick) -> _ => {
                            dispatch_deltas(&mut aggregator, &geo, &sink, &stats, &runtime);
                        }
                        recv(console_tick) -> _ => {
                            sink.console(&aggregator.console_lines());
                        }
                        recv(reset_tick) -> _ => {
                            aggregator.reset_all();
                            stats.resets.fetch_add(1, Ordering::Relaxed);
                        }
                        recv(stats_tick) -> _ => {
                            info!(
                                "Pipeline stats: ingested={}, malformed={}, connections={}, tracked={}, flushes={}, lookups={}, geo_queries={}, map_points={}, dropped_points={}",
                                stats.ingested.load(Ordering::Relaxed),
                                ingest_stats.malformed.load(Ordering::Relaxed),
                                ingest_stats.connections.load(Ordering::Relaxed),
                                aggregator.tracked(),
                                stats.flushes.load(Ordering::Relaxed),
                                stats.lookups_dispatched.load(Ordering::Relaxed),
                                geo.queries_issued(),
                                stats.map_points.load(Ordering::Relaxed),
                                stats.map_points_dropped.load(Ordering::Relaxed)
                            );
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                info!("Exiting aggregator thread");
            })
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down TrafficPipeline");
        self.thread_manager.shutdown();
    }
}

/// One lookup per address with fresh traffic; each resolved record with
/// coordinates becomes a map point carrying that address's delta.
fn dispatch_deltas(
    aggregator: &mut TrafficAggregator,
    geo: &GeoCache,
    sink: &Arc<dyn DashboardSink>,
    stats: &Arc<PipelineStats>,
    runtime: &Handle,
) {
    let deltas = aggregator.flush_deltas();
    stats.flushes.fetch_add(1, Ordering::Relaxed);
    if deltas.is_empty() {
        return;
    }

    debug!("Flushing traffic deltas for {} addresses", deltas.len());
    for (address, traffic) in deltas {
        let lookup = geo.lookup(&address);
        let sink = sink.clone();
        let stats = stats.clone();
        stats.lookups_dispatched.fetch_add(1, Ordering::Relaxed);

        runtime.spawn(async move {
            let record = lookup.await;
            match MapPoint::from_record(record, traffic) {
                Some(point) => {
                    stats.map_points.fetch_add(1, Ordering::Relaxed);
                    sink.map_point(point);
                }
                None => {
                    stats.map_points_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::GeoConfig,
        geo::GeoResolver,
        sink::LatestFrames,
        types::{GeoRecord, GeoStatus},
    };
    use futures::{future::BoxFuture, FutureExt};
    use std::time::{Duration, Instant};

    struct Located;

    impl GeoResolver for Located {
        fn resolve(&self, address: &str) -> BoxFuture<'static, Result<GeoRecord, DashboardError>> {
            let record = if address.starts_with("10.") {
                GeoRecord::failed(address, "private range")
            } else {
                GeoRecord {
                    query: address.to_string(),
                    status: GeoStatus::Success,
                    lat: Some(22.5),
                    lon: Some(114.1),
                    ..Default::default()
                }
            };
            futures::future::ready(Ok(record)).boxed()
        }
    }

    fn fast_ticks() -> TickConfig {
        TickConfig {
            snapshot_interval: Duration::from_millis(10),
            delta_flush_interval: Duration::from_millis(10),
            reset_interval: Duration::from_secs(60),
            console_interval: Duration::from_millis(10),
            stats_interval: Duration::from_secs(60),
        }
    }

    fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn events_reach_every_sink_stream() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let geo = Arc::new(GeoCache::new(
            &GeoConfig::default(),
            Arc::new(Located),
            runtime.handle().clone(),
        ));
        let frames = Arc::new(LatestFrames::new(16));
        let (sender, receiver) = crossbeam_channel::unbounded();

        let mut pipeline = TrafficPipeline::new(AggregatorConfig::default(), fast_ticks());
        let stats = pipeline.stats();
        pipeline
            .start(
                receiver,
                geo.clone(),
                frames.clone(),
                Arc::new(IngestStats::default()),
                runtime.handle().clone(),
            )
            .unwrap();

        sender.send(PacketEvent::ipv4("8.8.8.8", "10.0.0.2", 500)).unwrap();
        sender.send(PacketEvent::ipv4("8.8.8.8", "10.0.0.2", 500)).unwrap();
        sender.send(PacketEvent::ipv4("10.0.0.9", "8.8.8.8", 40)).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            frames.latest_top_talkers().entries.first() == Some(&("8.8.8.8".to_string(), 1000))
        }));
        assert_eq!(frames.latest_top_talkers().total_bytes, 1040);
        assert!(wait_for(Duration::from_secs(5), || {
            frames.latest_console().len() == 3
        }));

        // Both 8.8.8.8 packets may land in one flush window or in two.
        let mut points = Vec::new();
        assert!(wait_for(Duration::from_secs(5), || {
            points.extend(frames.drain_map_points());
            points.iter().map(|p| p.traffic).sum::<u64>() == 1000
                && stats.map_points_dropped.load(Ordering::Relaxed) >= 1
        }));
        assert!(points.iter().all(|p| p.record.query == "8.8.8.8"));
        assert_eq!(geo.queries_issued(), 2);

        pipeline.shutdown();
        assert_eq!(stats.ingested.load(Ordering::Relaxed), 3);
    }
}
