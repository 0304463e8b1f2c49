use std::{
    cmp::Ordering,
    collections::{HashMap, VecDeque},
    mem,
};

use tracing::debug;

use crate::{
    config::AggregatorConfig,
    types::{ConsoleLine, PacketEvent, TopTalkers, Transport},
};

/// Rolling per-source byte accounting.
///
/// The traffic table never holds more than `capacity` addresses: once it
/// grows past the cap, only the `capacity` heaviest sources survive and the
/// rest are forgotten. Deltas accumulate separately until the next
/// [`flush_deltas`](Self::flush_deltas) and are not capped.
#[derive(Debug)]
pub struct TrafficAggregator {
    capacity: usize,
    console_lines: usize,
    bytes_total: u64,
    table: HashMap<String, u64>,
    deltas: HashMap<String, u64>,
    console: VecDeque<ConsoleLine>,
    next_line_id: u64,
}

impl TrafficAggregator {
    pub fn new(config: &AggregatorConfig) -> Self {
        Self {
            capacity: config.capacity,
            console_lines: config.console_lines,
            bytes_total: 0,
            table: HashMap::with_capacity(config.capacity + 1),
            deltas: HashMap::new(),
            console: VecDeque::with_capacity(config.console_lines + 1),
            next_line_id: 0,
        }
    }

    pub fn ingest(&mut self, event: PacketEvent) {
        self.bytes_total = self.bytes_total.saturating_add(event.size);

        let Transport::Ipv4 { source, dest } = event.transport else {
            return;
        };

        self.push_console_line(format!("{source} -> {dest}"));

        let delta = self.deltas.entry(source.clone()).or_insert(0);
        *delta = delta.saturating_add(event.size);

        let count = self.table.entry(source).or_insert(0);
        *count = count.saturating_add(event.size);

        self.compact();
    }

    /// Trims the table back to the `capacity` heaviest addresses. Ties are
    /// broken by address so a given table always compacts the same way.
    pub fn compact(&mut self) {
        if self.table.len() <= self.capacity {
            return;
        }

        if self.capacity == 0 {
            self.table.clear();
            return;
        }

        let before = self.table.len();
        let mut entries: Vec<(String, u64)> = self.table.drain().collect();
        entries.select_nth_unstable_by(self.capacity - 1, by_bytes_desc);
        entries.truncate(self.capacity);
        self.table.extend(entries);

        debug!(
            "Compacted traffic table from {} to {} addresses",
            before,
            self.table.len()
        );
    }

    pub fn snapshot_top_n(&self, n: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .table
            .iter()
            .map(|(address, bytes)| (address.clone(), *bytes))
            .collect();
        entries.sort_unstable_by(by_bytes_desc);
        entries.truncate(n);
        entries
    }

    pub fn top_talkers(&self, n: usize) -> TopTalkers {
        TopTalkers {
            entries: self.snapshot_top_n(n),
            total_bytes: self.bytes_total,
        }
    }

    /// Hands over everything accumulated since the previous flush.
    pub fn flush_deltas(&mut self) -> HashMap<String, u64> {
        mem::take(&mut self.deltas)
    }

    /// Forgets every tracked address. Pending deltas are kept.
    pub fn reset_all(&mut self) {
        debug!("Resetting {} tracked addresses", self.table.len());
        self.table.clear();
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_total
    }

    pub fn tracked(&self) -> usize {
        self.table.len()
    }

    pub fn bytes_for(&self, address: &str) -> Option<u64> {
        self.table.get(address).copied()
    }

    /// Most recent console lines, oldest first.
    pub fn console_lines(&self) -> Vec<ConsoleLine> {
        self.console.iter().cloned().collect()
    }

    fn push_console_line(&mut self, text: String) {
        if self.console_lines == 0 {
            return;
        }
        self.console.push_back(ConsoleLine {
            id: self.next_line_id,
            text,
        });
        self.next_line_id += 1;
        while self.console.len() > self.console_lines {
            self.console.pop_front();
        }
    }
}

fn by_bytes_desc(a: &(String, u64), b: &(String, u64)) -> Ordering {
    b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}
