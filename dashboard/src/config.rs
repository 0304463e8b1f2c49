use std::{ops::Range, time::Duration};

use crate::error::DashboardError;

pub const INGEST_ENV: &str = "TRAFFIC_DASHBOARD_INGEST";
pub const DEFAULT_INGEST_URL: &str = "ws://127.0.0.1:9002";
pub const DEFAULT_GEO_ENDPOINT: &str = "http://ip-api.com/json/";

#[derive(Clone, Debug)]
pub enum IngestConfig {
    /// Packet events from the capture process, one JSON document per WebSocket
    /// text or binary message.
    WebSocket {
        url: String,
        reconnect_delay: Duration,
    },
    /// Newline-delimited JSON packet events over a plain TCP stream.
    Tcp {
        endpoint: String,
        reconnect_delay: Duration,
    },
    /// Synthetic traffic, for running the dashboard without a capture process.
    Mock { interval_range: Range<Duration> },
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::WebSocket {
            url: DEFAULT_INGEST_URL.to_string(),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Max tracked addresses in the traffic table.
    pub capacity: usize,
    pub top_n_for_chart: usize,
    /// Console lines retained for display.
    pub console_lines: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            top_n_for_chart: 7,
            console_lines: 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TickConfig {
    pub snapshot_interval: Duration,
    pub delta_flush_interval: Duration,
    pub reset_interval: Duration,
    pub console_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_millis(1000),
            delta_flush_interval: Duration::from_millis(500),
            reset_interval: Duration::from_secs(30),
            console_interval: Duration::from_millis(100),
            stats_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GeoConfig {
    /// Base URL; the address is appended verbatim.
    pub endpoint: String,
    pub lookup_timeout: Duration,
    /// Cap on cached records. `None` grows without bound.
    pub max_entries: Option<usize>,
    /// Cooldown after which a failed record may be queried again. `None` never retries.
    pub failure_retry_after: Option<Duration>,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_GEO_ENDPOINT.to_string(),
            lookup_timeout: Duration::from_secs(5),
            max_entries: Some(10_000),
            failure_retry_after: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DashboardConfig {
    pub ingest: IngestConfig,
    pub aggregator: AggregatorConfig,
    pub ticks: TickConfig,
    pub geo: GeoConfig,
    pub event_channel_capacity: usize, // Default to 8192
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            aggregator: AggregatorConfig::default(),
            ticks: TickConfig::default(),
            geo: GeoConfig::default(),
            event_channel_capacity: 8192,
        }
    }
}

impl DashboardConfig {
    /// Defaults, with the ingest endpoint taken from `TRAFFIC_DASHBOARD_INGEST`
    /// (`ws://host:port`, `tcp://host:port`, a bare `host:port` for WebSocket,
    /// or `mock` for synthetic traffic).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(INGEST_ENV) {
            config.ingest = parse_ingest(&value);
        }
        config
    }

    pub fn validate(&self) -> Result<(), DashboardError> {
        if self.aggregator.capacity == 0 {
            return Err(DashboardError::Config("capacity must be positive".into()));
        }
        if self.aggregator.top_n_for_chart == 0 {
            return Err(DashboardError::Config(
                "top_n_for_chart must be positive".into(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(DashboardError::Config(
                "event_channel_capacity must be positive".into(),
            ));
        }

        let ticks = [
            ("snapshot_interval", self.ticks.snapshot_interval),
            ("delta_flush_interval", self.ticks.delta_flush_interval),
            ("reset_interval", self.ticks.reset_interval),
            ("console_interval", self.ticks.console_interval),
            ("stats_interval", self.ticks.stats_interval),
            ("lookup_timeout", self.geo.lookup_timeout),
        ];
        if let Some((name, _)) = ticks.iter().find(|(_, d)| d.is_zero()) {
            return Err(DashboardError::Config(format!("{name} must be non-zero")));
        }

        match &self.ingest {
            IngestConfig::WebSocket { url, .. } if !url.starts_with("ws://") => {
                return Err(DashboardError::Config(format!(
                    "unsupported ingest url {url}, expected ws://host:port"
                )));
            }
            IngestConfig::Mock { interval_range } if interval_range.start >= interval_range.end => {
                return Err(DashboardError::Config(
                    "mock interval range is empty".into(),
                ));
            }
            _ => {}
        }

        Ok(())
    }
}

fn parse_ingest(value: &str) -> IngestConfig {
    let value = value.trim();
    if value.eq_ignore_ascii_case("mock") {
        IngestConfig::Mock {
            interval_range: Duration::from_millis(200)..Duration::from_millis(1000),
        }
    } else if let Some(endpoint) = value.strip_prefix("tcp://") {
        IngestConfig::Tcp {
            endpoint: endpoint.to_string(),
            reconnect_delay: Duration::from_secs(1),
        }
    } else {
        let url = if value.contains("://") {
            value.to_string()
        } else {
            format!("ws://{value}")
        };
        IngestConfig::WebSocket {
            url,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_dashboard_tunables() {
        let config = DashboardConfig::default();
        assert_eq!(config.aggregator.capacity, 100);
        assert_eq!(config.aggregator.top_n_for_chart, 7);
        assert_eq!(config.ticks.snapshot_interval, Duration::from_millis(1000));
        assert_eq!(config.ticks.delta_flush_interval, Duration::from_millis(500));
        assert_eq!(config.ticks.reset_interval, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_capacity_and_intervals() {
        let mut config = DashboardConfig::default();
        config.aggregator.capacity = 0;
        assert!(matches!(config.validate(), Err(DashboardError::Config(_))));

        let mut config = DashboardConfig::default();
        config.ticks.delta_flush_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("delta_flush_interval"));
    }

    #[test]
    fn parses_ingest_values() {
        assert!(matches!(parse_ingest("mock"), IngestConfig::Mock { .. }));
        match parse_ingest(" 10.0.0.2:9002 ") {
            IngestConfig::WebSocket { url, .. } => assert_eq!(url, "ws://10.0.0.2:9002"),
            other => panic!("unexpected ingest config: {other:?}"),
        }
        match parse_ingest("ws://capture:9002") {
            IngestConfig::WebSocket { url, .. } => assert_eq!(url, "ws://capture:9002"),
            other => panic!("unexpected ingest config: {other:?}"),
        }
        match parse_ingest("tcp://10.0.0.2:9003") {
            IngestConfig::Tcp { endpoint, .. } => assert_eq!(endpoint, "10.0.0.2:9003"),
            other => panic!("unexpected ingest config: {other:?}"),
        }
    }

    #[test]
    fn rejects_non_ws_ingest_urls() {
        let config = DashboardConfig {
            ingest: parse_ingest("wss://capture:9002"),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wss://capture:9002"));
    }
}
