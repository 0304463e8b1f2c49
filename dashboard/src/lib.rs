use std::sync::Arc;

use tokio::runtime::Runtime;

pub mod aggregator;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod geo;
pub mod ingest;
pub mod pipeline;
pub mod sink;
pub mod threads;
pub mod types;
pub mod utils;

pub use aggregator::TrafficAggregator;
pub use config::DashboardConfig;
pub use dashboard::Dashboard;
pub use error::DashboardError;
pub use geo::{GeoCache, GeoLookup, GeoResolver};
pub use sink::{DashboardSink, LatestFrames, LogSink};
pub use types::{ConsoleLine, GeoRecord, GeoStatus, MapPoint, PacketEvent, TopTalkers, Transport};

/// Starts ingest and aggregation with the default geolocation resolver.
pub fn run(
    config: DashboardConfig,
    runtime: Arc<Runtime>,
    sink: Arc<dyn DashboardSink>,
) -> Result<Dashboard, DashboardError> {
    let mut dashboard = Dashboard::new(config, runtime)?;
    dashboard.start(sink)?;
    Ok(dashboard)
}
