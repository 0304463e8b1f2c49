use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::runtime::Runtime;
use tracing::info;

use crate::{
    config::DashboardConfig,
    error::DashboardError,
    geo::{GeoCache, GeoResolver, IpApiResolver},
    ingest::{spawn_ingest, IngestStats},
    pipeline::{PipelineStats, TrafficPipeline},
    sink::DashboardSink,
    threads::ThreadManager,
};

pub struct Dashboard {
    config: DashboardConfig,
    runtime: Arc<Runtime>,
    resolver: Option<Arc<dyn GeoResolver>>,
    thread_manager: ThreadManager,
    pipeline: Option<TrafficPipeline>,
    geo: Option<Arc<GeoCache>>,
    ingest_stats: Arc<IngestStats>,
    shutdown_initiated: AtomicBool,
}

impl Dashboard {
    pub fn new(config: DashboardConfig, runtime: Arc<Runtime>) -> Result<Self, DashboardError> {
        config.validate()?;
        Ok(Self {
            config,
            runtime,
            resolver: None,
            thread_manager: ThreadManager::new(),
            pipeline: None,
            geo: None,
            ingest_stats: Arc::new(IngestStats::default()),
            shutdown_initiated: AtomicBool::new(false),
        })
    }

    /// Replaces the default ip-api.com resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn GeoResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn start(&mut self, sink: Arc<dyn DashboardSink>) -> Result<(), DashboardError> {
        if self.pipeline.is_some() {
            return Err(DashboardError::Config("dashboard already started".into()));
        }
        info!("Starting traffic dashboard...");

        let resolver: Arc<dyn GeoResolver> = match &self.resolver {
            Some(resolver) => resolver.clone(),
            None => Arc::new(IpApiResolver::new(&self.config.geo)?),
        };
        let geo = Arc::new(GeoCache::new(
            &self.config.geo,
            resolver,
            self.runtime.handle().clone(),
        ));

        let (event_sender, event_receiver) =
            crossbeam_channel::bounded(self.config.event_channel_capacity);

        info!("Starting aggregator...");
        let mut pipeline = TrafficPipeline::new(
            self.config.aggregator.clone(),
            self.config.ticks.clone(),
        );
        pipeline.start(
            event_receiver,
            geo.clone(),
            sink,
            self.ingest_stats.clone(),
            self.runtime.handle().clone(),
        )?;
        self.pipeline = Some(pipeline);
        self.geo = Some(geo);

        info!("Starting ingest...");
        spawn_ingest(
            &mut self.thread_manager,
            &self.config.ingest,
            event_sender,
            self.ingest_stats.clone(),
        )?;

        info!("Traffic dashboard running");
        Ok(())
    }

    pub fn geo_cache(&self) -> Option<Arc<GeoCache>> {
        self.geo.clone()
    }

    pub fn pipeline_stats(&self) -> Option<Arc<PipelineStats>> {
        self.pipeline.as_ref().map(TrafficPipeline::stats)
    }

    pub fn ingest_stats(&self) -> Arc<IngestStats> {
        self.ingest_stats.clone()
    }

    pub fn shutdown(&mut self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating shutdown sequence");

            // Ingest first so the aggregator sees no new events while stopping.
            info!("Shutting down ingest");
            self.thread_manager.shutdown();

            if let Some(mut pipeline) = self.pipeline.take() {
                pipeline.shutdown();
            }

            info!("Shutdown complete");
        }
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.shutdown();
    }
}
