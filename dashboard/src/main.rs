use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use traffic_dashboard::{DashboardConfig, DashboardError, LogSink};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Dashboard failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), DashboardError> {
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, term.clone())?;
    signal_hook::flag::register(SIGTERM, term.clone())?;

    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("geo-lookup")
            .enable_all()
            .build()?,
    );

    let config = DashboardConfig::from_env();
    let mut dashboard = traffic_dashboard::run(config, runtime, Arc::new(LogSink::new()))?;

    while !term.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("Received termination signal");
    dashboard.shutdown();
    Ok(())
}
