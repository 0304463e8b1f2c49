use crossbeam_channel::{Receiver, Sender};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::error::DashboardError;

struct Worker {
    handle: JoinHandle<()>,
    name: String,
}

impl Worker {
    fn join(self) {
        if let Err(e) = self.handle.join() {
            error!("Worker {} panicked: {:?}", self.name, e);
        } else {
            debug!("Worker {} exited", self.name);
        }
    }
}

/// Owns the dashboard's worker threads.
///
/// Workers get the shared exit flag and a shutdown receiver. The sender is
/// dropped on shutdown, so every receiver disconnects at once and any
/// `select!` waiting on it wakes up.
pub struct ThreadManager {
    exit: Arc<AtomicBool>,
    shutdown_sender: Option<Sender<()>>,
    shutdown_receiver: Receiver<()>,
    workers: Vec<Worker>,
}

impl ThreadManager {
    pub fn new() -> Self {
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(0);

        Self {
            exit: Arc::new(AtomicBool::new(false)),
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver,
            workers: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, name: &str, f: F) -> Result<(), DashboardError>
    where
        F: FnOnce(Arc<AtomicBool>, Receiver<()>) + Send + 'static,
    {
        let exit = self.exit.clone();
        let shutdown_rx = self.shutdown_receiver.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(exit, shutdown_rx))?;

        self.workers.push(Worker {
            handle,
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn shutdown(&mut self) {
        let Some(sender) = self.shutdown_sender.take() else {
            return;
        };

        info!("Stopping {} worker threads", self.workers.len());
        self.exit.store(true, Ordering::SeqCst);
        drop(sender);

        while let Some(worker) = self.workers.pop() {
            worker.join();
        }
    }

    pub fn exit_signal(&self) -> Arc<AtomicBool> {
        self.exit.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_sender.is_some()
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
