use log::{error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::writer::WriterStats;

/// Cooperative stop request shared by every capture worker.
///
/// Workers check the flag each loop iteration; the capture read timeout
/// bounds how long that takes with no traffic. Nothing is killed mid-read.
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl ShutdownFlag {
    /// Creates the flag and registers a SIGINT/SIGTERM handler that sets it.
    pub fn install() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&flag);
        if let Err(e) = ctrlc::set_handler(move || {
            info!("stop requested, draining");
            handler_flag.store(true, Ordering::SeqCst);
        }) {
            warn!("could not register signal handler: {e}");
        }
        ShutdownFlag { flag }
    }

    /// A flag with no signal handler, triggered programmatically. For tests.
    pub fn manual() -> Self {
        ShutdownFlag {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Orders the shutdown sequence: running -> draining -> stopped.
///
/// The fan-in channel must not close while any producer can still send, so
/// the coordinator joins every capture worker first. Each worker owns one of
/// the channel's only senders; when the last worker exits, the channel
/// disconnects by construction, the writer drains it, flushes the final
/// batch and returns. Joining the writer last guarantees that every record
/// sent before shutdown reaches a flushed batch (storage failures excepted,
/// by the writer's documented lossy policy).
pub struct Coordinator {
    workers: Vec<(String, JoinHandle<()>)>,
    writer: JoinHandle<WriterStats>,
}

impl Coordinator {
    pub fn new(workers: Vec<(String, JoinHandle<()>)>, writer: JoinHandle<WriterStats>) -> Self {
        Coordinator { workers, writer }
    }

    /// Blocks until the pipeline has fully drained. Returns the writer's
    /// final counters.
    pub fn wait(self) -> WriterStats {
        for (interface, handle) in self.workers {
            if handle.join().is_err() {
                error!("capture worker for {interface} panicked");
            }
        }
        info!("all capture workers stopped, waiting for the writer to drain");

        match self.writer.join() {
            Ok(stats) => {
                info!("shutdown complete");
                stats
            }
            Err(_) => {
                error!("batch writer panicked");
                WriterStats::default()
            }
        }
    }
}
