//! Background Purge Sweeper
//!
//! This module implements a background task that periodically evicts expired
//! entries from every segment. This is "eager" expiry, as opposed to the
//! "lazy" expiry that happens whenever an operation touches an expired key.
//!
//! ## Why Do We Need This?
//!
//! Lazy expiry only reclaims slots of keys that are accessed again. An entry
//! that goes idle and is never read would keep its slot forever; the sweeper
//! returns those slots to the allocator.
//!
//! ## Design
//!
//! The map is a synchronous embedded API, so the sweeper owns a small
//! dedicated Tokio runtime. The sweep task:
//! 1. Sleeps for the configured interval
//! 2. Purges the segments one at a time (never all locks at once)
//! 3. Logs how many entries were evicted
//!
//! A tick always runs to completion; shutdown is only observed between ticks.

use crate::error::{Error, Result};
use crate::storage::engine::MapCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Longest time `stop` waits for an in-progress sweep.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A handle to the running purge sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub(crate) struct PurgeSweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,

    /// Runtime driving the sweep task
    runtime: Option<Runtime>,
}

impl PurgeSweeper {
    /// Starts sweeping `core` every `interval`.
    pub(crate) fn start(core: Arc<MapCore>, interval: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bigmap-purge")
            .enable_time()
            .build()
            .map_err(Error::Sweeper)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        runtime.spawn(sweeper_loop(core, interval, shutdown_rx));

        info!(
            interval_ms = interval.as_millis() as u64,
            "Background purge sweeper started"
        );

        Ok(Self {
            shutdown_tx,
            runtime: Some(runtime),
        })
    }

    /// Stops the sweeper, letting a sweep that is in progress finish.
    ///
    /// Called from inside another Tokio runtime, where blocking is not
    /// allowed, the in-progress sweep finishes in the background instead.
    /// This is called automatically when the handle is dropped.
    pub(crate) fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = self.shutdown_tx.send(true);
            if tokio::runtime::Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(STOP_TIMEOUT);
            }
            info!("Background purge sweeper stopped");
        }
    }
}

impl Drop for PurgeSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweeper_loop(core: Arc<MapCore>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        // Wait for the interval or shutdown signal
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Purge sweeper received shutdown signal");
                    return;
                }
            }
        }

        if core.is_closed() {
            debug!("Map closed, purge sweeper exiting");
            return;
        }

        let entries_before = core.len();
        match core.purge() {
            Ok(purged) if purged > 0 => {
                debug!(
                    purged = purged,
                    entries_before = entries_before,
                    entries_remaining = core.len(),
                    "Expired entries purged"
                );
            }
            Ok(_) => trace!("Purge sweep found nothing to evict"),
            Err(e) => warn!(error = %e, "Purge sweep failed"),
        }
    }
}
