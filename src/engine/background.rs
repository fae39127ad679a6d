//! # Background Worker Model
//!
//! Wraps an [`Engine`] with two long-lived threads so callers never have
//! to flush or compact inline on the hot write path:
//!
//! - **Flush worker** — wakes on a signal (sent whenever `put`/`delete`/
//!   `delete_range` reports a freeze) or a periodic tick, whichever
//!   comes first, and drains every frozen memtable to disk.
//! - **Compaction worker** — ticks on a fixed interval, running one round
//!   of minor compaction and, once `tombstone_compaction_interval` has
//!   elapsed, one round of tombstone compaction.
//!
//! Wakeup uses a bounded `crossbeam` channel rather than a raw condvar:
//! the flush worker blocks in `recv_timeout`, which gives it both the
//! "wake immediately on signal" and "wake anyway after N ms" behavior
//! with a single primitive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use super::{Engine, EngineConfig};

/// How often the flush worker wakes even without an explicit signal.
const FLUSH_TICK: Duration = Duration::from_millis(50);

/// How often the compaction worker checks for overloaded buckets/levels.
const COMPACTION_TICK: Duration = Duration::from_millis(200);

/// An [`Engine`] plus its background flush and compaction threads.
///
/// Cloning an `Engine` is cheap (it's an `Arc<RwLock<_>>` handle), so
/// both worker threads and the [`BackgroundEngine`] itself share the
/// same underlying state.
pub struct BackgroundEngine {
    engine: Engine,
    shutdown: Arc<AtomicBool>,
    flush_tx: Sender<()>,
    flush_handle: Option<JoinHandle<()>>,
    compaction_handle: Option<JoinHandle<()>>,
}

impl BackgroundEngine {
    /// Spawns the flush and compaction worker threads for `engine`.
    pub fn spawn(engine: Engine, config: &EngineConfig) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (flush_tx, flush_rx) = channel::bounded::<()>(1);

        let flush_handle = {
            let engine = engine.clone();
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || flush_loop(engine, flush_rx, shutdown))
        };

        let tombstone_interval = Duration::from_secs(config.tombstone_compaction_interval as u64);
        let compaction_handle = {
            let engine = engine.clone();
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || compaction_loop(engine, shutdown, tombstone_interval))
        };

        Self {
            engine,
            shutdown,
            flush_tx,
            flush_handle: Some(flush_handle),
            compaction_handle: Some(compaction_handle),
        }
    }

    /// Handle to the wrapped engine, shared with the worker threads.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Wakes the flush worker immediately instead of waiting for its
    /// next periodic tick. Non-blocking: if a wakeup is already queued,
    /// this is a no-op.
    pub fn notify_flush(&self) {
        let _ = self.flush_tx.try_send(());
    }

    /// Signals both worker threads to stop and joins them.
    ///
    /// Idempotent — safe to call more than once (subsequent calls are
    /// no-ops since the join handles are only held once).
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.flush_tx.try_send(());

        if let Some(handle) = self.flush_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.compaction_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush_loop(engine: Engine, flush_rx: Receiver<()>, shutdown: Arc<AtomicBool>) {
    loop {
        match flush_rx.recv_timeout(FLUSH_TICK) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Err(e) = engine.flush_all_frozen() {
            warn!(%e, "background flush worker: flush failed");
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    // Drain anything left behind before the thread exits.
    if let Err(e) = engine.flush_all_frozen() {
        warn!(%e, "background flush worker: final drain failed");
    }
}

fn compaction_loop(engine: Engine, shutdown: Arc<AtomicBool>, tombstone_interval: Duration) {
    let mut last_tombstone_pass = Instant::now();

    loop {
        thread::sleep(COMPACTION_TICK);
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match engine.minor_compact() {
            Ok(ran) => debug!(ran, "background compaction worker: minor compaction tick"),
            Err(e) => warn!(%e, "background compaction worker: minor compaction failed"),
        }

        if !tombstone_interval.is_zero() && last_tombstone_pass.elapsed() >= tombstone_interval {
            last_tombstone_pass = Instant::now();
            match engine.tombstone_compact() {
                Ok(ran) => debug!(ran, "background compaction worker: tombstone compaction tick"),
                Err(e) => warn!(%e, "background compaction worker: tombstone compaction failed"),
            }
        }
    }
}
