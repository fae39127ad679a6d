//! # Hybrid Store
//!
//! The top-level façade over the LSM engine: a typed, `u32`-keyed
//! convenience layer that pairs a [`BackgroundEngine`] (write path plus
//! flush/compaction workers) with an in-memory [`BPlusTree128`] acting
//! as a read-optimized cache.
//!
//! `put`/`delete`/`delete_range` go straight to the background engine.
//! `get` first consults the B+ tree under its mutex; on a miss it falls
//! through to the engine. `scan` collects from both the tree and the
//! engine and, for any key present in both, keeps the engine's value —
//! the tree is a best-effort cache that can lag the engine between sync
//! ticks, so the engine's view always wins on overlap.
//!
//! A background syncer thread periodically takes a full snapshot of the
//! engine's live keyspace and upserts it into the tree, in 100 ms ticks
//! so that [`Store::close`] doesn't have to wait out a long interval to
//! shut the thread down. Only one sync runs at a time, guarded by an
//! `AtomicBool`.
//!
//! Grounded on `examples/original_source/C++/Database/src/database/
//! database.{h,cpp}` for the tree-then-engine read path, the
//! single-flight sync guard, and the ticked syncer thread.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::btree::BPlusTree128;
use crate::engine::background::BackgroundEngine;
use crate::engine::{Engine, EngineConfig, EngineError};

/// How often the syncer thread checks the shutdown flag between ticks.
const SYNC_TICK: Duration = Duration::from_millis(100);

/// Errors raised by [`Store`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An error from the underlying engine (manifest, memtable, SSTable,
    /// or I/O).
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The store has already been closed.
    #[error("operation attempted on a closed store")]
    Closed,
}

/// Configuration for a [`Store`].
#[derive(Clone)]
pub struct StoreConfig {
    /// Configuration forwarded to the underlying [`Engine`].
    pub engine: EngineConfig,

    /// How often the background syncer refreshes the B+ tree cache from
    /// the engine, in milliseconds. Ticked in 100 ms slices internally
    /// so shutdown doesn't have to wait out the whole interval.
    pub sync_interval_ms: u64,
}

/// Hybrid key-value store: an LSM engine plus a B+ tree read cache.
///
/// Keys are `u32`, encoded big-endian so that byte-lexicographic order
/// (what the engine and its SSTables compare by) matches numeric order.
/// Values are opaque `Vec<u8>`.
pub struct Store {
    background: BackgroundEngine,
    index: Arc<Mutex<BPlusTree128<u32, Vec<u8>>>>,
    sync_in_progress: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    syncer: Option<JoinHandle<()>>,
}

fn key_to_bytes(key: u32) -> Vec<u8> {
    key.to_be_bytes().to_vec()
}

/// An exclusive upper bound in byte-key space one past `hi`, for use
/// with the engine's half-open `scan`. `hi == u32::MAX` has no encodable
/// successor, so it falls back to a 5-byte sentinel: a 4-byte all-`0xFF`
/// key (the encoding of `u32::MAX`) compares as a strict prefix of it,
/// and therefore less than it.
fn inclusive_upper_bound_bytes(hi: u32) -> Vec<u8> {
    match hi.checked_add(1) {
        Some(next) => key_to_bytes(next),
        None => vec![0xFF; 5],
    }
}

impl Store {
    /// Opens (or creates) a store rooted at `path`.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let engine = Engine::open(path, config.engine.clone())?;
        let background = BackgroundEngine::spawn(engine, &config.engine);

        let index: Arc<Mutex<BPlusTree128<u32, Vec<u8>>>> =
            Arc::new(Mutex::new(BPlusTree128::new()));
        let sync_in_progress = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let syncer = {
            let engine = background.engine().clone();
            let index = Arc::clone(&index);
            let sync_in_progress = Arc::clone(&sync_in_progress);
            let shutdown = Arc::clone(&shutdown);
            let interval = Duration::from_millis(config.sync_interval_ms);
            thread::spawn(move || syncer_loop(engine, index, sync_in_progress, shutdown, interval))
        };

        Ok(Self {
            background,
            index,
            sync_in_progress,
            shutdown,
            syncer: Some(syncer),
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Inserts or overwrites `key` with `value`.
    pub fn put(&self, key: u32, value: Vec<u8>) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.background.engine().put(key_to_bytes(key), value)? {
            self.background.notify_flush();
        }
        Ok(())
    }

    /// Deletes `key` (inserts a point tombstone).
    pub fn delete(&self, key: u32) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.background.engine().delete(key_to_bytes(key))? {
            self.background.notify_flush();
        }
        Ok(())
    }

    /// Deletes every key in `[lo, hi)` (inserts a range tombstone).
    pub fn delete_range(&self, lo: u32, hi: u32) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self
            .background
            .engine()
            .delete_range(key_to_bytes(lo), key_to_bytes(hi))?
        {
            self.background.notify_flush();
        }
        Ok(())
    }

    /// Looks up `key`.
    ///
    /// Consults the B+ tree cache first; on a miss, falls through to the
    /// engine. The tree only ever holds what the last sync tick observed,
    /// so a key written since then and not yet synced is still found via
    /// the engine fallback.
    pub fn get(&self, key: u32) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;

        if let Some(value) = self
            .index
            .lock()
            .map_err(|_| EngineError::Internal("B+ tree mutex poisoned".into()))?
            .find(&key)
        {
            return Ok(Some(value.clone()));
        }

        Ok(self.background.engine().get(key_to_bytes(key))?)
    }

    /// Returns every live key/value pair with `lo <= key <= hi`, in
    /// ascending key order.
    ///
    /// Collects from the B+ tree and the engine; where both have an
    /// entry for the same key, the engine's value wins, since the tree
    /// can lag behind the engine's current state by up to one sync tick.
    pub fn scan(&self, lo: u32, hi: u32) -> Result<Vec<(u32, Vec<u8>)>, StoreError> {
        self.ensure_open()?;

        if lo > hi {
            return Ok(Vec::new());
        }

        let mut merged: BTreeMap<u32, Vec<u8>> = {
            let tree = self
                .index
                .lock()
                .map_err(|_| EngineError::Internal("B+ tree mutex poisoned".into()))?;
            tree.range(&lo, &hi).into_iter().collect()
        };

        let lo_bytes = key_to_bytes(lo);
        let hi_bytes = inclusive_upper_bound_bytes(hi);
        for (key_bytes, value) in self.background.engine().scan(&lo_bytes, &hi_bytes)? {
            if key_bytes.len() != 4 {
                continue;
            }
            let key = u32::from_be_bytes(key_bytes.try_into().unwrap());
            merged.insert(key, value);
        }

        Ok(merged.into_iter().collect())
    }

    /// Takes a full snapshot of the engine's live keyspace and upserts
    /// it into the B+ tree. A no-op if a sync is already running.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        run_sync(self.background.engine(), &self.index, &self.sync_in_progress)
    }

    /// Runs one round of compaction.
    ///
    /// `level` is accepted for API parity with the spec's contract but
    /// is otherwise advisory: size-tiered compaction has no notion of
    /// levels, and leveled compaction picks its own victim level from
    /// whichever level currently exceeds its bound.
    pub fn compact(&self, _level: usize, major: bool) -> Result<(), StoreError> {
        self.ensure_open()?;
        if major {
            self.background.engine().major_compact()?;
        } else {
            self.background.engine().minor_compact()?;
        }
        Ok(())
    }

    /// Stops the syncer and background engine threads, then flushes and
    /// checkpoints the engine. Idempotent.
    pub fn close(&mut self) -> Result<(), StoreError> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = self.syncer.take() {
            let _ = handle.join();
        }

        self.background.shutdown();
        self.background.engine().close()?;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Single-flight sync: skips the round entirely if one is already in
/// progress, matching the reference engine's `syncInProgress` guarantee.
fn run_sync(
    engine: &Engine,
    index: &Mutex<BPlusTree128<u32, Vec<u8>>>,
    in_progress: &AtomicBool,
) -> Result<(), StoreError> {
    if in_progress
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    let result = (|| -> Result<(), StoreError> {
        let mut tree = index
            .lock()
            .map_err(|_| EngineError::Internal("B+ tree mutex poisoned".into()))?;
        for (key_bytes, value) in engine.scan_all()? {
            if key_bytes.len() != 4 {
                continue;
            }
            let key = u32::from_be_bytes(key_bytes.try_into().unwrap());
            tree.insert(key, value);
        }
        Ok(())
    })();

    in_progress.store(false, Ordering::SeqCst);
    result
}

fn syncer_loop(
    engine: Engine,
    index: Arc<Mutex<BPlusTree128<u32, Vec<u8>>>>,
    in_progress: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut elapsed = Duration::ZERO;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(SYNC_TICK);
        elapsed += SYNC_TICK;

        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        if elapsed >= interval {
            elapsed = Duration::ZERO;
            if let Err(e) = run_sync(&engine, &index, &in_progress) {
                warn!(%e, "hybrid store syncer: sync failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactionStrategyType;
    use std::time::Instant;

    fn test_config(sync_interval_ms: u64) -> StoreConfig {
        StoreConfig {
            engine: EngineConfig {
                write_buffer_size: 1024 * 1024,
                compaction_strategy: CompactionStrategyType::Stcs,
                bucket_low: 0.5,
                bucket_high: 1.5,
                min_sstable_size: 50,
                min_threshold: 4,
                max_threshold: 32,
                tombstone_ratio_threshold: 0.3,
                tombstone_compaction_interval: 0,
                tombstone_bloom_fallback: true,
                tombstone_range_drop: true,
                thread_pool_size: 2,
                leveled_level_bounds: [4, 10, 100, 1000],
                leveled_max_sstable_size: 256 * 1024 * 1024,
            },
            sync_interval_ms,
        }
    }

    fn fresh_dir(name: &str) -> String {
        let path = format!("/tmp/aeternusdb_test_store_{name}");
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    /// # Scenario
    /// Basic round trip: insert three keys, point-read one, range-scan
    /// all of them.
    ///
    /// # Expected behavior
    /// `get` returns the right value and `scan` returns all three in
    /// ascending key order.
    #[test]
    fn basic_round_trip() {
        let dir = fresh_dir("basic");
        let store = Store::open(&dir, test_config(5000)).unwrap();

        store.put(1, b"a".to_vec()).unwrap();
        store.put(2, b"b".to_vec()).unwrap();
        store.put(3, b"c".to_vec()).unwrap();

        assert_eq!(store.get(2).unwrap(), Some(b"b".to_vec()));

        let scanned = store.scan(1, 3).unwrap();
        assert_eq!(
            scanned,
            vec![
                (1, b"a".to_vec()),
                (2, b"b".to_vec()),
                (3, b"c".to_vec())
            ]
        );
    }

    /// # Scenario
    /// Overwrite a key after a flush, then force a sync before reading.
    ///
    /// # Expected behavior
    /// `get` sees the latest value both before and after `sync` runs.
    #[test]
    fn overwrite_survives_flush_and_sync() {
        let dir = fresh_dir("overwrite");
        let store = Store::open(&dir, test_config(60_000));

        let store = store.unwrap();
        store.put(42, b"x".to_vec()).unwrap();
        // Explicit engine flush via the underlying handle: no public
        // flush on Store itself (the background worker drains on its
        // own timer), so drive it directly for a deterministic test.
        store.background.engine().flush_all_frozen().unwrap();
        store.put(42, b"y".to_vec()).unwrap();

        assert_eq!(store.get(42).unwrap(), Some(b"y".to_vec()));
        store.sync().unwrap();
        assert_eq!(store.get(42).unwrap(), Some(b"y".to_vec()));
    }

    /// # Scenario
    /// A range spanning a flushed batch and a later overwrite of one key
    /// within that range.
    ///
    /// # Expected behavior
    /// The scan returns 21 pairs for `[40, 60]`, with key 50 resolving
    /// to the newer value.
    #[test]
    fn range_merge_prefers_newest_value() {
        let dir = fresh_dir("range_merge");
        let store = Store::open(&dir, test_config(60_000)).unwrap();

        for k in 0..100u32 {
            store.put(k, format!("v{k}").into_bytes()).unwrap();
        }
        store.background.engine().flush_all_frozen().unwrap();
        store.put(50, b"NEW".to_vec()).unwrap();

        let scanned = store.scan(40, 60).unwrap();
        assert_eq!(scanned.len(), 21);
        let (_, v) = scanned.iter().find(|(k, _)| *k == 50).unwrap();
        assert_eq!(v, b"NEW");
    }

    /// # Scenario
    /// `get` on a key that only exists in the B+ tree cache (via an
    /// explicit sync) and not freshly in the active memtable.
    ///
    /// # Expected behavior
    /// The cached value is returned without touching the engine path.
    #[test]
    fn get_falls_back_from_cache_miss_to_engine() {
        let dir = fresh_dir("cache_fallback");
        let store = Store::open(&dir, test_config(60_000)).unwrap();

        store.put(7, b"seven".to_vec()).unwrap();
        assert_eq!(store.get(7).unwrap(), Some(b"seven".to_vec()));

        store.sync().unwrap();
        assert_eq!(store.get(7).unwrap(), Some(b"seven".to_vec()));

        // A key never written returns None through both paths.
        assert_eq!(store.get(999).unwrap(), None);
    }

    /// # Scenario
    /// A short sync interval lets the background syncer run at least
    /// once without any explicit `sync()` call.
    ///
    /// # Expected behavior
    /// After waiting past the interval, the B+ tree cache has picked up
    /// a key written before the wait.
    #[test]
    fn background_syncer_refreshes_cache() {
        let dir = fresh_dir("bg_syncer");
        let store = Store::open(&dir, test_config(150)).unwrap();

        store.put(5, b"five".to_vec()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if store.index.lock().unwrap().find(&5).is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "background syncer never ran");
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// # Scenario
    /// Delete a key, then range-delete a span covering another key.
    ///
    /// # Expected behavior
    /// Both deleted keys are absent from subsequent `get`/`scan` calls.
    #[test]
    fn delete_and_delete_range_are_honored() {
        let dir = fresh_dir("delete");
        let store = Store::open(&dir, test_config(60_000)).unwrap();

        for k in 0..10u32 {
            store.put(k, vec![k as u8]).unwrap();
        }
        store.delete(3).unwrap();
        store.delete_range(5, 8).unwrap();

        assert_eq!(store.get(3).unwrap(), None);
        let scanned = store.scan(0, 9).unwrap();
        let keys: Vec<u32> = scanned.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![0, 1, 2, 4, 8, 9]);
    }

    /// # Scenario
    /// `close` is called twice and operations after close are rejected.
    ///
    /// # Expected behavior
    /// The second `close` is a no-op and `put`/`get` after close return
    /// [`StoreError::Closed`].
    #[test]
    fn close_is_idempotent_and_rejects_further_operations() {
        let dir = fresh_dir("close");
        let mut store = Store::open(&dir, test_config(60_000)).unwrap();
        store.put(1, b"a".to_vec()).unwrap();

        store.close().unwrap();
        store.close().unwrap();

        assert!(matches!(
            store.put(2, b"b".to_vec()),
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.get(1), Err(StoreError::Closed)));
    }

    /// # Scenario
    /// Close returns promptly even with a long sync interval configured.
    ///
    /// # Expected behavior
    /// `close` returns well within one syncer tick plus drain time, not
    /// the full configured interval.
    #[test]
    fn close_returns_promptly_despite_long_sync_interval() {
        let dir = fresh_dir("close_prompt");
        let mut store = Store::open(&dir, test_config(60_000)).unwrap();
        store.put(1, b"a".to_vec()).unwrap();

        let start = Instant::now();
        store.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    /// # Scenario
    /// An empty or inverted range is queried.
    ///
    /// # Expected behavior
    /// `scan(lo, hi)` with `lo > hi` returns an empty result rather than
    /// erroring or panicking.
    #[test]
    fn scan_with_inverted_range_is_empty() {
        let dir = fresh_dir("inverted");
        let store = Store::open(&dir, test_config(60_000)).unwrap();
        store.put(5, b"v".to_vec()).unwrap();
        assert!(store.scan(10, 1).unwrap().is_empty());
    }
}
