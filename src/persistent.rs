//! Persistent tier (L3) with a write-behind buffer and periodic flush
//!
//! Writes land in an in-memory buffer and are flushed to disk by a
//! background sync task; the write path never performs synchronous file
//! I/O. One JSON record is kept per key, named by a fixed-width hex digest
//! of the qualified key so arbitrary key text cannot influence the path.
//! Every I/O failure is routed to the injected error handler and degrades
//! to a miss or no-op; it is never surfaced through `get`/`set`.

use crate::config::PersistentConfig;
use crate::entry::CacheEntry;
use crate::error::{CacheError, ErrorHandler, Result};
use crate::metrics::TierMetrics;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Concurrent file writes per flush cycle
const FLUSH_FANOUT: usize = 8;

/// Disk-backed cold tier
pub struct PersistentTier {
    config: PersistentConfig,
    state: Arc<RwLock<PersistentState>>,
    error_handler: ErrorHandler,
    sync_task: Mutex<Option<SyncTask>>,
}

struct SyncTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Buffer, dirty set, and index of keys known to be on disk
struct PersistentState {
    /// Write-behind buffer: state that has not reached disk yet. Flushed
    /// entries leave the buffer; their records are read back on demand.
    buffer: HashMap<String, CacheEntry>,

    /// Keys whose buffered state has not reached disk yet
    dirty: HashSet<String>,

    /// Qualified key -> namespace for every persisted record
    index: HashMap<String, String>,

    hits: u64,
    misses: u64,
    expirations: u64,
}

impl PersistentTier {
    pub fn new(config: PersistentConfig, error_handler: ErrorHandler) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(PersistentState {
                buffer: HashMap::new(),
                dirty: HashSet::new(),
                index: HashMap::new(),
                hits: 0,
                misses: 0,
                expirations: 0,
            })),
            error_handler,
            sync_task: Mutex::new(None),
        }
    }

    /// Ensure the storage directory exists, build the index of persisted
    /// keys, and start the periodic sync task. Calling twice is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let mut task_slot = self.sync_task.lock().await;
        if task_slot.is_some() {
            return Ok(());
        }

        let root = &self.config.storage_location;
        tokio::fs::create_dir_all(root).await?;

        let mut index = HashMap::new();
        let mut dir = tokio::fs::read_dir(root).await?;
        loop {
            match dir.next_entry().await {
                Ok(Some(item)) => {
                    let path = item.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    match read_record(&path).await {
                        Ok(entry) => {
                            index.insert(entry.key, entry.namespace);
                        }
                        Err(err) => {
                            // Corrupted records are not fatal; they just
                            // never resurface
                            debug!("skipping unreadable record {:?}: {}", path, err);
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    (self.error_handler)(&CacheError::Io(err));
                    break;
                }
            }
        }

        info!(
            "persistent tier initialized at {:?} with {} records",
            root,
            index.len()
        );
        self.state.write().await.index = index;

        let (stop, mut stop_rx) = watch::channel(false);
        let state = Arc::clone(&self.state);
        let root = self.config.storage_location.clone();
        let handler = Arc::clone(&self.error_handler);
        let interval = self.config.sync_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let flushed = flush_dirty(&state, &root, &handler).await;
                        if flushed > 0 {
                            debug!("sync cycle flushed {} records", flushed);
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *task_slot = Some(SyncTask { stop, handle });
        Ok(())
    }

    /// Look up a qualified key: buffer first (most recent state), then the
    /// backing record. A disk hit is copied into the buffer with refreshed
    /// access stats and marked dirty, so repeated cold reads become cheap
    /// and their recency is captured for future promotion decisions.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        {
            let mut state = self.state.write().await;
            match state.buffer.get(key).map(|e| e.is_expired()) {
                Some(true) => {
                    state.misses += 1;
                    state.expirations += 1;
                    Self::forget_locked(&mut state, key);
                    self.unlink_later(key);
                    return None;
                }
                Some(false) => {
                    let entry = state.buffer.get_mut(key).map(|e| {
                        e.mark_accessed();
                        e.clone()
                    });
                    if let Some(entry) = entry {
                        state.dirty.insert(key.to_string());
                        state.hits += 1;
                        return Some(entry);
                    }
                }
                None => {}
            }
            if !state.index.contains_key(key) {
                state.misses += 1;
                return None;
            }
        }

        // Not buffered but indexed: read from disk outside the lock
        let path = self.path_for(key);
        match read_record(&path).await {
            Ok(entry) if entry.is_expired() => {
                let mut state = self.state.write().await;
                state.misses += 1;
                state.expirations += 1;
                Self::forget_locked(&mut state, key);
                drop(state);
                self.unlink_later(key);
                None
            }
            Ok(mut entry) => {
                entry.mark_accessed();
                let mut state = self.state.write().await;
                state.buffer.insert(key.to_string(), entry.clone());
                state.dirty.insert(key.to_string());
                state.hits += 1;
                Some(entry)
            }
            Err(err) => {
                (self.error_handler)(&err);
                let mut state = self.state.write().await;
                state.misses += 1;
                if matches!(err, CacheError::Serialization(_)) {
                    // Corrupted record: treated as absent, no retry
                    Self::forget_locked(&mut state, key);
                }
                None
            }
        }
    }

    /// Stage an entry in the write-behind buffer. Always accepted; the
    /// record reaches disk on the next flush cycle.
    pub async fn set(&self, entry: CacheEntry) {
        let mut state = self.state.write().await;
        state.dirty.insert(entry.key.clone());
        state.buffer.insert(entry.key.clone(), entry);
    }

    /// Remove a qualified key from buffer and index; the backing record is
    /// unlinked asynchronously and unlink failures are swallowed.
    pub async fn delete(&self, key: &str) -> bool {
        let mut state = self.state.write().await;
        let present = Self::forget_locked(&mut state, key);
        drop(state);
        if present {
            self.unlink_later(key);
        }
        present
    }

    /// Membership check against buffer and index, without touching disk or
    /// access stats
    pub async fn has(&self, key: &str) -> bool {
        let state = self.state.read().await;
        match state.buffer.get(key) {
            Some(entry) => !entry.is_expired(),
            None => state.index.contains_key(key),
        }
    }

    /// Write every dirty key to disk, returning how many records landed.
    /// Failed writes stay dirty and are retried on the next cycle; there is
    /// no all-or-nothing guarantee across a batch.
    pub async fn flush(&self) -> usize {
        flush_dirty(
            &self.state,
            &self.config.storage_location,
            &self.error_handler,
        )
        .await
    }

    /// Merge the buffer with a directory scan. Keys covered by the buffer
    /// win; corrupted or expired records are silently skipped.
    pub async fn get_all(&self) -> Vec<CacheEntry> {
        let (mut entries, buffered): (Vec<CacheEntry>, HashSet<String>) = {
            let state = self.state.read().await;
            (
                state
                    .buffer
                    .values()
                    .filter(|e| !e.is_expired())
                    .cloned()
                    .collect(),
                state.buffer.keys().cloned().collect(),
            )
        };

        let mut dir = match tokio::fs::read_dir(&self.config.storage_location).await {
            Ok(dir) => dir,
            Err(err) => {
                (self.error_handler)(&CacheError::Io(err));
                return entries;
            }
        };

        loop {
            match dir.next_entry().await {
                Ok(Some(item)) => {
                    let path = item.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    match read_record(&path).await {
                        Ok(entry) => {
                            if !buffered.contains(&entry.key) && !entry.is_expired() {
                                entries.push(entry);
                            }
                        }
                        Err(err) => debug!("skipping record {:?}: {}", path, err),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    (self.error_handler)(&CacheError::Io(err));
                    break;
                }
            }
        }

        entries
    }

    /// Remove every key under one namespace, returning the count removed.
    /// Scoping matches the entry's namespace field, never a key prefix, so
    /// namespaces containing `:` stay isolated from each other.
    pub async fn clear_namespace(&self, namespace: &str) -> usize {
        let keys: HashSet<String> = {
            let mut state = self.state.write().await;
            let keys: HashSet<String> = state
                .buffer
                .iter()
                .filter(|(_, e)| e.namespace == namespace)
                .map(|(k, _)| k.clone())
                .chain(
                    state
                        .index
                        .iter()
                        .filter(|(_, ns)| ns.as_str() == namespace)
                        .map(|(k, _)| k.clone()),
                )
                .collect();
            for key in &keys {
                Self::forget_locked(&mut state, key);
            }
            keys
        };

        for key in &keys {
            self.unlink_later(key);
        }
        keys.len()
    }

    /// Counters and gauges. Entry count covers buffer plus index; byte and
    /// access-pattern gauges cover the buffer only (the disk side is not
    /// scanned for a metrics call).
    pub async fn metrics(&self) -> TierMetrics {
        let state = self.state.read().await;
        let buffered = state.buffer.len();
        let indexed_only = state
            .index
            .keys()
            .filter(|k| !state.buffer.contains_key(*k))
            .count();

        let avg_access_count = if buffered > 0 {
            state.buffer.values().map(|e| e.access_count).sum::<u64>() as f64 / buffered as f64
        } else {
            0.0
        };

        let oldest_entry_age_secs = state
            .buffer
            .values()
            .map(|e| e.age().as_secs_f64())
            .fold(0.0, f64::max);

        TierMetrics {
            entries: buffered + indexed_only,
            memory_bytes: state.buffer.values().map(|e| e.size_bytes).sum(),
            hits: state.hits,
            misses: state.misses,
            evictions: 0,
            expirations: state.expirations,
            avg_access_count,
            oldest_entry_age_secs,
        }
    }

    /// Stop the sync task and perform one final flush. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(task) = self.sync_task.lock().await.take() {
            let _ = task.stop.send(true);
            if let Err(err) = task.handle.await {
                warn!("sync task did not stop cleanly: {}", err);
            }
        }
        let flushed = self.flush().await;
        debug!("final flush wrote {} records", flushed);
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.config.storage_location.join(storage_filename(key))
    }

    fn unlink_later(&self, key: &str) {
        let path = self.path_for(key);
        tokio::spawn(async move {
            let _ = tokio::fs::remove_file(path).await;
        });
    }

    fn forget_locked(state: &mut PersistentState, key: &str) -> bool {
        let buffered = state.buffer.remove(key).is_some();
        state.dirty.remove(key);
        let indexed = state.index.remove(key).is_some();
        buffered || indexed
    }
}

/// Fixed-width, filesystem-safe record name derived from the qualified key
fn storage_filename(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    name.push_str(".json");
    name
}

async fn read_record(path: &Path) -> Result<CacheEntry> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| CacheError::Serialization(e.to_string()))
}

async fn write_record(root: &Path, entry: &CacheEntry) -> Result<()> {
    let bytes =
        serde_json::to_vec(entry).map_err(|e| CacheError::Serialization(e.to_string()))?;
    let final_path = root.join(storage_filename(&entry.key));
    // Unique tmp name per write so overlapping flushes of the same key
    // never share a partially written file
    let tmp_path =
        final_path.with_extension(format!("json.{:08x}.tmp", rand::random::<u32>()));
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

/// Flush every dirty key concurrently (bounded fan-out). The dirty set is
/// drained up front, so overlapping flush calls never write the same
/// snapshot twice; a write that lands during the flush simply re-dirties
/// its key. Successfully written entries join the index and leave the
/// buffer (unless re-dirtied in the meantime); failures go back on the
/// dirty set for the next cycle.
async fn flush_dirty(
    state: &Arc<RwLock<PersistentState>>,
    root: &Path,
    handler: &ErrorHandler,
) -> usize {
    let pending: Vec<CacheEntry> = {
        let mut state = state.write().await;
        let keys: Vec<String> = state.dirty.drain().collect();
        keys.iter()
            .filter_map(|key| state.buffer.get(key).cloned())
            .collect()
    };

    if pending.is_empty() {
        return 0;
    }

    let results: Vec<(String, String, Result<()>)> =
        futures::stream::iter(pending.into_iter().map(|entry| {
            let root = root.to_path_buf();
            async move {
                let key = entry.key.clone();
                let namespace = entry.namespace.clone();
                let result = write_record(&root, &entry).await;
                (key, namespace, result)
            }
        }))
        .buffer_unordered(FLUSH_FANOUT)
        .collect()
        .await;

    let mut state = state.write().await;
    let mut flushed = 0;
    for (key, namespace, result) in results {
        match result {
            Ok(()) => {
                // The buffer holds only unflushed state; a key rewritten
                // while the flush was in flight keeps its newer copy
                if !state.dirty.contains(&key) {
                    state.buffer.remove(&key);
                }
                state.index.insert(key, namespace);
                flushed += 1;
            }
            Err(err) => {
                handler(&err);
                state.dirty.insert(key);
            }
        }
    }
    flushed
}
