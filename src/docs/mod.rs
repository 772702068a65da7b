pub mod ingest;
pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use anyhow::{Context, Result};
use cnidarium::{StateDelta, StateRead, StateWrite, Storage};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};

use types::{Block, ProcessedDocumentRecord};

// Key prefixes (no trailing slashes, cnidarium convention)
const RECORD_PREFIX: &str = "doc/record";
const BLOCKS_PREFIX: &str = "doc/blocks";

fn record_key(source: &str) -> String {
    // Sources are URLs; hash them so keys stay path-safe.
    format!("{}/{}", RECORD_PREFIX, blake3::hash(source.as_bytes()).to_hex())
}
fn blocks_key(handle: &str) -> String {
    format!("{}/{}", BLOCKS_PREFIX, handle)
}

/// Document cache: source key -> processed record, plus the block sets the
/// records point at.
///
/// `get`/`put` are best effort. Storage failures are logged and reported as a
/// miss (or silently dropped, for `put`), never returned to the caller.
pub struct DocumentStore {
    storage: Storage,
    /// Block sets already loaded in this process, keyed by document source.
    loaded: RwLock<HashMap<String, Arc<Vec<Block>>>>,
    ingest_locks: KeyedLocks,
}

impl DocumentStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let prefixes = vec![RECORD_PREFIX.to_string(), BLOCKS_PREFIX.to_string()];
        let storage = Storage::load(data_dir.to_path_buf(), prefixes)
            .await
            .context("Failed to init cnidarium storage")?;
        Ok(Self {
            storage,
            loaded: RwLock::new(HashMap::new()),
            ingest_locks: KeyedLocks::default(),
        })
    }

    /// Look up the record for a document source. Any storage or decode
    /// failure degrades to `None`.
    pub async fn get(&self, source: &str) -> Option<ProcessedDocumentRecord> {
        match self.try_get(source).await {
            Ok(record) => record,
            Err(e) => {
                warn!(source, error = %e, "Cache lookup error");
                None
            }
        }
    }

    async fn try_get(&self, source: &str) -> Result<Option<ProcessedDocumentRecord>> {
        let snapshot = self.storage.latest_snapshot();
        let Some(bytes) = snapshot.get_raw(&record_key(source)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes).context("decode processed record")?;
        Ok(Some(record))
    }

    /// Store (or overwrite) the record for a source. Last write wins.
    pub async fn put(&self, source: &str, record: &ProcessedDocumentRecord) {
        if let Err(e) = self.try_put(source, record).await {
            warn!(source, error = %e, "Cache save error");
        }
    }

    async fn try_put(&self, source: &str, record: &ProcessedDocumentRecord) -> Result<()> {
        let snapshot = self.storage.latest_snapshot();
        let mut delta = StateDelta::new(snapshot);
        delta.put_raw(
            record_key(source),
            serde_json::to_vec(record).context("serialize record")?,
        );
        self.storage.commit(delta).await?;
        debug!(source, handle = %record.blocks_handle, "processed record stored");
        Ok(())
    }

    /// Persist a block sequence. Returns its content-addressed handle.
    /// Idempotent: same blocks = same handle.
    pub async fn store_blocks(&self, blocks: &[Block]) -> Result<String> {
        let bytes = serde_json::to_vec(blocks).context("serialize blocks")?;
        let handle = blake3::hash(&bytes).to_hex().to_string();

        let snapshot = self.storage.latest_snapshot();
        let mut delta = StateDelta::new(snapshot);
        delta.put_raw(blocks_key(&handle), bytes);
        self.storage.commit(delta).await?;
        debug!(handle = %handle, blocks = blocks.len(), "block set stored");
        Ok(handle)
    }

    pub async fn load_blocks(&self, handle: &str) -> Result<Vec<Block>> {
        let snapshot = self.storage.latest_snapshot();
        let bytes = snapshot
            .get_raw(&blocks_key(handle))
            .await?
            .ok_or_else(|| anyhow::anyhow!("block set not found: {}", handle))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Block set already loaded for this source in this process, if any.
    pub async fn loaded(&self, source: &str) -> Option<Arc<Vec<Block>>> {
        self.loaded.read().await.get(source).cloned()
    }

    pub async fn remember(&self, source: &str, blocks: Arc<Vec<Block>>) {
        self.loaded.write().await.insert(source.to_string(), blocks);
    }

    /// Serialize ingestion per source key. Holders of the guard for the same
    /// key run one at a time; different keys never contend.
    pub async fn ingest_guard(&self, source: &str) -> KeyGuard {
        self.ingest_locks.lock(source).await
    }
}

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// One async mutex per key. An entry lives only while some caller holds or
/// waits on it.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Arc<SyncMutex<LockMap>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();
        KeyGuard {
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Held lock for one key. Dropping it releases the key and, when nobody else
/// is waiting, removes its entry.
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<SyncMutex<LockMap>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        // Only the map's own handle left: no holder, no waiter.
        if locks.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.key);
        }
    }
}
