use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use originator_common::MsgToSend;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    error::{Result, StoreError},
    types::{StoreConfig, StoreMeta},
};

const META_FILE: &str = "store-meta.bin";
const ENTITY_PREFIX: &str = "msg-";
const ENTITY_SUFFIX: &str = ".bin";

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

struct Inner {
    meta: StoreMeta,
    messages: BTreeMap<u64, MsgToSend>,
}

/// Directory-backed entity store.
///
/// All reads and writes go through closure transactions; a write transaction
/// stages its changes and applies + persists them only if the closure
/// returns `Ok`.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    dir: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("dir", &self.dir).finish()
    }
}

impl Store {
    /// Open the store, loading any persisted entities.
    ///
    /// Corrupt entity files are reported, not silently dropped.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let mut meta = StoreMeta::default();
        let mut messages = BTreeMap::new();

        if let Some(dir) = &config.dir {
            tokio::fs::create_dir_all(dir).await?;

            let meta_path = dir.join(META_FILE);
            if tokio::fs::try_exists(&meta_path).await? {
                meta = decode_file(&meta_path).await?;
            }

            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.starts_with(ENTITY_PREFIX) || !name.ends_with(ENTITY_SUFFIX) {
                    continue;
                }
                let msg: MsgToSend = decode_file(&entry.path()).await?;
                // The allocator cursor must stay ahead of every entity on
                // disk even if the meta record lagged a crash.
                meta.next_id = meta.next_id.max(msg.entity_id + 1);
                messages.insert(msg.entity_id, msg);
            }
            debug!(count = messages.len(), "store loaded");
        }

        Ok(Self {
            inner: Arc::new(RwLock::new(Inner { meta, messages })),
            dir: config.dir,
        })
    }

    /// Run a write transaction.
    pub async fn run_tx<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let mut tx = Tx {
            base: &inner.messages,
            staged: BTreeMap::new(),
            next_id: inner.meta.next_id,
            parent_id: inner.meta.parent_id,
        };
        let value = f(&mut tx)?;

        let Tx {
            staged,
            next_id,
            parent_id,
            ..
        } = tx;

        let meta_dirty = next_id != inner.meta.next_id || parent_id != inner.meta.parent_id;
        inner.meta.next_id = next_id;
        inner.meta.parent_id = parent_id;

        for (id, slot) in &staged {
            match slot {
                Some(msg) => {
                    inner.messages.insert(*id, msg.clone());
                }
                None => {
                    inner.messages.remove(id);
                }
            }
        }

        if let Some(dir) = &self.dir {
            persist(dir, &inner.meta, meta_dirty, &staged).await?;
        }

        Ok(value)
    }

    /// Run a write transaction that must not interleave with any other
    /// store access. With a single writer lock this is `run_tx`; the
    /// separate name preserves the caller-side contract (first-start
    /// parent creation runs exclusively).
    pub async fn run_tx_exclusive<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        self.run_tx(f).await
    }

    /// Run a read-only transaction.
    pub async fn run_read<T>(&self, f: impl FnOnce(&ReadTx<'_>) -> T) -> T {
        let guard = self.inner.read().await;
        f(&ReadTx {
            messages: &guard.messages,
            parent_id: guard.meta.parent_id,
        })
    }

    /// Iterate all messages in ID order, in batches of `batch_size`. Each
    /// batch is collected under its own read transaction and handed to
    /// `on_batch` after that transaction has ended; returning `false`
    /// cancels the iteration.
    pub async fn process_in_batches(
        &self,
        batch_size: usize,
        mut on_batch: impl FnMut(&[MsgToSend]) -> bool,
    ) -> Result<()> {
        let batch_size = batch_size.max(1);
        let mut cursor: Option<u64> = None;
        loop {
            let batch: Vec<MsgToSend> = {
                let guard = self.inner.read().await;
                let range = match cursor {
                    Some(last) => guard
                        .messages
                        .range((std::ops::Bound::Excluded(last), std::ops::Bound::Unbounded)),
                    None => guard.messages.range(..),
                };
                range.take(batch_size).map(|(_, m)| m.clone()).collect()
            };
            let Some(last) = batch.last() else {
                return Ok(());
            };
            cursor = Some(last.entity_id);
            if !on_batch(&batch) {
                return Ok(());
            }
        }
    }
}

/// Write transaction handle. Changes are staged and only become visible
/// (and durable) when the transaction closure returns `Ok`.
pub struct Tx<'a> {
    base: &'a BTreeMap<u64, MsgToSend>,
    staged: BTreeMap<u64, Option<MsgToSend>>,
    next_id: u64,
    parent_id: Option<u64>,
}

impl Tx<'_> {
    /// Insert a new entity; the store assigns its identity.
    pub fn insert(&mut self, mut msg: MsgToSend) -> Result<u64> {
        if msg.entity_id != 0 {
            return Err(StoreError::AlreadyStored(msg.entity_id));
        }
        let id = self.next_id;
        self.next_id += 1;
        msg.entity_id = id;
        self.staged.insert(id, Some(msg));
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<MsgToSend> {
        match self.staged.get(&id) {
            Some(slot) => slot.clone(),
            None => self.base.get(&id).cloned(),
        }
    }

    /// Replace an existing entity.
    pub fn update(&mut self, msg: MsgToSend) -> Result<()> {
        let id = msg.entity_id;
        if self.get(id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        self.staged.insert(id, Some(msg));
        Ok(())
    }

    /// Remove an entity, returning its last state.
    pub fn remove(&mut self, id: u64) -> Result<MsgToSend> {
        let msg = self.get(id).ok_or(StoreError::NotFound(id))?;
        self.staged.insert(id, None);
        Ok(msg)
    }

    /// All message children matching `filter`, in ID order.
    #[must_use]
    pub fn select(&self, mut filter: impl FnMut(&MsgToSend) -> bool) -> Vec<MsgToSend> {
        let mut out: Vec<MsgToSend> = self
            .base
            .iter()
            .filter(|(id, _)| !self.staged.contains_key(id))
            .map(|(_, m)| m)
            .chain(self.staged.values().filter_map(Option::as_ref))
            .filter(|m| filter(m))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.entity_id);
        out
    }

    /// Create the singleton storage parent if absent; returns its identity.
    pub fn ensure_storage_parent(&mut self) -> u64 {
        if let Some(id) = self.parent_id {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.parent_id = Some(id);
        id
    }

    #[must_use]
    pub const fn storage_parent(&self) -> Option<u64> {
        self.parent_id
    }
}

/// Read transaction handle.
pub struct ReadTx<'a> {
    messages: &'a BTreeMap<u64, MsgToSend>,
    parent_id: Option<u64>,
}

impl ReadTx<'_> {
    #[must_use]
    pub fn get(&self, id: u64) -> Option<MsgToSend> {
        self.messages.get(&id).cloned()
    }

    #[must_use]
    pub fn select(&self, mut filter: impl FnMut(&MsgToSend) -> bool) -> Vec<MsgToSend> {
        self.messages
            .values()
            .filter(|m| filter(m))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub const fn storage_parent(&self) -> Option<u64> {
        self.parent_id
    }
}

fn entity_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{ENTITY_PREFIX}{id:020}{ENTITY_SUFFIX}"))
}

async fn decode_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    bincode::serde::decode_from_slice(&bytes, bincode_config())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Decode {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn persist(
    dir: &Path,
    meta: &StoreMeta,
    meta_dirty: bool,
    staged: &BTreeMap<u64, Option<MsgToSend>>,
) -> Result<()> {
    for (id, slot) in staged {
        let path = entity_path(dir, *id);
        match slot {
            Some(msg) => {
                let bytes = bincode::serde::encode_to_vec(msg, bincode_config()).map_err(|e| {
                    StoreError::Encode {
                        entity_id: *id,
                        reason: e.to_string(),
                    }
                })?;
                write_atomic(&path, &bytes).await?;
            }
            None => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(entity_id = id, error = %e, "failed to remove entity file");
                        return Err(e.into());
                    }
                }
            }
        }
    }

    if meta_dirty || !staged.is_empty() {
        let bytes =
            bincode::serde::encode_to_vec(meta, bincode_config()).map_err(|e| StoreError::Encode {
                entity_id: 0,
                reason: e.to_string(),
            })?;
        write_atomic(&dir.join(META_FILE), &bytes).await?;
    }

    Ok(())
}
