//! Durable per-context storage.
//!
//! Each context lives as two files under `data_dir`: `{id}.json` holds the
//! opaque payload, `{id}.meta.json` the store-owned metadata. Writes are
//! serialized per context id; the payload is committed before the metadata,
//! and change events are published only after both files are durable. An
//! in-memory LRU fronts reads and is kept coherent under the same per-id
//! lock as the files.

use crate::bus::{ContextEvent, EventBus};
use crate::context::{validate_context_id, ContextEntry, ContextMetadata};
use crate::error::{CascataError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;

pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Above this many live entries the lock map is swept for locks nobody
/// holds, so hot ids keep their mutex and cold ids do not accumulate.
const LOCK_SWEEP_THRESHOLD: usize = 512;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub cache_capacity: usize,
    pub cache_ttl: Option<Duration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: None,
        }
    }
}

struct CacheEntry {
    payload: Value,
    metadata: ContextMetadata,
    inserted_at: Instant,
}

pub struct ContextStore {
    data_dir: PathBuf,
    bus: EventBus,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cache: Mutex<LruCache<String, CacheEntry>>,
    cache_ttl: Option<Duration>,
}

impl ContextStore {
    pub fn open(data_dir: impl Into<PathBuf>, bus: EventBus, options: StoreOptions) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let capacity = NonZeroUsize::new(options.cache_capacity.max(1))
            .ok_or_else(|| CascataError::Config("cache capacity must be positive".to_string()))?;

        Ok(Self {
            data_dir,
            bus,
            locks: Mutex::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(capacity)),
            cache_ttl: options.cache_ttl.filter(|ttl| !ttl.is_zero()),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Save a payload under `id`, assigning the next monotonic version.
    /// Publishes `updated` exactly once, after both files are committed.
    pub async fn save(
        &self,
        id: &str,
        payload: &Value,
        extra: Option<&Map<String, Value>>,
    ) -> Result<ContextMetadata> {
        validate_context_id(id)?;
        let bytes = serde_json::to_vec(payload)?;

        let _guard = self.lock_context(id).await;

        let previous = self.peek_metadata(id).await?;
        let metadata = ContextMetadata::next(previous.as_ref(), bytes.len() as u64, extra);

        self.commit(id, &bytes, &metadata).await?;
        self.cache_insert(id, payload.clone(), metadata.clone());

        self.bus.publish(ContextEvent::Updated {
            context_id: id.to_string(),
            metadata: metadata.clone(),
        });
        metrics::counter!("cascata_saves_total").increment(1);

        Ok(metadata)
    }

    /// Mirror an upstream write: the metadata (including version) is taken
    /// as-is, stale versions are idempotent no-ops, and nothing is published.
    pub async fn apply_save(
        &self,
        id: &str,
        payload: &Value,
        metadata: &ContextMetadata,
    ) -> Result<bool> {
        validate_context_id(id)?;
        let bytes = serde_json::to_vec(payload)?;

        let _guard = self.lock_context(id).await;

        if let Some(local) = self.peek_metadata(id).await? {
            if metadata.version <= local.version {
                return Ok(false);
            }
        }

        self.commit(id, &bytes, metadata).await?;
        self.cache_insert(id, payload.clone(), metadata.clone());

        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Result<Value> {
        validate_context_id(id)?;

        if let Some((payload, _)) = self.cache_get(id) {
            return Ok(payload);
        }

        let (payload, _) = self.load_and_cache(id).await?;
        Ok(payload)
    }

    pub async fn get_metadata(&self, id: &str) -> Result<ContextMetadata> {
        validate_context_id(id)?;

        if let Some((_, metadata)) = self.cache_get(id) {
            return Ok(metadata);
        }

        let (_, metadata) = self.load_and_cache(id).await?;
        Ok(metadata)
    }

    /// Remove payload and metadata. `NotFound` when the context does not
    /// exist; publishes `deleted` exactly once otherwise.
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_context_id(id)?;

        let _guard = self.lock_context(id).await;

        if !self.remove_files(id).await? {
            return Err(CascataError::NotFound(id.to_string()));
        }
        self.cache.lock().pop(id);

        self.bus.publish(ContextEvent::Deleted {
            context_id: id.to_string(),
        });
        metrics::counter!("cascata_deletes_total").increment(1);

        Ok(())
    }

    /// Mirror an upstream delete. Missing contexts are a no-op; nothing is
    /// published either way.
    pub async fn apply_delete(&self, id: &str) -> Result<bool> {
        validate_context_id(id)?;

        let _guard = self.lock_context(id).await;

        let existed = self.remove_files(id).await?;
        self.cache.lock().pop(id);

        Ok(existed)
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let mut dir = fs::read_dir(&self.data_dir).await?;
        let mut ids = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") || name.contains(".meta.") {
                continue;
            }
            ids.push(name.trim_end_matches(".json").to_string());
        }

        ids.sort();
        Ok(ids)
    }

    pub async fn list_with_metadata(&self) -> Result<Vec<ContextEntry>> {
        let mut entries = Vec::new();

        for id in self.list().await? {
            match self.get_metadata(&id).await {
                Ok(metadata) => entries.push(ContextEntry { id, metadata }),
                // Raced with a concurrent delete; skip the id.
                Err(CascataError::NotFound(_)) => continue,
                Err(error) => return Err(error),
            }
        }

        Ok(entries)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    async fn lock_context(&self, id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() > LOCK_SWEEP_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        lock.lock_owned().await
    }

    /// Current metadata, cache first. Only called under the per-id lock,
    /// where the cache is guaranteed coherent with the files.
    async fn peek_metadata(&self, id: &str) -> Result<Option<ContextMetadata>> {
        if let Some(entry) = self.cache.lock().peek(id) {
            return Ok(Some(entry.metadata.clone()));
        }
        self.read_metadata_file(id).await
    }

    /// Write payload, then metadata. If the metadata write fails the payload
    /// is rolled back so readers never observe a half-committed save.
    async fn commit(&self, id: &str, payload: &[u8], metadata: &ContextMetadata) -> Result<()> {
        let payload_path = self.payload_path(id);
        let meta_path = self.meta_path(id);

        let previous_payload = match fs::read(&payload_path).await {
            Ok(bytes) => Some(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => return Err(error.into()),
        };

        write_atomic(&payload_path, payload).await?;

        let meta_bytes = serde_json::to_vec(metadata)?;
        if let Err(error) = write_atomic(&meta_path, &meta_bytes).await {
            let rollback = match previous_payload {
                Some(bytes) => write_atomic(&payload_path, &bytes).await,
                None => match fs::remove_file(&payload_path).await {
                    Ok(()) => Ok(()),
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(error) => Err(error.into()),
                },
            };
            if let Err(rollback_error) = rollback {
                tracing::error!(
                    "payload rollback failed after metadata write error: context={} error={}",
                    id,
                    rollback_error
                );
            }
            return Err(error);
        }

        Ok(())
    }

    /// Payload first, then metadata: readers resolve existence through the
    /// payload file, so they see either the full context or none of it.
    async fn remove_files(&self, id: &str) -> Result<bool> {
        let mut existed = false;

        for path in [self.payload_path(id), self.meta_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => existed = true,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }

        Ok(existed)
    }

    /// Disk read for a cache miss. Takes the per-id lock so the entry it
    /// installs can never clobber a fresher one written by a concurrent
    /// save.
    async fn load_and_cache(&self, id: &str) -> Result<(Value, ContextMetadata)> {
        let _guard = self.lock_context(id).await;

        let payload_bytes = match fs::read(self.payload_path(id)).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(CascataError::NotFound(id.to_string()))
            }
            Err(error) => {
                tracing::error!("payload read failed: context={} error={}", id, error);
                return Err(error.into());
            }
        };

        let metadata = match self.read_metadata_file(id).await? {
            Some(metadata) => metadata,
            // Payload without metadata: an interrupted commit left a stray
            // file. The context is not visible.
            None => return Err(CascataError::NotFound(id.to_string())),
        };

        let payload: Value = serde_json::from_slice(&payload_bytes)?;

        if metadata.size == payload_bytes.len() as u64 {
            self.cache_insert(id, payload.clone(), metadata.clone());
        }

        Ok((payload, metadata))
    }

    async fn read_metadata_file(&self, id: &str) -> Result<Option<ContextMetadata>> {
        match fs::read(self.meta_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                tracing::error!("metadata read failed: context={} error={}", id, error);
                Err(error.into())
            }
        }
    }

    fn cache_get(&self, id: &str) -> Option<(Value, ContextMetadata)> {
        let mut cache = self.cache.lock();

        if let Some(ttl) = self.cache_ttl {
            if let Some(entry) = cache.peek(id) {
                if entry.inserted_at.elapsed() > ttl {
                    cache.pop(id);
                }
            }
        }

        match cache.get(id) {
            Some(entry) => {
                metrics::counter!("cascata_cache_hits_total").increment(1);
                Some((entry.payload.clone(), entry.metadata.clone()))
            }
            None => {
                metrics::counter!("cascata_cache_misses_total").increment(1);
                None
            }
        }
    }

    fn cache_insert(&self, id: &str, payload: Value, metadata: ContextMetadata) {
        self.cache.lock().put(
            id.to_string(),
            CacheEntry {
                payload,
                metadata,
                inserted_at: Instant::now(),
            },
        );
    }

    fn payload_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", id))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.meta.json", id))
    }
}

async fn write_atomic(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
