//! Two-tier cache store on disk.
//!
//! # Layout
//! ```text
//! <root>/<normalized-domain>/<METHOD>_<hash12>.json   # metadata
//! <root>/<normalized-domain>/<METHOD>_<hash12>.body   # raw bytes
//! ```
//!
//! # Design Decisions
//! - Fixtures are checked first and never written
//! - An entry is valid only when both artifacts exist; a lone artifact is a miss
//! - Writes go to temp files and are renamed into place under a per-key
//!   write lock; recorded-tier reads take the matching read lock so a reader
//!   never pairs metadata and body from different writes
//! - The write runs as its own task: a caller that goes away mid-write
//!   stops waiting, the renames still complete
//! - Per-key locks leave the lock table once nobody holds them
//! - A fixture that cannot be read is logged and skipped, the recorded tier
//!   still answers
//! - Listing or clearing paths that do not exist is an empty result

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::cache::entry::{CacheEntry, EntryMetadata, Tier};

const METADATA_EXT: &str = "json";
const BODY_EXT: &str = "body";

/// Errors raised by the cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure on a specific path.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Metadata document could not be (de)serialized.
    #[error("invalid metadata at {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Domain or key is not a safe single path component.
    #[error("invalid cache path component: {0:?}")]
    InvalidName(String),

    /// The detached write task panicked or was aborted.
    #[error("cache write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for cache store operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Outcome of a two-tier lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit { entry: CacheEntry, tier: Tier },
    Miss,
}

impl Lookup {
    /// Tier that served the lookup (`Tier::None` on a miss).
    pub fn tier(&self) -> Tier {
        match self {
            Lookup::Hit { tier, .. } => *tier,
            Lookup::Miss => Tier::None,
        }
    }
}

/// Aggregate counts over both tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub fixtures_count: usize,
    pub cache_count: usize,
    pub domains: Vec<String>,
}

/// One stored key and the tier holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub cache_key: String,
    pub tier: Tier,
}

/// Reject anything that is not a plain, single path component.
pub fn ensure_safe_name(name: &str) -> CacheResult<()> {
    let unsafe_name = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.contains("..");
    if unsafe_name {
        return Err(CacheError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Per `domain/key` reader/writer locks.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

enum Held {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// A held key lock. Dropping it removes the table entry when no one else
/// holds or waits on the same lock.
struct KeyGuard {
    locks: Arc<KeyLocks>,
    name: String,
    held: Option<Held>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.held.take();
        self.locks
            .locks
            .remove_if(&self.name, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl KeyLocks {
    async fn acquire(self: &Arc<Self>, domain: &str, key: &str, exclusive: bool) -> KeyGuard {
        let mut guard = KeyGuard {
            locks: Arc::clone(self),
            name: format!("{domain}/{key}"),
            held: None,
        };
        let lock = self.locks.entry(guard.name.clone()).or_default().clone();
        guard.held = Some(if exclusive {
            Held::Write(lock.write_owned().await)
        } else {
            Held::Read(lock.read_owned().await)
        });
        guard
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Fixture + recorded-cache store.
#[derive(Debug)]
pub struct CacheStore {
    fixtures_root: PathBuf,
    cache_root: PathBuf,
    key_locks: Arc<KeyLocks>,
}

impl CacheStore {
    /// Create a store over the given tier roots. Directories are created lazily.
    pub fn new(fixtures_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_root: fixtures_root.into(),
            cache_root: cache_root.into(),
            key_locks: Arc::default(),
        }
    }

    pub fn fixtures_root(&self) -> &Path {
        &self.fixtures_root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Number of keys with a lock currently held or awaited.
    pub fn locked_keys(&self) -> usize {
        self.key_locks.len()
    }

    /// Look up an entry, fixtures first.
    pub async fn lookup(&self, domain: &str, key: &str) -> CacheResult<Lookup> {
        ensure_safe_name(domain)?;
        ensure_safe_name(key)?;

        match load_entry(&self.fixtures_root, domain, key).await {
            Ok(Some(entry)) => {
                return Ok(Lookup::Hit {
                    entry,
                    tier: Tier::Fixtures,
                })
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(domain = %domain, cache_key = %key, error = %e, "Skipping unreadable fixture");
            }
        }

        let _read = self.key_locks.acquire(domain, key, false).await;
        match load_entry(&self.cache_root, domain, key).await? {
            Some(entry) => Ok(Lookup::Hit {
                entry,
                tier: Tier::Recorded,
            }),
            None => Ok(Lookup::Miss),
        }
    }

    /// Persist an entry into the recorded tier, replacing any previous capture.
    pub async fn store(&self, entry: &CacheEntry) -> CacheResult<()> {
        ensure_safe_name(&entry.domain)?;
        ensure_safe_name(&entry.key)?;

        let write = write_pair(
            self.cache_root.clone(),
            Arc::clone(&self.key_locks),
            entry.clone(),
        );
        tokio::spawn(write).await?
    }

    /// Counts for both tiers plus the union of known domains.
    pub async fn stats(&self) -> CacheStats {
        let mut domains = BTreeSet::new();
        let fixtures_count = count_tier(&self.fixtures_root, &mut domains).await;
        let cache_count = count_tier(&self.cache_root, &mut domains).await;
        CacheStats {
            fixtures_count,
            cache_count,
            domains: domains.into_iter().collect(),
        }
    }

    /// Keys stored for a domain across both tiers.
    pub async fn list_domain(&self, domain: &str) -> CacheResult<Vec<EntrySummary>> {
        ensure_safe_name(domain)?;
        let mut entries = Vec::new();
        for (root, tier) in [
            (&self.fixtures_root, Tier::Fixtures),
            (&self.cache_root, Tier::Recorded),
        ] {
            for key in metadata_stems(&root.join(domain)).await {
                entries.push(EntrySummary {
                    cache_key: key,
                    tier,
                });
            }
        }
        Ok(entries)
    }

    /// Delete every recorded domain. Fixtures are untouched.
    ///
    /// Returns the number of domain directories removed.
    pub async fn clear_all(&self) -> CacheResult<usize> {
        let mut dir = match fs::read_dir(&self.cache_root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.cache_root.clone(),
                    source,
                })
            }
        };

        let mut removed = 0;
        while let Some(item) = dir.next_entry().await.map_err(|source| CacheError::Io {
            path: self.cache_root.clone(),
            source,
        })? {
            let is_dir = item.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if remove_dir(&item.path()).await? {
                removed += 1;
            }
        }
        tracing::info!(removed, "Cleared recorded cache");
        Ok(removed)
    }

    /// Delete one recorded domain. Succeeds when nothing was there.
    ///
    /// Returns whether a directory was removed.
    pub async fn clear_domain(&self, domain: &str) -> CacheResult<bool> {
        ensure_safe_name(domain)?;
        let removed = remove_dir(&self.cache_root.join(domain)).await?;
        tracing::info!(domain = %domain, removed, "Cleared recorded cache for domain");
        Ok(removed)
    }
}

/// Write metadata and body to temp files, then rename both into place under
/// the key's write lock. Body first: a lone body is a miss.
async fn write_pair(cache_root: PathBuf, locks: Arc<KeyLocks>, entry: CacheEntry) -> CacheResult<()> {
    let dir = cache_root.join(&entry.domain);
    fs::create_dir_all(&dir).await.map_err(|source| CacheError::Io {
        path: dir.clone(),
        source,
    })?;

    let meta_path = artifact_path(&cache_root, &entry.domain, &entry.key, METADATA_EXT);
    let body_path = artifact_path(&cache_root, &entry.domain, &entry.key, BODY_EXT);
    let metadata = serde_json::to_vec_pretty(&entry.metadata).map_err(|source| {
        CacheError::Metadata {
            path: meta_path.clone(),
            source,
        }
    })?;

    let suffix = fastrand::u64(..);
    let tmp_meta = dir.join(format!(".{}.{METADATA_EXT}.{suffix:016x}.tmp", entry.key));
    let tmp_body = dir.join(format!(".{}.{BODY_EXT}.{suffix:016x}.tmp", entry.key));

    let _write = locks.acquire(&entry.domain, &entry.key, true).await;

    let result = async {
        write_file(&tmp_meta, &metadata).await?;
        write_file(&tmp_body, &entry.body).await?;
        rename(&tmp_body, &body_path).await?;
        if let Err(e) = rename(&tmp_meta, &meta_path).await {
            // Neither the old metadata nor the new body may survive alone.
            let _ = fs::remove_file(&meta_path).await;
            let _ = fs::remove_file(&body_path).await;
            return Err(e);
        }
        Ok::<_, CacheError>(())
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_meta).await;
        let _ = fs::remove_file(&tmp_body).await;
    } else {
        tracing::debug!(
            domain = %entry.domain,
            cache_key = %entry.key,
            bytes = entry.body.len(),
            "Stored cache entry"
        );
    }
    result
}

fn artifact_path(root: &Path, domain: &str, key: &str, ext: &str) -> PathBuf {
    root.join(domain).join(format!("{key}.{ext}"))
}

async fn read_optional(path: &Path) -> CacheResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn load_entry(root: &Path, domain: &str, key: &str) -> CacheResult<Option<CacheEntry>> {
    let meta_path = artifact_path(root, domain, key, METADATA_EXT);
    let body_path = artifact_path(root, domain, key, BODY_EXT);

    let metadata = read_optional(&meta_path).await?;
    let body = read_optional(&body_path).await?;

    match (metadata, body) {
        (None, None) => Ok(None),
        (Some(_), None) => {
            tracing::warn!(path = %body_path.display(), "Cache entry body missing, treating as miss");
            Ok(None)
        }
        (None, Some(_)) => {
            tracing::warn!(path = %meta_path.display(), "Cache entry metadata missing, treating as miss");
            Ok(None)
        }
        (Some(metadata), Some(body)) => {
            let metadata: EntryMetadata =
                serde_json::from_slice(&metadata).map_err(|source| CacheError::Metadata {
                    path: meta_path,
                    source,
                })?;
            Ok(Some(CacheEntry {
                domain: domain.to_string(),
                key: key.to_string(),
                metadata,
                body: Bytes::from(body),
            }))
        }
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> CacheResult<()> {
    fs::write(path, contents).await.map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn rename(from: &Path, to: &Path) -> CacheResult<()> {
    fs::rename(from, to).await.map_err(|source| CacheError::Io {
        path: to.to_path_buf(),
        source,
    })
}

async fn remove_dir(path: &Path) -> CacheResult<bool> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// File stems of every `*.json` in a directory, sorted. Missing dirs are empty.
async fn metadata_stems(dir: &Path) -> Vec<String> {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return Vec::new();
    };
    let mut stems = Vec::new();
    while let Ok(Some(item)) = entries.next_entry().await {
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXT) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if !stem.starts_with('.') {
                stems.push(stem.to_string());
            }
        }
    }
    stems.sort();
    stems
}

async fn count_tier(root: &Path, domains: &mut BTreeSet<String>) -> usize {
    let Ok(mut entries) = fs::read_dir(root).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(item)) = entries.next_entry().await {
        let is_dir = item.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let Some(domain) = item.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        count += metadata_stems(&item.path()).await.len();
        domains.insert(domain);
    }
    count
}
