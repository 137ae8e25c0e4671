//! Content-addressed thumbnail store: one PNG per URL, named by the SHA-256 of the URL.
//!
//! There is no eviction. A file that exists with non-zero size is proof of an earlier
//! successful resolution, in this run or a previous one that used the same directory.

use crate::error::{PreviewError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;

const EXTENSION: &str = "png";

pub struct ThumbnailCache {
    dir: PathBuf,
    locks: KeyLocks,
}

impl ThumbnailCache {
    /// The directory is created lazily by [`ThumbnailCache::ensure_dir`]; constructing a cache
    /// over an unwritable location is not an error until something is written.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: KeyLocks::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key(url: &str) -> String {
        format!("{:x}", Sha256::digest(url.as_bytes()))
    }

    pub fn path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", Self::key(url)))
    }

    pub fn exists(&self, url: &str) -> bool {
        non_empty(&self.path(url))
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|source| PreviewError::Cache {
            path: self.dir.clone(),
            source,
        })
    }

    /// A scratch file inside the cache directory, so publishing it is a same-filesystem rename.
    pub fn stage(&self) -> Result<NamedTempFile> {
        self.ensure_dir()?;
        tempfile::Builder::new()
            .prefix(".staging-")
            .suffix(&format!(".{EXTENSION}"))
            .tempfile_in(&self.dir)
            .map_err(|source| PreviewError::Cache {
                path: self.dir.clone(),
                source,
            })
    }

    /// Atomically move a staged file into place for `url`.
    pub fn commit(&self, url: &str, staged: NamedTempFile) -> Result<PathBuf> {
        let target = self.path(url);
        if !non_empty(staged.path()) {
            return Err(PreviewError::EmptyOutput(staged.path().display().to_string()));
        }
        staged.persist(&target).map_err(|e| PreviewError::Cache {
            path: target.clone(),
            source: e.error,
        })?;
        Ok(target)
    }

    /// Run `f` while holding the lock for `url`, making check-then-write sequences atomic
    /// with respect to other threads resolving the same URL.
    pub fn with_key_locked<T>(&self, url: &str, f: impl FnOnce() -> T) -> T {
        self.locks.with(&Self::key(url), f)
    }
}

fn non_empty(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

#[derive(Default)]
struct KeyLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn with<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.to_string()).or_default())
        };
        let result = {
            let _held = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        // Only the map and this call hold the slot: nobody is waiting, so forget the key.
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
