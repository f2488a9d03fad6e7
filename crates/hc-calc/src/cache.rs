//! Result caches keyed by [`Fingerprint`].
//!
//! Entries are never invalidated implicitly; they stay until the caller
//! clears them. `store` is atomic per key, and storing the same result twice
//! is indistinguishable from storing it once.
//!
//! # On-disk layout ([`FileSystemCache`])
//!
//! `<root>/<first two hex chars>/<64 hex chars>.json`, each file holding
//! `{"schema_version", "fingerprint", "created_unix_ms", "result"}`. Writes go
//! to a uniquely named sibling and are `rename`d into place, so readers never
//! observe a partial entry and concurrent writers of one key do not corrupt
//! it (last writer wins).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use hc_core::{Error, Estimation, Result};

use crate::fingerprint::Fingerprint;

/// Temp-file sequence, process-wide so handles on the same root never collide.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Schema tag of persisted entries.
pub const CACHE_ENTRY_SCHEMA: &str = "hepcalc_cache_entry_v1";

/// A store from fingerprint to result.
pub trait Cache: Send + Sync {
    /// Look up a result. Undecodable entries are [`Error::CacheCorruption`].
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Estimation>>;

    /// Store a result, replacing any previous entry atomically.
    fn store(&self, fingerprint: &Fingerprint, result: &Estimation) -> Result<()>;

    /// Remove one entry. Removing an absent entry is not an error.
    fn clear(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Remove every entry.
    fn clear_all(&self) -> Result<()>;

    /// Number of stored entries.
    fn entries(&self) -> Result<usize>;

    /// Counters since creation.
    fn stats(&self) -> CacheStats;
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Successful stores.
    pub stores: u64,
    /// Lookups that found a corrupt entry.
    pub corruptions: u64,
}

impl CacheStats {
    /// Hit rate as a fraction [0.0, 1.0].
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.corruptions;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    corruptions: AtomicU64,
}

impl Counters {
    fn lookup<T>(&self, r: &Result<Option<T>>) {
        let counter = match r {
            Ok(Some(_)) => &self.hits,
            Ok(None) => &self.misses,
            Err(Error::CacheCorruption { .. }) => &self.corruptions,
            Err(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
        }
    }
}

// ── Memory ─────────────────────────────────────────────────────

/// Process-local cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<Fingerprint, Estimation>>,
    counters: Counters,
}

impl MemoryCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Estimation>> {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let r = Ok(map.get(fingerprint).cloned());
        self.counters.lookup(&r);
        r
    }

    fn store(&self, fingerprint: &Fingerprint, result: &Estimation) -> Result<()> {
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(*fingerprint, result.clone());
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn clear(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(fingerprint);
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    fn entries(&self) -> Result<usize> {
        Ok(self.entries.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

// ── Filesystem ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    schema_version: String,
    fingerprint: String,
    created_unix_ms: u128,
    result: Estimation,
}

/// Persistent cache: one JSON file per fingerprint under a root directory.
#[derive(Debug)]
pub struct FileSystemCache {
    root: PathBuf,
    counters: Counters,
}

impl FileSystemCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, counters: Counters::default() })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry for `fingerprint`.
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root.join(&hex[..2]).join(format!("{hex}.json"))
    }

    fn read_entry(&self, fingerprint: &Fingerprint) -> Result<Option<Estimation>> {
        let path = self.entry_path(fingerprint);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| Error::CacheCorruption { key: fingerprint.to_hex(), reason };
        let entry: CacheEntry =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        if entry.schema_version != CACHE_ENTRY_SCHEMA {
            return Err(corrupt(format!("unknown schema '{}'", entry.schema_version)));
        }
        if entry.fingerprint != fingerprint.to_hex() {
            return Err(corrupt(format!("entry is for {}", entry.fingerprint)));
        }
        entry.result.validate().map_err(|e| corrupt(e.to_string()))?;
        Ok(Some(entry.result))
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for file in fs::read_dir(&shard)? {
                let file = file?.path();
                if file.extension().is_some_and(|e| e == "json") {
                    out.push(file);
                }
            }
        }
        Ok(out)
    }
}

impl Cache for FileSystemCache {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Estimation>> {
        let r = self.read_entry(fingerprint);
        self.counters.lookup(&r);
        r
    }

    fn store(&self, fingerprint: &Fingerprint, result: &Estimation) -> Result<()> {
        let path = self.entry_path(fingerprint);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        let entry = CacheEntry {
            schema_version: CACHE_ENTRY_SCHEMA.to_string(),
            fingerprint: fingerprint.to_hex(),
            created_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0),
            result: result.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;

        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!(".{}.{}.{seq}.tmp", fingerprint.to_hex(), std::process::id()));
        fs::write(&tmp, &bytes)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn clear(&self, fingerprint: &Fingerprint) -> Result<()> {
        match fs::remove_file(self.entry_path(fingerprint)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn clear_all(&self) -> Result<()> {
        for file in self.entry_files()? {
            match fs::remove_file(&file) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    fn entries(&self) -> Result<usize> {
        Ok(self.entry_files()?.len())
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_core::{Count, Histogram};
    use std::str::FromStr;

    fn tmp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("hc_cache_{tag}_{}_{}", std::process::id(), nanos))
    }

    fn fp(byte: char) -> Fingerprint {
        Fingerprint::from_str(&byte.to_string().repeat(64)).unwrap()
    }

    fn hist() -> Estimation {
        Histogram::new(vec![0.0, 0.5, 1.0], vec![1.5, 0.1 + 0.2], vec![2.25, 1e-17]).unwrap().into()
    }

    fn round_trip(cache: &dyn Cache) {
        let a = fp('a');
        assert_eq!(cache.lookup(&a).unwrap(), None);
        cache.store(&a, &hist()).unwrap();
        cache.store(&a, &hist()).unwrap();
        assert_eq!(cache.lookup(&a).unwrap(), Some(hist()));
        assert_eq!(cache.entries().unwrap(), 1);

        let b = fp('b');
        let c: Estimation = Count::new(3.0, 3.0).unwrap().into();
        cache.store(&b, &c).unwrap();
        assert_eq!(cache.lookup(&b).unwrap(), Some(c));

        cache.clear(&a).unwrap();
        cache.clear(&a).unwrap();
        assert_eq!(cache.lookup(&a).unwrap(), None);
        cache.clear_all().unwrap();
        assert_eq!(cache.entries().unwrap(), 0);

        let s = cache.stats();
        assert_eq!(s.stores, 3);
        assert_eq!(s.hits, 2);
        assert_eq!(s.misses, 2);
    }

    #[test]
    fn memory_round_trip() {
        round_trip(&MemoryCache::new());
    }

    #[test]
    fn filesystem_round_trip_is_exact() {
        let dir = tmp_dir("rt");
        let cache = FileSystemCache::open(&dir).unwrap();
        round_trip(&cache);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn filesystem_layout() {
        let dir = tmp_dir("layout");
        let cache = FileSystemCache::open(&dir).unwrap();
        let f = fp('c');
        cache.store(&f, &hist()).unwrap();
        let path = dir.join("cc").join(format!("{}.json", "c".repeat(64)));
        assert!(path.is_file());
        let v: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(v["schema_version"], CACHE_ENTRY_SCHEMA);
        assert_eq!(v["result"]["shape"], "histogram");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_entries_are_reported() {
        let dir = tmp_dir("corrupt");
        let cache = FileSystemCache::open(&dir).unwrap();
        let f = fp('d');
        cache.store(&f, &hist()).unwrap();
        fs::write(cache.entry_path(&f), b"{\"schema_version\": \"hepcalc_cache_entry_v1\"").unwrap();
        assert!(matches!(cache.lookup(&f), Err(Error::CacheCorruption { .. })));

        // Declared histogram whose arrays disagree.
        let bad = format!(
            r#"{{"schema_version":"{CACHE_ENTRY_SCHEMA}","fingerprint":"{f}","created_unix_ms":0,
               "result":{{"shape":"histogram","edges":[0,1],"contents":[1,2],"variances":[1,2]}}}}"#
        );
        fs::write(cache.entry_path(&f), bad).unwrap();
        assert!(matches!(cache.lookup(&f), Err(Error::CacheCorruption { .. })));

        // Entry stored under the wrong key.
        let other = fp('e');
        cache.store(&other, &hist()).unwrap();
        fs::copy(cache.entry_path(&other), cache.entry_path(&f)).unwrap();
        assert!(matches!(cache.lookup(&f), Err(Error::CacheCorruption { .. })));
        assert_eq!(cache.stats().corruptions, 3);
        let _ = fs::remove_dir_all(&dir);
    }
}
