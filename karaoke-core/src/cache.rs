use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persistent, size-bounded LRU store of finished tracks.
///
/// Layout:
/// ```text
/// {cache_dir}/
///   index.json          {"version": 1, "entries": [...]}, oldest first
///   {track}.mp3
///   ...
/// ```
///
/// Every operation runs under one lock and every mutation rewrites the index
/// (write to a temporary file, then rename).
pub struct ResultCache {
    dir: PathBuf,
    capacity_bytes: u64,
    entries: Mutex<Vec<CacheEntry>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub track_id: String,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub capacity_bytes: u64,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("entry of {size} bytes exceeds cache capacity of {capacity} bytes")]
    Oversized { size: u64, capacity: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    entries: Vec<CacheEntry>,
}

impl ResultCache {
    /// Open (or create) the cache rooted at `dir`.
    ///
    /// An unreadable index is logged and replaced by an empty one.
    pub fn open(dir: impl Into<PathBuf>, capacity_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let entries = match fs::read(&index_path) {
            Ok(bytes) => match serde_json::from_slice::<CacheIndex>(&bytes) {
                Ok(index) => index.entries,
                Err(e) => {
                    log::warn!("discarding unreadable cache index {}: {e}", index_path.display());
                    Vec::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        log::info!(
            "result cache at {}: {} entries, capacity {} MB",
            dir.display(),
            entries.len(),
            capacity_bytes / (1024 * 1024)
        );
        Ok(Self {
            dir,
            capacity_bytes,
            entries: Mutex::new(entries),
        })
    }

    /// `{os cache dir}/karaoke-server`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|d| d.join("karaoke-server"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the final file for `track_id` should be written before `put`.
    pub fn entry_path(&self, track_id: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{extension}", safe_file_stem(track_id)))
    }

    /// Path of a cached track, promoting it to most recently used.
    pub fn get(&self, track_id: &str) -> Option<PathBuf> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.track_id == track_id)?;
        if !entries[pos].file_path.exists() {
            log::info!("cache entry {track_id} vanished from disk, dropping it");
            entries.remove(pos);
            self.persist_logged(&entries);
            return None;
        }
        let entry = entries.remove(pos);
        let path = entry.file_path.clone();
        entries.push(entry);
        self.persist_logged(&entries);
        log::debug!("cache hit: {track_id}");
        Some(path)
    }

    /// Whether `track_id` is cached. Does not change recency.
    pub fn has(&self, track_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(pos) = entries.iter().position(|e| e.track_id == track_id) else {
            return false;
        };
        if entries[pos].file_path.exists() {
            return true;
        }
        entries.remove(pos);
        self.persist_logged(&entries);
        false
    }

    /// Insert the file at `path` as the most recently used entry, evicting the
    /// oldest entries until it fits.
    ///
    /// A file larger than the whole capacity is deleted and rejected without
    /// evicting anything.
    pub fn put(&self, track_id: &str, path: &Path) -> Result<CacheEntry, CacheError> {
        let size = fs::metadata(path)?.len();
        if size > self.capacity_bytes {
            log::warn!(
                "not caching {track_id}: {size} bytes exceeds capacity {}",
                self.capacity_bytes
            );
            remove_file_quietly(path);
            return Err(CacheError::Oversized {
                size,
                capacity: self.capacity_bytes,
            });
        }

        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.track_id == track_id) {
            let old = entries.remove(pos);
            if old.file_path != path {
                remove_file_quietly(&old.file_path);
            }
        }

        let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();
        while total + size > self.capacity_bytes && !entries.is_empty() {
            let evicted = entries.remove(0);
            total -= evicted.size_bytes;
            log::info!(
                "cache evicted {} ({} bytes)",
                evicted.track_id,
                evicted.size_bytes
            );
            remove_file_quietly(&evicted.file_path);
        }

        let entry = CacheEntry {
            track_id: track_id.to_owned(),
            file_path: path.to_path_buf(),
            size_bytes: size,
            created_at: Utc::now(),
        };
        entries.push(entry.clone());
        self.persist(&entries)?;
        log::debug!("cached {track_id} ({size} bytes)");
        Ok(entry)
    }

    /// Drop every entry and delete its file. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        for entry in entries.drain(..) {
            remove_file_quietly(&entry.file_path);
        }
        self.persist(&entries)?;
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            size_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            capacity_bytes: self.capacity_bytes,
        }
    }

    /// Track ids from least to most recently used.
    pub fn track_ids(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.track_id.clone()).collect()
    }

    fn persist(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        let index = CacheIndex {
            version: INDEX_VERSION,
            entries: entries.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&index)?;
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }

    fn persist_logged(&self, entries: &[CacheEntry]) {
        if let Err(e) = self.persist(entries) {
            log::warn!("failed to persist cache index: {e}");
        }
    }
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("failed to delete {}: {e}", path.display());
        }
    }
}

/// 32 hex chars (128 bits) of blake3 over `data`.
pub fn hash_key(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    hex::encode(&hash.as_bytes()[..16])
}

/// File-name-safe form of a track id. Ids that are not already plain are
/// replaced by their hash so distinct ids never share a file.
pub fn safe_file_stem(track_id: &str) -> String {
    let plain = !track_id.is_empty()
        && track_id.len() <= 64
        && track_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        track_id.to_owned()
    } else {
        hash_key(track_id.as_bytes())
    }
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        let mut s = String::with_capacity(bytes.len() * 2);
        for &b in bytes {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(cache: &ResultCache, id: &str, size: usize) -> PathBuf {
        let path = cache.entry_path(id, "mp3");
        fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn put_then_get_returns_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), 1000).unwrap();
        let path = write(&cache, "a", 10);
        cache.put("a", &path).unwrap();
        assert_eq!(cache.get("a"), Some(path));
        assert!(cache.has("a"));
        assert!(!cache.has("b"));
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), 300).unwrap();
        for id in ["a", "b", "c"] {
            let path = write(&cache, id, 100);
            cache.put(id, &path).unwrap();
        }
        // Touch "a" so "b" becomes the oldest.
        assert!(cache.get("a").is_some());
        let path = write(&cache, "d", 100);
        cache.put("d", &path).unwrap();

        assert_eq!(cache.track_ids(), vec!["c", "a", "d"]);
        assert!(!cache.entry_path("b", "mp3").exists());
        assert!(cache.stats().size_bytes <= 300);
    }

    #[test]
    fn total_size_never_exceeds_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), 250).unwrap();
        for (i, size) in [120, 80, 200, 10, 240, 50, 60].iter().enumerate() {
            let id = format!("t{i}");
            let path = write(&cache, &id, *size);
            cache.put(&id, &path).unwrap();
            assert!(cache.stats().size_bytes <= 250);
        }
    }

    #[test]
    fn oversized_entry_is_rejected_without_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), 100).unwrap();
        let small = write(&cache, "small", 50);
        cache.put("small", &small).unwrap();

        let big = write(&cache, "big", 500);
        let err = cache.put("big", &big).unwrap_err();
        assert!(matches!(err, CacheError::Oversized { size: 500, capacity: 100 }));
        assert!(!big.exists());
        assert_eq!(cache.track_ids(), vec!["small"]);
    }

    #[test]
    fn vanished_files_are_purged_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), 1000).unwrap();
        let path = write(&cache, "gone", 10);
        cache.put("gone", &path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(cache.get("gone"), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = ResultCache::open(dir.path(), 1000).unwrap();
            for id in ["x", "y"] {
                let path = write(&cache, id, 10);
                cache.put(id, &path).unwrap();
            }
        }
        let cache = ResultCache::open(dir.path(), 1000).unwrap();
        assert_eq!(cache.track_ids(), vec!["x", "y"]);
        assert_eq!(cache.stats().size_bytes, 20);
    }

    #[test]
    fn corrupt_index_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(INDEX_FILE), b"{not json").unwrap();
        let cache = ResultCache::open(dir.path(), 1000).unwrap();
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn clear_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), 1000).unwrap();
        let path = write(&cache, "a", 10);
        cache.put("a", &path).unwrap();
        assert_eq!(cache.clear().unwrap(), 1);
        assert!(!path.exists());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn unsafe_ids_are_hashed() {
        assert_eq!(safe_file_stem("abc-123_x"), "abc-123_x");
        let hashed = safe_file_stem("../etc/passwd");
        assert_eq!(hashed.len(), 32);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(safe_file_stem("a/b"), safe_file_stem("a_b"));
    }
}
