//! On-disk catalog, queue, and resume stores. Every write goes through
//! write-to-tmp + rename; queue and resume are additionally guarded by
//! advisory locks on sibling `.lock` files so concurrent instances merge
//! instead of clobbering each other.

use crate::error::{Error, Result};
use crate::media::MediaItem;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const CATALOG_FILE: &str = "media.json";
pub const QUEUE_FILE: &str = "queue.json";
pub const QUEUE_LOCK: &str = "queue.lock";
pub const RESUME_FILE: &str = "resume.json";
pub const RESUME_LOCK: &str = "resume.lock";

const LOCK_RETRY: Duration = Duration::from_millis(100);
const LOCK_DEADLINE: Duration = Duration::from_secs(30);

/// Write `contents` to `path` via a sibling `<path>.tmp` and an atomic
/// rename. A stale tmp file from an earlier crash is deleted first; on
/// rename failure the fresh tmp file is removed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    if tmp.exists() {
        let _ = std::fs::remove_file(&tmp);
    }
    std::fs::write(&tmp, contents)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on a `.lock` file. Acquisition retries every 100 ms up to a
/// 30 s deadline rather than blocking indefinitely. Released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub fn acquire(lock_path: &Path, mode: LockMode, name: &'static str) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_path)?;

        let deadline = Instant::now() + LOCK_DEADLINE;
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => return Ok(Self { file }),
                Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_RETRY),
                Err(_) => return Err(Error::LockTimeout(name)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    media: Vec<MediaItem>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    items: Vec<MediaItem>,
    last_updated: DateTime<Utc>,
}

/// The indexed library. Replaced wholesale on reindex, additive on update;
/// an ordered sequence for display plus path lookup.
#[derive(Debug, Default)]
pub struct Catalog {
    pub items: Vec<MediaItem>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Catalog {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CATALOG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let file: CatalogFile = serde_json::from_str(&contents)?;
        Ok(Self {
            items: file.media,
            last_updated: Some(file.last_updated),
        })
    }

    /// Persists the catalog and stamps `last_updated` with the save time.
    pub fn save(&mut self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let now = Utc::now();
        let file = CatalogFile {
            media: std::mem::take(&mut self.items),
            last_updated: now,
        };
        let contents = serde_json::to_vec_pretty(&file)?;
        let path = dir.join(CATALOG_FILE);
        write_atomic(&path, &contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
        }
        self.items = file.media;
        self.last_updated = Some(now);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&MediaItem> {
        self.items.iter().find(|i| i.path == path)
    }

    pub fn replace(&mut self, items: Vec<MediaItem>) {
        self.items = items;
    }

    /// Additive update: new paths are appended, known paths refreshed in
    /// place so display order stays stable.
    pub fn merge(&mut self, items: Vec<MediaItem>) -> usize {
        let mut added = 0;
        for item in items {
            match self.items.iter_mut().find(|i| i.path == item.path) {
                Some(existing) => *existing = item,
                None => {
                    self.items.push(item);
                    added += 1;
                }
            }
        }
        added
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Ordered download queue, deduplicated by server path. The file disappears
/// when the queue empties.
#[derive(Debug, Default)]
pub struct Queue {
    pub items: Vec<MediaItem>,
}

impl Queue {
    pub fn load(dir: &Path) -> Result<Self> {
        let _lock = FileLock::acquire(&dir.join(QUEUE_LOCK), LockMode::Shared, "queue")?;
        Self::load_unlocked(dir)
    }

    /// Appends items whose path is not already queued; returns how many were
    /// actually added. Reloads from disk under the exclusive lock so a
    /// concurrent instance's additions survive.
    pub fn add(dir: &Path, items: &[MediaItem]) -> Result<usize> {
        let _lock = FileLock::acquire(&dir.join(QUEUE_LOCK), LockMode::Exclusive, "queue")?;
        let mut queue = Self::load_unlocked(dir)?;
        let added = queue.add_in_memory(items);
        queue.save_unlocked(dir)?;
        Ok(added)
    }

    /// Removes queue entries by server path after they have been acted upon.
    /// Reload-filter-save under the exclusive lock, so items added by another
    /// instance between our load and this call are preserved.
    pub fn remove_by_keys(dir: &Path, keys: &[String]) -> Result<()> {
        let _lock = FileLock::acquire(&dir.join(QUEUE_LOCK), LockMode::Exclusive, "queue")?;
        let mut queue = Self::load_unlocked(dir)?;
        queue.items.retain(|i| !keys.contains(&i.path));
        queue.save_unlocked(dir)
    }

    /// Removes entries by display index. Duplicate indices collapse,
    /// out-of-range indices are ignored; returns how many were removed.
    pub fn remove(dir: &Path, indices: &[usize]) -> Result<usize> {
        let _lock = FileLock::acquire(&dir.join(QUEUE_LOCK), LockMode::Exclusive, "queue")?;
        let mut queue = Self::load_unlocked(dir)?;
        let removed = remove_positions(&mut queue.items, indices);
        queue.save_unlocked(dir)?;
        Ok(removed)
    }

    pub fn clear(dir: &Path) -> Result<()> {
        let _lock = FileLock::acquire(&dir.join(QUEUE_LOCK), LockMode::Exclusive, "queue")?;
        let queue = Queue::default();
        queue.save_unlocked(dir)
    }

    fn load_unlocked(dir: &Path) -> Result<Self> {
        let path = dir.join(QUEUE_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let file: QueueFile = serde_json::from_str(&contents)?;
        Ok(Self { items: file.items })
    }

    fn save_unlocked(&self, dir: &Path) -> Result<()> {
        let path = dir.join(QUEUE_FILE);
        if self.items.is_empty() {
            debug!("queue empty, removing {}", path.display());
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }
        std::fs::create_dir_all(dir)?;
        let file = QueueFile {
            items: self.items.clone(),
            last_updated: Utc::now(),
        };
        write_atomic(&path, &serde_json::to_vec_pretty(&file)?)
    }

    fn add_in_memory(&mut self, items: &[MediaItem]) -> usize {
        let mut added = 0;
        for item in items {
            if !self.items.iter().any(|i| i.path == item.path) {
                self.items.push(item.clone());
                added += 1;
            }
        }
        added
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Deduplicates `indices` and removes from highest to lowest so earlier
/// positions stay valid while removing.
fn remove_positions(items: &mut Vec<MediaItem>, indices: &[usize]) -> usize {
    let mut sorted: Vec<usize> = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut removed = 0;
    for &idx in sorted.iter().rev() {
        if idx < items.len() {
            items.remove(idx);
            removed += 1;
        }
    }
    removed
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub position_ms: u64,
    pub updated_at: DateTime<Utc>,
}

/// Last known playback positions, keyed by server path. Advisory only; the
/// server's view offset stays authoritative.
pub struct ResumeStore;

impl ResumeStore {
    pub fn load(dir: &Path) -> Result<HashMap<String, ResumePoint>> {
        let _lock = FileLock::acquire(&dir.join(RESUME_LOCK), LockMode::Shared, "resume")?;
        Self::load_unlocked(dir)
    }

    pub fn get(dir: &Path, path: &str) -> Result<Option<ResumePoint>> {
        Ok(Self::load(dir)?.remove(path))
    }

    pub fn record(dir: &Path, item_path: &str, position_ms: u64) -> Result<()> {
        let _lock = FileLock::acquire(&dir.join(RESUME_LOCK), LockMode::Exclusive, "resume")?;
        let mut positions = Self::load_unlocked(dir)?;
        positions.insert(
            item_path.to_string(),
            ResumePoint {
                position_ms,
                updated_at: Utc::now(),
            },
        );
        std::fs::create_dir_all(dir)?;
        write_atomic(
            &dir.join(RESUME_FILE),
            &serde_json::to_vec_pretty(&positions)?,
        )
    }

    fn load_unlocked(dir: &Path) -> Result<HashMap<String, ResumePoint>> {
        let path = dir.join(RESUME_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    fn item(path: &str) -> MediaItem {
        MediaItem {
            path: path.to_string(),
            title: format!("title {path}"),
            kind: MediaKind::Movie,
            show_title: None,
            season_title: None,
            season: None,
            episode: None,
            year: Some(2020),
            duration_ms: 1000,
            rating: 0.0,
            summary: String::new(),
            content_rating: String::new(),
            genre: String::new(),
            director: String::new(),
            cast: String::new(),
            studio: String::new(),
            thumb: None,
            file_path: String::new(),
            transfer_path: String::new(),
            view_offset_ms: 0,
            view_count: 0,
            server_name: "srv".to_string(),
            server_url: "http://srv:32400".to_string(),
        }
    }

    #[test]
    fn write_atomic_replaces_and_cleans_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media.json");
        let tmp = dir.path().join("media.json.tmp");

        std::fs::write(&tmp, b"stale").unwrap();
        write_atomic(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        assert!(!tmp.exists());

        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn catalog_round_trips_up_to_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::default();
        catalog.replace(vec![item("/library/metadata/1"), item("/library/metadata/2")]);
        catalog.save(dir.path()).unwrap();

        let loaded = Catalog::load(dir.path()).unwrap();
        assert_eq!(loaded.items, catalog.items);
        assert_eq!(loaded.last_updated, catalog.last_updated);
    }

    #[test]
    fn catalog_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::load(dir.path()).unwrap();
        assert!(catalog.is_empty());
        assert!(catalog.last_updated.is_none());
    }

    #[test]
    fn catalog_merge_refreshes_and_appends() {
        let mut catalog = Catalog::default();
        catalog.replace(vec![item("/library/metadata/1")]);

        let mut updated = item("/library/metadata/1");
        updated.view_count = 3;
        let added = catalog.merge(vec![updated.clone(), item("/library/metadata/2")]);
        assert_eq!(added, 1);
        assert_eq!(catalog.items.len(), 2);
        assert_eq!(catalog.get("/library/metadata/1").unwrap().view_count, 3);
    }

    #[test]
    fn queue_add_deduplicates_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let added = Queue::add(dir.path(), &[item("/a/1"), item("/a/2")]).unwrap();
        assert_eq!(added, 2);

        let added = Queue::add(dir.path(), &[item("/a/2"), item("/a/3")]).unwrap();
        assert_eq!(added, 1);

        let queue = Queue::load(dir.path()).unwrap();
        let paths: Vec<_> = queue.items.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, ["/a/1", "/a/2", "/a/3"]);
    }

    #[test]
    fn queue_file_deleted_when_emptied() {
        let dir = tempfile::tempdir().unwrap();
        Queue::add(dir.path(), &[item("/a/1")]).unwrap();
        assert!(dir.path().join(QUEUE_FILE).exists());

        Queue::remove_by_keys(dir.path(), &["/a/1".to_string()]).unwrap();
        assert!(!dir.path().join(QUEUE_FILE).exists());
        assert!(Queue::load(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn merge_on_remove_preserves_concurrent_additions() {
        let dir = tempfile::tempdir().unwrap();
        Queue::add(dir.path(), &[item("/a/1"), item("/a/2")]).unwrap();

        // Instance A captures the queue as it stands.
        let snapshot = Queue::load(dir.path()).unwrap();
        let keys: Vec<String> = snapshot.items.iter().map(|i| i.path.clone()).collect();

        // Instance B adds a new item before A removes its batch.
        Queue::add(dir.path(), &[item("/b/x")]).unwrap();

        Queue::remove_by_keys(dir.path(), &keys).unwrap();
        let remaining = Queue::load(dir.path()).unwrap();
        let paths: Vec<_> = remaining.items.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, ["/b/x"]);
    }

    #[test]
    fn remove_positions_is_stable_under_duplicates() {
        let mut items = vec![item("/a/0"), item("/a/1"), item("/a/2"), item("/a/3")];
        let removed = remove_positions(&mut items, &[1, 3, 1, 9]);
        assert_eq!(removed, 2);
        let paths: Vec<_> = items.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, ["/a/0", "/a/2"]);
    }

    #[test]
    fn queue_remove_by_index_persists() {
        let dir = tempfile::tempdir().unwrap();
        Queue::add(dir.path(), &[item("/a/0"), item("/a/1"), item("/a/2")]).unwrap();
        let removed = Queue::remove(dir.path(), &[0, 2]).unwrap();
        assert_eq!(removed, 2);
        let queue = Queue::load(dir.path()).unwrap();
        assert_eq!(queue.items.len(), 1);
        assert_eq!(queue.items[0].path, "/a/1");
    }

    #[test]
    fn resume_store_records_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ResumeStore::get(dir.path(), "/a/1").unwrap().is_none());

        ResumeStore::record(dir.path(), "/a/1", 42_000).unwrap();
        ResumeStore::record(dir.path(), "/a/2", 7_000).unwrap();
        ResumeStore::record(dir.path(), "/a/1", 55_000).unwrap();

        let point = ResumeStore::get(dir.path(), "/a/1").unwrap().unwrap();
        assert_eq!(point.position_ms, 55_000);
        assert_eq!(ResumeStore::load(dir.path()).unwrap().len(), 2);
    }
}
