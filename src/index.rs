#![forbid(unsafe_code)]

//! Rebuilds "what is already done" from the download root on every run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::record::RecordStore;

/// Snapshot of a playlist's download root.
#[derive(Debug, Default, Clone)]
pub struct LocalIndex {
    /// Item ids whose record is COMPLETED.
    pub completed: HashSet<String>,
    /// Completed items still waiting for their remote removal.
    pub unremoved: HashMap<String, PathBuf>,
    /// Directories of records that exist but are not COMPLETED, by item id.
    pub in_progress: HashMap<String, PathBuf>,
}

impl LocalIndex {
    pub fn is_completed(&self, item_id: &str) -> bool {
        self.completed.contains(item_id)
    }

    pub fn resume_dir(&self, item_id: &str) -> Option<&Path> {
        self.in_progress.get(item_id).map(PathBuf::as_path)
    }
}

/// Walks the immediate subdirectories of `root` and reads each record.
///
/// Missing, unreadable, or corrupt records are skipped with a warning; they
/// never abort the scan. A missing root is an empty index.
pub fn scan(root: &Path, store: &RecordStore) -> LocalIndex {
    let mut index = LocalIndex::default();
    if !root.exists() {
        warn!(root = %root.display(), "download directory does not exist");
        return index;
    }

    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(root = %root.display(), "skipping unreadable entry: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_dir())
    {
        let dir = entry.path();
        if !store.exists(dir) {
            warn!(dir = %dir.display(), "directory has no record, skipping");
            continue;
        }

        let record = match store.load(dir) {
            Ok(record) => record,
            Err(err) => {
                warn!(dir = %dir.display(), "ignoring unreadable record: {err}");
                continue;
            }
        };

        let item_id = record.item_id().to_owned();
        if record.is_completed() {
            if !record.removed_from_source() {
                index.unremoved.insert(item_id.clone(), dir.to_path_buf());
            }
            index.in_progress.remove(&item_id);
            index.completed.insert(item_id);
        } else if !index.completed.contains(&item_id) {
            index
                .in_progress
                .entry(item_id)
                .or_insert_with(|| dir.to_path_buf());
        }
    }

    info!(
        root = %root.display(),
        completed = index.completed.len(),
        in_progress = index.in_progress.len(),
        "scanned download directory"
    );
    index
}

/// Ids of every item whose record under `root` is COMPLETED.
pub fn build_index(root: &Path, store: &RecordStore) -> HashSet<String> {
    scan(root, store).completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AssetDescriptor, AssetKind, AssetManifest};
    use anyhow::Result;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::fs;
    use std::io;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Collects formatted log lines in memory.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn completed_item(root: &Path, name: &str, id: &str) -> Result<PathBuf> {
        let store = RecordStore::new();
        let dir = root.join(name);
        let mut record = store.create(&dir, id, "list")?;
        store.mark_downloading(&mut record)?;
        fs::write(dir.join(format!("{id}.mp4")), b"data")?;
        let mut manifest = AssetManifest::new();
        manifest.insert(AssetDescriptor {
            kind: AssetKind::Video,
            relative_path: format!("{id}.mp4"),
            size_bytes: 4,
            language: None,
        });
        store.mark_completed(&mut record, manifest, &BTreeSet::from([AssetKind::Video]))?;
        Ok(dir)
    }

    #[test]
    fn empty_and_missing_roots_yield_nothing() -> Result<()> {
        let temp = tempdir()?;
        let store = RecordStore::new();
        assert!(build_index(temp.path(), &store).is_empty());
        assert!(build_index(&temp.path().join("missing"), &store).is_empty());
        Ok(())
    }

    #[test]
    fn corrupt_record_is_excluded_without_failing() -> Result<()> {
        let temp = tempdir()?;
        let store = RecordStore::new();
        completed_item(temp.path(), "a", "id-a")?;
        completed_item(temp.path(), "b", "id-b")?;
        let broken = completed_item(temp.path(), "c", "id-c")?;
        fs::write(store.record_path(&broken), "{\"item_id\": ")?;

        let ids = build_index(temp.path(), &store);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("id-a"));
        assert!(ids.contains("id-b"));
        Ok(())
    }

    #[test]
    fn unfinished_records_are_not_done_but_are_resumable() -> Result<()> {
        let temp = tempdir()?;
        let store = RecordStore::new();
        completed_item(temp.path(), "done", "v1")?;
        let mut pending = store.create(&temp.path().join("half"), "v2", "list")?;
        store.mark_downloading(&mut pending)?;
        fs::create_dir(temp.path().join("no-record"))?;
        fs::write(temp.path().join("stray.txt"), b"not a dir")?;

        let index = scan(temp.path(), &store);
        assert!(index.is_completed("v1"));
        assert!(!index.is_completed("v2"));
        assert_eq!(index.resume_dir("v2"), Some(temp.path().join("half").as_path()));
        assert_eq!(index.unremoved.len(), 1);
        Ok(())
    }

    #[test]
    fn completed_copy_wins_over_stale_attempt() -> Result<()> {
        let temp = tempdir()?;
        let store = RecordStore::new();
        store.create(&temp.path().join("a_old"), "v1", "list")?;
        completed_item(temp.path(), "b_new", "v1")?;

        let index = scan(temp.path(), &store);
        assert!(index.is_completed("v1"));
        assert!(index.resume_dir("v1").is_none());
        Ok(())
    }

    #[test]
    fn directory_without_record_is_reported_as_a_warning() -> Result<()> {
        let temp = tempdir()?;
        fs::create_dir(temp.path().join("2024-05-01_Stray_x1"))?;

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();
        let index = tracing::subscriber::with_default(subscriber, || {
            scan(temp.path(), &RecordStore::new())
        });

        assert!(index.completed.is_empty());
        assert!(index.in_progress.is_empty());
        let logs = String::from_utf8(captured.0.lock().clone())?;
        assert!(logs.contains("WARN"));
        assert!(logs.contains("directory has no record"));
        Ok(())
    }
}
