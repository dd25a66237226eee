#![forbid(unsafe_code)]

//! Durable per-item records.
//!
//! Every downloaded item owns a directory, and that directory owns a single
//! `video_info.json` describing where the item is in its lifecycle. The
//! record is the only thing the next run trusts when deciding whether an item
//! is done, so every write goes through a temp file in the same directory and
//! an atomic rename.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::RecordError;

pub const RECORD_FILE: &str = "video_info.json";
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Video,
    AudioTrack,
    SubtitleTrack,
    Thumbnail,
}

impl AssetKind {
    pub fn label(self) -> &'static str {
        match self {
            AssetKind::Video => "video",
            AssetKind::AudioTrack => "audio_track",
            AssetKind::SubtitleTrack => "subtitle_track",
            AssetKind::Thumbnail => "thumbnail",
        }
    }
}

/// One file that landed in the item directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub kind: AssetKind,
    /// Path relative to the item directory.
    pub relative_path: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl AssetDescriptor {
    /// Manifest slot: `video`, `thumbnail`, `subtitle_track.en`, ...
    pub fn slot(&self) -> String {
        match &self.language {
            Some(lang) => format!("{}.{}", self.kind.label(), lang),
            None => self.kind.label().to_owned(),
        }
    }
}

/// Asset slot -> descriptor, filled in as files land.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest {
    assets: BTreeMap<String, AssetDescriptor>,
}

impl AssetManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor unless its slot is already taken. Returns whether it
    /// was stored.
    pub fn insert(&mut self, descriptor: AssetDescriptor) -> bool {
        let slot = descriptor.slot();
        if self.assets.contains_key(&slot) {
            return false;
        }
        self.assets.insert(slot, descriptor);
        true
    }

    pub fn get(&self, slot: &str) -> Option<&AssetDescriptor> {
        self.assets.get(slot)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn kinds(&self) -> BTreeSet<AssetKind> {
        self.assets.values().map(|asset| asset.kind).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.assets.values().map(|asset| asset.size_bytes).sum()
    }

    /// Re-reads every descriptor from disk. Descriptors whose file is missing
    /// or empty are reported back by kind; the rest carry their on-disk size.
    fn verify(&self, dir: &Path) -> (AssetManifest, Vec<AssetKind>) {
        let mut verified = AssetManifest::new();
        let mut failed = Vec::new();
        for descriptor in self.assets.values() {
            let path = dir.join(&descriptor.relative_path);
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {
                    verified.insert(AssetDescriptor {
                        size_bytes: meta.len(),
                        ..descriptor.clone()
                    });
                }
                _ => failed.push(descriptor.kind),
            }
        }
        (verified, failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,
}

/// Metadata about the source video as reported by the fetcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webpage_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Persisted state of one playlist item.
///
/// Lifecycle fields are only changed through [`RecordStore`], which keeps the
/// on-disk copy and the in-memory copy in step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    #[serde(skip)]
    dir: PathBuf,
    schema_version: u32,
    item_id: String,
    origin_playlist: String,
    #[serde(rename = "lifecycle_state")]
    state: LifecycleState,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    removed_from_source: bool,
    #[serde(default, rename = "asset_manifest")]
    assets: AssetManifest,
    timestamps: Timestamps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    average_speed_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<SourceInfo>,
}

impl ItemRecord {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn origin_playlist(&self) -> &str {
        &self.origin_playlist
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.state == LifecycleState::Completed
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn removed_from_source(&self) -> bool {
        self.removed_from_source
    }

    pub fn assets(&self) -> &AssetManifest {
        &self.assets
    }

    pub fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    pub fn total_size_bytes(&self) -> Option<u64> {
        self.total_size_bytes
    }

    pub fn average_speed_mbps(&self) -> Option<f64> {
        self.average_speed_mbps
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn source(&self) -> Option<&SourceInfo> {
        self.source.as_ref()
    }

    /// Attaches source metadata. Persisted with the next store write.
    pub fn set_source(&mut self, source: SourceInfo) {
        self.source = Some(source);
    }

    fn pending(dir: &Path, item_id: &str, origin_playlist: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            schema_version: SCHEMA_VERSION,
            item_id: item_id.to_owned(),
            origin_playlist: origin_playlist.to_owned(),
            state: LifecycleState::Pending,
            retry_count: 0,
            removed_from_source: false,
            assets: AssetManifest::new(),
            timestamps: Timestamps {
                created_at: Utc::now(),
                download_started_at: None,
                completed_at: None,
                removed_at: None,
            },
            total_size_bytes: None,
            average_speed_mbps: None,
            last_error: None,
            source: None,
        }
    }

    fn invalid(&self, action: &'static str) -> RecordError {
        RecordError::InvalidStateTransition {
            item_id: self.item_id.clone(),
            from: self.state,
            action,
        }
    }
}

/// Reads and writes [`ItemRecord`]s inside item directories.
#[derive(Debug, Clone)]
pub struct RecordStore {
    file_name: String,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            file_name: RECORD_FILE.to_owned(),
        }
    }

    pub fn record_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file_name)
    }

    pub fn exists(&self, dir: &Path) -> bool {
        self.record_path(dir).is_file()
    }

    /// Creates a fresh PENDING record. Fails with `AlreadyExists` when the
    /// directory already holds one, even if another writer wins the race.
    pub fn create(
        &self,
        dir: &Path,
        item_id: &str,
        origin_playlist: &str,
    ) -> Result<ItemRecord, RecordError> {
        fs::create_dir_all(dir).map_err(|err| RecordError::io(dir, err))?;
        let path = self.record_path(dir);
        if path.exists() {
            return Err(RecordError::AlreadyExists(path));
        }

        let record = ItemRecord::pending(dir, item_id, origin_playlist);
        let temp = self.write_temp(&record)?;
        temp.persist_noclobber(&path).map_err(|err| {
            if err.error.kind() == std::io::ErrorKind::AlreadyExists {
                RecordError::AlreadyExists(path.clone())
            } else {
                RecordError::io(&path, err.error)
            }
        })?;
        debug!(item_id, dir = %dir.display(), "created record");
        Ok(record)
    }

    /// Replaces an unreadable record in `dir` with a fresh PENDING one.
    /// Readable records are returned as they are.
    pub fn recover(
        &self,
        dir: &Path,
        item_id: &str,
        origin_playlist: &str,
    ) -> Result<ItemRecord, RecordError> {
        match self.load(dir) {
            Err(RecordError::CorruptRecord { path, reason }) => {
                warn!(path = %path.display(), %reason, "replacing corrupt record");
                let record = ItemRecord::pending(dir, item_id, origin_playlist);
                self.save(&record)?;
                Ok(record)
            }
            other => other,
        }
    }

    /// Loads the record stored in `dir`.
    pub fn load(&self, dir: &Path) -> Result<ItemRecord, RecordError> {
        let path = self.record_path(dir);
        let raw = fs::read_to_string(&path).map_err(|err| RecordError::io(&path, err))?;
        let mut record: ItemRecord =
            serde_json::from_str(&raw).map_err(|err| RecordError::CorruptRecord {
                path: path.clone(),
                reason: err.to_string(),
            })?;

        if record.item_id.trim().is_empty() {
            return Err(RecordError::CorruptRecord {
                path,
                reason: "empty item_id".into(),
            });
        }
        if record.removed_from_source && !record.is_completed() {
            return Err(RecordError::CorruptRecord {
                path,
                reason: format!("removed_from_source set while {:?}", record.state),
            });
        }

        record.dir = dir.to_path_buf();
        Ok(record)
    }

    /// PENDING/FAILED -> DOWNLOADING. Calling it on a DOWNLOADING record is a
    /// no-op.
    pub fn mark_downloading(&self, record: &mut ItemRecord) -> Result<(), RecordError> {
        match record.state() {
            LifecycleState::Downloading => Ok(()),
            LifecycleState::Pending | LifecycleState::Failed => self.update(record, |next| {
                next.state = LifecycleState::Downloading;
                next.timestamps.download_started_at = Some(Utc::now());
            }),
            LifecycleState::Completed => Err(record.invalid("start downloading")),
        }
    }

    /// DOWNLOADING -> COMPLETED, once every expected asset kind is on disk.
    ///
    /// On `IncompleteAssets` nothing is written and the record keeps its
    /// current state.
    pub fn mark_completed(
        &self,
        record: &mut ItemRecord,
        manifest: AssetManifest,
        expected: &BTreeSet<AssetKind>,
    ) -> Result<(), RecordError> {
        if record.state != LifecycleState::Downloading {
            return Err(record.invalid("complete"));
        }

        let (verified, mut missing) = manifest.verify(&record.dir);
        let present = verified.kinds();
        missing.extend(expected.iter().copied().filter(|kind| !present.contains(kind)));
        if verified.is_empty() && missing.is_empty() {
            missing.push(AssetKind::Video);
        }
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(RecordError::missing_kinds(&record.item_id, &missing));
        }

        let now = Utc::now();
        let total = verified.total_bytes();
        let started = record.timestamps.download_started_at.unwrap_or(now);
        let elapsed_secs = ((now - started).num_milliseconds() as f64 / 1000.0).max(0.001);
        let speed_mbps = total as f64 * 8.0 / 1_000_000.0 / elapsed_secs;

        self.update(record, |next| {
            next.state = LifecycleState::Completed;
            next.assets = verified;
            next.timestamps.completed_at = Some(now);
            next.total_size_bytes = Some(total);
            next.average_speed_mbps = Some(speed_mbps);
            next.last_error = None;
        })
    }

    /// Any non-completed state -> FAILED. Partial files stay where they are so
    /// the fetcher can resume them next time.
    pub fn mark_failed(&self, record: &mut ItemRecord, reason: &str) -> Result<(), RecordError> {
        if record.is_completed() {
            return Err(record.invalid("fail"));
        }
        self.update(record, |next| {
            next.state = LifecycleState::Failed;
            next.retry_count += 1;
            next.last_error = Some(reason.to_owned());
        })
    }

    /// Flags a COMPLETED record as removed from the remote playlist.
    pub fn mark_removed(&self, record: &mut ItemRecord) -> Result<(), RecordError> {
        if !record.is_completed() {
            return Err(record.invalid("mark removed"));
        }
        if record.removed_from_source {
            return Ok(());
        }
        self.update(record, |next| {
            next.removed_from_source = true;
            next.timestamps.removed_at = Some(Utc::now());
        })
    }

    /// Applies `change` to a copy, persists it, and only then swaps it in.
    fn update(
        &self,
        record: &mut ItemRecord,
        change: impl FnOnce(&mut ItemRecord),
    ) -> Result<(), RecordError> {
        let mut next = record.clone();
        change(&mut next);
        next.schema_version = SCHEMA_VERSION;
        self.save(&next)?;
        *record = next;
        Ok(())
    }

    fn save(&self, record: &ItemRecord) -> Result<(), RecordError> {
        let path = self.record_path(&record.dir);
        let temp = self.write_temp(record)?;
        temp.persist(&path)
            .map_err(|err| RecordError::io(&path, err.error))?;
        Ok(())
    }

    fn write_temp(&self, record: &ItemRecord) -> Result<NamedTempFile, RecordError> {
        let dir = &record.dir;
        let mut temp = tempfile::Builder::new()
            .prefix(".video_info")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|err| RecordError::io(dir, err))?;
        let payload = serde_json::to_vec_pretty(record).map_err(|err| RecordError::CorruptRecord {
            path: self.record_path(dir),
            reason: err.to_string(),
        })?;
        temp.write_all(&payload)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| RecordError::io(temp.path(), err))?;
        Ok(temp)
    }
}
