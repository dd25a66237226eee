#![forbid(unsafe_code)]

//! Reconciliation engine.
//!
//! One cycle per playlist: list the remote entries, rebuild the local index,
//! diff against the completed set, then run the per-item pipeline for each
//! new entry. Removal from the playlist always comes after the record is
//! durably COMPLETED.

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use crate::error::{RecordError, RemoteError};
use crate::fetcher::MediaFetcher;
use crate::index::{self, LocalIndex};
use crate::naming::{DEFAULT_TITLE_LIMIT, item_directory_name, watch_url};
use crate::record::{ItemRecord, RecordStore};
use crate::remote::{PlaylistLister, PlaylistRef, PlaylistRemover, RemoteItem};

/// A playlist together with the directory its items are downloaded into.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub playlist: PlaylistRef,
    pub download_directory: PathBuf,
}

/// Exponential backoff between attempts of a listing or a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Counters for one run, threaded through every cycle explicitly.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub playlists_processed: u32,
    pub playlists_skipped: u32,
    pub new_downloaded: u32,
    pub skipped_existing: u32,
    pub failed: u32,
    pub removal_failures: u32,
    started: Instant,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            playlists_processed: 0,
            playlists_skipped: 0,
            new_downloaded: 0,
            skipped_existing: 0,
            failed: 0,
            removal_failures: 0,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// A playlist was skipped, or every item we attempted failed.
    pub fn is_degraded(&self) -> bool {
        self.playlists_skipped > 0 || (self.failed > 0 && self.new_downloaded == 0)
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "playlists processed: {}, skipped: {}; new downloads: {}, already present: {}, failed: {}, removal failures: {}; elapsed {:.1}s",
            self.playlists_processed,
            self.playlists_skipped,
            self.new_downloaded,
            self.skipped_existing,
            self.failed,
            self.removal_failures,
            self.elapsed().as_secs_f64()
        )
    }
}

pub struct Engine<'a> {
    lister: &'a dyn PlaylistLister,
    remover: &'a dyn PlaylistRemover,
    fetcher: &'a dyn MediaFetcher,
    store: RecordStore,
    retry: RetryPolicy,
    fetch_retry: RetryPolicy,
    today: NaiveDate,
    retry_stale_removals: bool,
}

impl<'a> Engine<'a> {
    /// `today` is the date stamped into new item directory names.
    pub fn new(
        lister: &'a dyn PlaylistLister,
        remover: &'a dyn PlaylistRemover,
        fetcher: &'a dyn MediaFetcher,
        today: NaiveDate,
    ) -> Self {
        Self {
            lister,
            remover,
            fetcher,
            store: RecordStore::new(),
            retry: RetryPolicy::default(),
            fetch_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(30),
            },
            today,
            retry_stale_removals: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attempts per item within one run. The record is only marked FAILED
    /// once they are used up.
    pub fn with_fetch_retry(mut self, fetch_retry: RetryPolicy) -> Self {
        self.fetch_retry = fetch_retry;
        self
    }

    /// Also retry the playlist removal of items that completed earlier but
    /// were never removed.
    pub fn with_stale_removals(mut self, enabled: bool) -> Self {
        self.retry_stale_removals = enabled;
        self
    }

    /// Runs one cycle per target, in order. Each completed item's absolute
    /// directory is written to `out`, one per line.
    pub fn run(&self, targets: &[SyncTarget], out: &mut dyn Write) -> RunStats {
        let mut stats = RunStats::new();
        for target in targets {
            if let Err(err) = self.sync_playlist(target, &mut stats, out) {
                error!(playlist = %target.playlist.name, "skipping playlist: {err}");
                stats.playlists_skipped += 1;
            }
        }
        stats
    }

    /// One reconciliation cycle. An error means the playlist was skipped;
    /// item-level failures are only counted.
    pub fn sync_playlist(
        &self,
        target: &SyncTarget,
        stats: &mut RunStats,
        out: &mut dyn Write,
    ) -> Result<(), RemoteError> {
        let playlist = &target.playlist;
        info!(playlist = %playlist.name, "starting cycle");

        let remote = self.list_with_retry(playlist)?;
        let local = index::scan(&target.download_directory, &self.store);

        let mut seen = HashSet::new();
        let mut new_items = Vec::new();
        for item in remote {
            if !seen.insert(item.item_id.clone()) {
                continue;
            }
            if local.is_completed(&item.item_id) {
                stats.skipped_existing += 1;
                if self.retry_stale_removals {
                    self.retry_stale_removal(target, &local, &item, stats);
                }
            } else {
                new_items.push(item);
            }
        }

        info!(
            playlist = %playlist.name,
            new = new_items.len(),
            existing = local.completed.len(),
            "diff computed"
        );

        for item in &new_items {
            self.process_item(target, &local, item, stats, out);
        }

        stats.playlists_processed += 1;
        info!(playlist = %playlist.name, "cycle done");
        Ok(())
    }

    fn list_with_retry(&self, playlist: &PlaylistRef) -> Result<Vec<RemoteItem>, RemoteError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.lister.list_items(playlist) {
                Ok(items) => return Ok(items),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        playlist = %playlist.name,
                        attempt,
                        max_attempts,
                        "listing failed, retrying in {delay:?}: {err}"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Per-item pipeline. Failures stop this item only.
    fn process_item(
        &self,
        target: &SyncTarget,
        local: &LocalIndex,
        item: &RemoteItem,
        stats: &mut RunStats,
        out: &mut dyn Write,
    ) {
        let playlist = &target.playlist;
        let item_id = item.item_id.as_str();
        let dir = match local.resume_dir(item_id) {
            Some(dir) => dir.to_path_buf(),
            None => target.download_directory.join(item_directory_name(
                self.today,
                &item.title,
                item_id,
                DEFAULT_TITLE_LIMIT,
            )),
        };

        let mut record = match self.open_record(&dir, item_id, &playlist.name) {
            Ok(record) => record,
            Err(err) => {
                error!(item_id, dir = %dir.display(), "cannot open record: {err}");
                stats.failed += 1;
                return;
            }
        };
        if record.is_completed() {
            debug!(item_id, "record already completed");
            stats.skipped_existing += 1;
            return;
        }

        if let Err(err) = self.store.mark_downloading(&mut record) {
            error!(item_id, "cannot start download: {err}");
            stats.failed += 1;
            return;
        }

        let max_attempts = self.fetch_retry.max_attempts.max(1);
        let mut attempt = 1;
        while let Err(reason) = self.fetch_and_complete(item_id, &dir, &mut record) {
            if attempt >= max_attempts {
                warn!(item_id, attempts = attempt, %reason, "item failed");
                if let Err(err) = self.store.mark_failed(&mut record, &reason) {
                    error!(item_id, "could not record failure: {err}");
                }
                stats.failed += 1;
                return;
            }
            let delay = self.fetch_retry.delay_for(attempt);
            warn!(
                item_id,
                attempt,
                max_attempts,
                "download failed, retrying in {delay:?}: {reason}"
            );
            thread::sleep(delay);
            attempt += 1;
        }
        info!(
            item_id,
            bytes = record.total_size_bytes().unwrap_or_default(),
            "item completed"
        );

        self.remove_from_playlist(playlist, item, &mut record, stats);
        emit_path(out, &dir);
        stats.new_downloaded += 1;
    }

    /// One download attempt. Partial files from earlier attempts stay in
    /// `dir` for the fetcher to resume.
    fn fetch_and_complete(
        &self,
        item_id: &str,
        dir: &Path,
        record: &mut ItemRecord,
    ) -> Result<(), String> {
        let fetched = self
            .fetcher
            .fetch(item_id, &watch_url(item_id), dir)
            .map_err(|err| err.to_string())?;
        if let Some(source) = fetched.source {
            record.set_source(source);
        }
        self.store
            .mark_completed(record, fetched.manifest, &fetched.expected)
            .map_err(|err| err.to_string())
    }

    /// Creates the record, or picks up the one an earlier attempt left behind.
    fn open_record(
        &self,
        dir: &Path,
        item_id: &str,
        origin_playlist: &str,
    ) -> Result<ItemRecord, RecordError> {
        match self.store.create(dir, item_id, origin_playlist) {
            Err(RecordError::AlreadyExists(_)) => {
                debug!(item_id, dir = %dir.display(), "resuming existing record");
                self.store.recover(dir, item_id, origin_playlist)
            }
            other => other,
        }
    }

    fn remove_from_playlist(
        &self,
        playlist: &PlaylistRef,
        item: &RemoteItem,
        record: &mut ItemRecord,
        stats: &mut RunStats,
    ) {
        match self.remover.remove_item(playlist, item) {
            Ok(()) => {
                if let Err(err) = self.store.mark_removed(record) {
                    warn!(item_id = %item.item_id, "could not flag record as removed: {err}");
                }
            }
            Err(err) => {
                error!(
                    playlist = %playlist.name,
                    item_id = %item.item_id,
                    "removal from playlist failed: {err}"
                );
                stats.removal_failures += 1;
            }
        }
    }

    fn retry_stale_removal(
        &self,
        target: &SyncTarget,
        local: &LocalIndex,
        item: &RemoteItem,
        stats: &mut RunStats,
    ) {
        let Some(dir) = local.unremoved.get(&item.item_id) else {
            return;
        };
        let mut record = match self.store.load(dir) {
            Ok(record) => record,
            Err(err) => {
                warn!(item_id = %item.item_id, "cannot reload record: {err}");
                return;
            }
        };
        info!(item_id = %item.item_id, "retrying stale removal");
        self.remove_from_playlist(&target.playlist, item, &mut record, stats);
    }
}

fn emit_path(out: &mut dyn Write, dir: &Path) {
    let absolute = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
    if let Err(err) = writeln!(out, "{}", absolute.display()).and_then(|_| out.flush()) {
        warn!(dir = %absolute.display(), "could not write output path: {err}");
    }
}
