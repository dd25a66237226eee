#![forbid(unsafe_code)]

//! Media fetching.
//!
//! [`MediaFetcher`] is the seam the engine talks to. [`YtDlpFetcher`] shells
//! out to `yt-dlp`, which owns resume semantics (`--continue`, `.part`
//! files), and then inventories whatever landed in the item directory.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::record::{AssetDescriptor, AssetKind, AssetManifest, RECORD_FILE, SourceInfo};

/// What a fetch produced.
#[derive(Debug, Clone, Default)]
pub struct FetchedAssets {
    pub manifest: AssetManifest,
    /// Asset kinds the fetch attempted; completion requires each of them.
    pub expected: BTreeSet<AssetKind>,
    pub source: Option<SourceInfo>,
}

/// Downloads every asset of one item into `target_dir`.
///
/// Must be safe to call again on a directory left behind by an interrupted
/// attempt.
pub trait MediaFetcher {
    fn fetch(&self, item_id: &str, url: &str, target_dir: &Path) -> Result<FetchedAssets, FetchError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpOptions {
    pub program: PathBuf,
    pub subtitle_languages: String,
    pub max_height: u32,
    pub socket_timeout_secs: u32,
    pub retries: u32,
    pub cookies_file: Option<PathBuf>,
}

impl Default for YtDlpOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            subtitle_languages: "en.*,zh.*".to_owned(),
            max_height: 2160,
            socket_timeout_secs: 30,
            retries: 3,
            cookies_file: None,
        }
    }
}

/// Only the fields of yt-dlp's `.info.json` we care about.
#[derive(Debug, Default, Deserialize)]
struct InfoJson {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    original_url: Option<String>,
    #[serde(default)]
    view_count: Option<i64>,
    #[serde(default)]
    like_count: Option<i64>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    requested_subtitles: Option<HashMap<String, Value>>,
}

impl InfoJson {
    fn source_info(&self) -> SourceInfo {
        SourceInfo {
            title: self.title.clone(),
            uploader: self.uploader.clone(),
            upload_date: self.upload_date.clone(),
            duration_secs: self.duration,
            webpage_url: self.webpage_url.clone().or_else(|| self.original_url.clone()),
            view_count: self.view_count,
            like_count: self.like_count,
            tags: self.tags.clone().unwrap_or_default(),
        }
    }

    fn expected_kinds(&self) -> BTreeSet<AssetKind> {
        let mut kinds = BTreeSet::from([AssetKind::Video]);
        if self
            .requested_subtitles
            .as_ref()
            .is_some_and(|subs| !subs.is_empty())
        {
            kinds.insert(AssetKind::SubtitleTrack);
        }
        if self.thumbnail.as_deref().is_some_and(|url| !url.is_empty()) {
            kinds.insert(AssetKind::Thumbnail);
        }
        kinds
    }
}

pub struct YtDlpFetcher {
    options: YtDlpOptions,
}

impl YtDlpFetcher {
    pub fn new(options: YtDlpOptions) -> Self {
        Self { options }
    }

    /// Runs `<program> --version` so a missing binary fails the run up front.
    pub fn ensure_available(&self) -> Result<String, FetchError> {
        let program = self.program_label();
        let output = Command::new(&self.options.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|source| FetchError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(FetchError::Exited {
                program,
                status: output.status.to_string(),
                detail: "version check failed".into(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn program_label(&self) -> String {
        self.options.program.to_string_lossy().into_owned()
    }

    fn command(&self, url: &str, target_dir: &Path) -> Command {
        let options = &self.options;
        let output_template = target_dir.join("%(id)s.%(ext)s");
        let mut command = Command::new(&options.program);
        command
            .arg(url)
            .arg("--output")
            .arg(output_template.to_string_lossy().to_string())
            .arg("--format")
            .arg(format!("best[height<=?{}]", options.max_height))
            .arg("--write-subs")
            .arg("--write-auto-subs")
            .arg("--sub-langs")
            .arg(&options.subtitle_languages)
            .arg("--write-thumbnail")
            .arg("--write-info-json")
            .arg("--write-description")
            .arg("--continue")
            .arg("--no-overwrites")
            .arg("--part")
            .arg("--no-progress")
            .arg("--retries")
            .arg(options.retries.to_string())
            .arg("--fragment-retries")
            .arg(options.retries.to_string())
            .arg("--socket-timeout")
            .arg(options.socket_timeout_secs.to_string());

        if let Some(cookies) = options.cookies_file.as_ref().filter(|path| path.exists()) {
            command.arg("--cookies").arg(cookies.to_string_lossy().to_string());
        }

        command.stdin(Stdio::null());
        command
    }
}

impl MediaFetcher for YtDlpFetcher {
    fn fetch(&self, item_id: &str, url: &str, target_dir: &Path) -> Result<FetchedAssets, FetchError> {
        fs::create_dir_all(target_dir).map_err(|source| FetchError::Io {
            path: target_dir.to_path_buf(),
            source,
        })?;

        info!(item_id, dir = %target_dir.display(), "fetching media");
        let program = self.program_label();
        // Output is captured, never forwarded: stdout belongs to the path list.
        let output = self
            .command(url, target_dir)
            .output()
            .map_err(|source| FetchError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let detail = tail.into_iter().rev().collect::<Vec<_>>().join(" | ");
            return Err(FetchError::Exited {
                program,
                status: output.status.to_string(),
                detail,
            });
        }

        let info = read_info_json(target_dir, item_id);
        let manifest = scan_assets(item_id, target_dir)?;
        let expected = info
            .as_ref()
            .map(InfoJson::expected_kinds)
            .unwrap_or_else(|| BTreeSet::from([AssetKind::Video]));
        debug!(
            item_id,
            assets = manifest.len(),
            bytes = manifest.total_bytes(),
            "fetch finished"
        );

        Ok(FetchedAssets {
            manifest,
            expected,
            source: info.as_ref().map(InfoJson::source_info),
        })
    }
}

/// Inventories finished files in `dir`. Partial downloads, yt-dlp side files
/// and the record itself are not assets.
pub fn scan_assets(item_id: &str, dir: &Path) -> Result<AssetManifest, FetchError> {
    let io_err = |source| FetchError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let meta = entry.metadata().map_err(io_err)?;
        if !meta.is_file() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .unwrap_or_else(|os| os.to_string_lossy().into_owned());
        entries.push((name, meta.len()));
    }
    entries.sort();

    let mut manifest = AssetManifest::new();
    for (name, size) in entries {
        let Some((kind, language)) = classify_file(item_id, &name) else {
            continue;
        };
        manifest.insert(AssetDescriptor {
            kind,
            relative_path: name,
            size_bytes: size,
            language,
        });
    }
    Ok(manifest)
}

/// Maps a file name to its asset kind (and language for tracks).
fn classify_file(item_id: &str, name: &str) -> Option<(AssetKind, Option<String>)> {
    let lower = name.to_ascii_lowercase();
    if name.starts_with('.')
        || name == RECORD_FILE
        || [".part", ".ytdl", ".info.json", ".description", ".tmp", ".temp"]
            .iter()
            .any(|suffix| lower.ends_with(suffix))
        || lower.contains(".part-frag")
    {
        return None;
    }

    let (stem, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    let kind = match ext.as_str() {
        "mp4" | "mkv" | "webm" | "mov" => AssetKind::Video,
        "m4a" | "mp3" | "opus" | "aac" | "wav" | "flac" => AssetKind::AudioTrack,
        "vtt" | "srt" | "ass" | "ttml" | "srv1" | "srv2" | "srv3" | "json3" => {
            AssetKind::SubtitleTrack
        }
        "jpg" | "jpeg" | "png" | "webp" => AssetKind::Thumbnail,
        _ => return None,
    };

    // Pre-merge format fragments look like `<id>.f137.mp4`.
    let is_format_fragment = stem.rsplit_once('.').is_some_and(|(_, tag)| {
        tag.len() > 1 && tag.starts_with('f') && tag[1..].chars().all(|c| c.is_ascii_digit())
    });
    if is_format_fragment {
        return None;
    }

    let language = match kind {
        AssetKind::SubtitleTrack | AssetKind::AudioTrack => {
            let rest = stem
                .strip_prefix(item_id)
                .and_then(|rest| rest.strip_prefix('.'))
                .or_else(|| stem.rsplit_once('.').map(|(_, lang)| lang));
            rest.filter(|lang| !lang.is_empty() && !lang.contains('.'))
                .map(str::to_owned)
        }
        _ => None,
    };
    Some((kind, language))
}

fn read_info_json(dir: &Path, item_id: &str) -> Option<InfoJson> {
    let preferred = dir.join(format!("{item_id}.info.json"));
    let path = if preferred.is_file() {
        preferred
    } else {
        fs::read_dir(dir)
            .ok()?
            .flatten()
            .map(|entry| entry.path())
            .find(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(".info.json"))
            })?
    };

    let file = File::open(&path).ok()?;
    match serde_json::from_reader(BufReader::new(file)) {
        Ok(info) => Some(info),
        Err(err) => {
            warn!(path = %path.display(), "could not parse info json: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn classify_file_recognizes_asset_kinds() {
        assert_eq!(classify_file("abc", "abc.mp4"), Some((AssetKind::Video, None)));
        assert_eq!(
            classify_file("abc", "abc.en-US.vtt"),
            Some((AssetKind::SubtitleTrack, Some("en-US".into())))
        );
        assert_eq!(classify_file("abc", "abc.webp"), Some((AssetKind::Thumbnail, None)));
        assert_eq!(classify_file("abc", "abc.m4a"), Some((AssetKind::AudioTrack, None)));
    }

    #[test]
    fn classify_file_skips_partials_and_side_files() {
        for name in [
            "abc.mp4.part",
            "abc.info.json",
            "abc.description",
            "abc.mp4.ytdl",
            "abc.f137.mp4",
            "abc.mp4.part-Frag3",
            RECORD_FILE,
            ".video_info123.tmp",
            "notes.txt",
        ] {
            assert_eq!(classify_file("abc", name), None, "{name}");
        }
    }

    #[test]
    fn scan_assets_reports_sizes() -> Result<()> {
        let temp = tempdir()?;
        fs::write(temp.path().join("abc.mp4"), b"12345")?;
        fs::write(temp.path().join("abc.jpg"), b"12")?;
        fs::write(temp.path().join("abc.zh.vtt"), b"1")?;
        fs::write(temp.path().join("abc.mkv.part"), b"123")?;
        let manifest = scan_assets("abc", temp.path())?;
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.total_bytes(), 8);
        assert!(manifest.get("subtitle_track.zh").is_some());
        Ok(())
    }

    #[test]
    fn info_json_drives_expected_kinds() {
        let info: InfoJson = serde_json::from_str(
            r#"{"title":"T","thumbnail":"https://i.ytimg.com/x.jpg","requested_subtitles":{"en":{}}}"#,
        )
        .unwrap();
        assert_eq!(
            info.expected_kinds(),
            BTreeSet::from([AssetKind::Video, AssetKind::SubtitleTrack, AssetKind::Thumbnail])
        );
        let bare: InfoJson = serde_json::from_str(r#"{"requested_subtitles":null}"#).unwrap();
        assert_eq!(bare.expected_kinds(), BTreeSet::from([AssetKind::Video]));
    }

    #[cfg(unix)]
    fn install_ytdlp_stub(dir: &Path, exit_code: i32) -> Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        let script = format!(
            r#"#!/usr/bin/env bash
set -eu
if [[ "${{1:-}}" == "--version" ]]; then
  echo "2024.01.01"
  exit 0
fi
output=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
  esac
  shift
done
if [[ {exit_code} -ne 0 ]]; then
  echo "ERROR: unable to download video data" >&2
  exit {exit_code}
fi
dir="$(dirname "$output")"
mkdir -p "$dir"
printf '%s' '{{"id":"alpha","title":"Alpha","uploader":"Chan","thumbnail":"https://i/x.jpg","requested_subtitles":{{"en":{{"ext":"vtt"}}}}}}' > "$dir/alpha.info.json"
echo "video-data" > "$dir/alpha.mp4"
echo "thumb" > "$dir/alpha.jpg"
echo "WEBVTT" > "$dir/alpha.en.vtt"
echo "noise on stdout"
exit 0
"#
        );
        fs::write(&script_path, script)?;
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
        Ok(script_path)
    }

    #[cfg(unix)]
    #[test]
    fn ytdlp_fetch_collects_manifest_and_metadata() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path(), 0)?;
        let fetcher = YtDlpFetcher::new(YtDlpOptions {
            program: stub,
            ..YtDlpOptions::default()
        });
        assert_eq!(fetcher.ensure_available()?, "2024.01.01");

        let target = temp.path().join("item");
        let fetched = fetcher.fetch("alpha", "https://www.youtube.com/watch?v=alpha", &target)?;
        assert!(fetched.manifest.get("video").is_some());
        assert!(fetched.manifest.get("thumbnail").is_some());
        assert!(fetched.manifest.get("subtitle_track.en").is_some());
        assert_eq!(
            fetched.expected,
            BTreeSet::from([AssetKind::Video, AssetKind::SubtitleTrack, AssetKind::Thumbnail])
        );
        let source = fetched.source.expect("source info");
        assert_eq!(source.title.as_deref(), Some("Alpha"));
        assert_eq!(source.uploader.as_deref(), Some("Chan"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn ytdlp_failure_reports_stderr_tail() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path(), 1)?;
        let fetcher = YtDlpFetcher::new(YtDlpOptions {
            program: stub,
            ..YtDlpOptions::default()
        });
        let err = fetcher
            .fetch("alpha", "https://www.youtube.com/watch?v=alpha", &temp.path().join("item"))
            .unwrap_err();
        match err {
            FetchError::Exited { detail, .. } => assert!(detail.contains("unable to download")),
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let fetcher = YtDlpFetcher::new(YtDlpOptions {
            program: PathBuf::from("/nonexistent/yt-dlp-binary"),
            ..YtDlpOptions::default()
        });
        assert!(matches!(fetcher.ensure_available(), Err(FetchError::Spawn { .. })));
    }
}
