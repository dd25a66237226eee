#![forbid(unsafe_code)]

//! Configuration loading.
//!
//! The settings live in a TOML file. Its location comes from, in order: the
//! command line, the `YTPL_SYNC_CONFIG` environment variable, the same key in
//! a `.env` file, and finally `ytpl-sync.toml` in the working directory.
//! Relative paths inside the file are resolved against the file's directory.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::engine::{RetryPolicy, SyncTarget};
use crate::error::ConfigError;
use crate::fetcher::YtDlpOptions;
use crate::remote::PlaylistRef;

pub const DEFAULT_CONFIG_PATH: &str = "ytpl-sync.toml";
pub const DEFAULT_ENV_PATH: &str = ".env";
pub const CONFIG_PATH_KEY: &str = "YTPL_SYNC_CONFIG";

const FETCH_MAX_DELAY: Duration = Duration::from_secs(30);
const PLAYLIST_HOSTS: [&str; 3] = ["youtube.com", "www.youtube.com", "m.youtube.com"];

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub client_secrets_file: PathBuf,
    pub token_storage_file: PathBuf,
    pub check_interval_seconds: u64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub retry_stale_removals: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            client_secrets_file: PathBuf::from("client_secret.json"),
            token_storage_file: PathBuf::from("token.json"),
            check_interval_seconds: 3600,
            log_level: "info".to_owned(),
            log_file: None,
            retry_stale_removals: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherSettings {
    pub program: PathBuf,
    pub subtitle_languages: String,
    pub max_height: u32,
    pub socket_timeout_secs: u32,
    pub retries: u32,
    pub cookies_file: Option<PathBuf>,
    /// Download attempts per item within one run, including the first.
    pub attempts: u32,
    /// Wait before the second attempt; doubles after that, up to 30s.
    pub retry_delay_secs: u64,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        let options = YtDlpOptions::default();
        Self {
            program: options.program,
            subtitle_languages: options.subtitle_languages,
            max_height: options.max_height,
            socket_timeout_secs: options.socket_timeout_secs,
            retries: options.retries,
            cookies_file: options.cookies_file,
            attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

impl FetcherSettings {
    pub fn options(&self) -> YtDlpOptions {
        YtDlpOptions {
            program: self.program.clone(),
            subtitle_languages: self.subtitle_languages.clone(),
            max_height: self.max_height,
            socket_timeout_secs: self.socket_timeout_secs,
            retries: self.retries,
            cookies_file: self.cookies_file.clone(),
        }
    }

    pub fn fetch_policy(&self) -> RetryPolicy {
        let base_delay = Duration::from_secs(self.retry_delay_secs);
        RetryPolicy {
            max_attempts: self.attempts,
            base_delay,
            max_delay: FETCH_MAX_DELAY.max(base_delay),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistSettings {
    pub name: String,
    pub playlist_url: String,
    pub download_directory: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    general: GeneralSettings,
    #[serde(default)]
    fetcher: FetcherSettings,
    #[serde(default)]
    retry: RetrySettings,
    #[serde(default)]
    playlists: Vec<PlaylistSettings>,
}

/// Validated configuration. Every path is absolute or relative to the working
/// directory, and every playlist directory exists.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub general: GeneralSettings,
    pub fetcher: FetcherSettings,
    pub retry: RetrySettings,
    pub targets: Vec<SyncTarget>,
}

impl Config {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.general.check_interval_seconds)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw, path)
    }

    /// Parses and validates `raw` as if it had been read from `path`.
    pub fn from_toml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let parsed: RawConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        build_config(parsed, path, base)
    }
}

/// Resolves the config path and loads it.
pub fn load_config(overrides: ConfigOverrides) -> Result<Config, ConfigError> {
    let path = resolve_config_path(overrides, |key| env::var(key).ok())?;
    Config::from_file(&path)
}

fn resolve_config_path(
    overrides: ConfigOverrides,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = overrides.config_path {
        return Ok(path);
    }
    let from_env = match env_lookup(CONFIG_PATH_KEY).filter(|value| !value.trim().is_empty()) {
        Some(value) => Some(value),
        None => {
            let env_path = overrides
                .env_path
                .as_deref()
                .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
            dotenv_value(env_path, CONFIG_PATH_KEY)?
        }
    };
    Ok(from_env.map_or_else(
        || PathBuf::from(DEFAULT_CONFIG_PATH),
        |value| PathBuf::from(value.trim()),
    ))
}

/// Looks `key` up in a dotenv-style file. `export` prefixes and one pair of
/// matching quotes are accepted, the last non-empty assignment wins, and a
/// missing file holds nothing.
fn dotenv_value(path: &Path, key: &str) -> Result<Option<String>, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Ok(content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (name, value) = line.split_once('=')?;
            (name.trim() == key).then(|| unquote(value.trim()).to_owned())
        })
        .filter(|value| !value.is_empty())
        .next_back())
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}

fn build_config(raw: RawConfig, path: &Path, base: &Path) -> Result<Config, ConfigError> {
    let RawConfig {
        mut general,
        mut fetcher,
        retry,
        playlists,
    } = raw;

    if general.check_interval_seconds < 1 {
        return Err(ConfigError::Invalid(
            "general.check_interval_seconds must be at least 1".into(),
        ));
    }
    if retry.max_attempts < 1 {
        return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(ConfigError::Invalid(
            "retry.max_delay_ms must not be smaller than retry.base_delay_ms".into(),
        ));
    }
    if fetcher.attempts < 1 {
        return Err(ConfigError::Invalid("fetcher.attempts must be at least 1".into()));
    }
    if fetcher.max_height == 0 {
        return Err(ConfigError::Invalid("fetcher.max_height must be positive".into()));
    }
    if fetcher.subtitle_languages.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "fetcher.subtitle_languages must not be empty".into(),
        ));
    }

    general.client_secrets_file = resolve(base, &general.client_secrets_file);
    general.token_storage_file = resolve(base, &general.token_storage_file);
    general.log_file = general.log_file.map(|file| resolve(base, &file));
    fetcher.cookies_file = fetcher.cookies_file.map(|file| resolve(base, &file));
    // A bare program name is looked up on PATH.
    if fetcher.program.components().count() > 1 {
        fetcher.program = resolve(base, &fetcher.program);
    }

    let mut names = HashSet::new();
    let mut targets = Vec::with_capacity(playlists.len());
    for playlist in playlists {
        let name = playlist.name.trim().to_owned();
        if name.is_empty() {
            return Err(ConfigError::Invalid("playlist with an empty name".into()));
        }
        if !names.insert(name.clone()) {
            return Err(ConfigError::Playlist {
                name,
                reason: "duplicate playlist name".into(),
            });
        }

        let playlist_id = playlist_id_from_url(&playlist.playlist_url)
            .map_err(|reason| ConfigError::Playlist {
                name: name.clone(),
                reason,
            })?;

        if playlist.download_directory.as_os_str().is_empty() {
            return Err(ConfigError::Playlist {
                name,
                reason: "download_directory is empty".into(),
            });
        }
        let download_directory = resolve(base, &playlist.download_directory);
        fs::create_dir_all(&download_directory).map_err(|err| ConfigError::Playlist {
            name: name.clone(),
            reason: format!("creating {}: {err}", download_directory.display()),
        })?;

        targets.push(SyncTarget {
            playlist: PlaylistRef {
                name,
                playlist_id,
            },
            download_directory,
        });
    }

    Ok(Config {
        path: path.to_path_buf(),
        general,
        fetcher,
        retry,
        targets,
    })
}

/// Extracts the `list` parameter from a `youtube.com/playlist` URL.
pub fn playlist_id_from_url(raw: &str) -> Result<String, String> {
    let url = Url::parse(raw.trim()).map_err(|err| format!("invalid playlist_url: {err}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {}", url.scheme()));
    }
    let host = url.host_str().unwrap_or_default();
    if !PLAYLIST_HOSTS.contains(&host) {
        return Err(format!("{host} is not a YouTube host"));
    }
    if url.path().trim_end_matches('/') != "/playlist" {
        return Err(format!("expected a /playlist URL, got path {}", url.path()));
    }
    url.query_pairs()
        .find(|(key, _)| key == "list")
        .map(|(_, value)| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| "playlist_url has no list parameter".to_owned())
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;
    use tempfile::{NamedTempFile, tempdir};

    fn make_env(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn parse(dir: &Path, contents: &str) -> Result<Config, ConfigError> {
        Config::from_toml(contents, &dir.join("ytpl-sync.toml"))
    }

    #[test]
    fn full_config_is_parsed_and_resolved() -> Result<()> {
        let temp = tempdir()?;
        let config = parse(
            temp.path(),
            r#"
            [general]
            client_secrets_file = "secrets/client.json"
            token_storage_file = "/var/lib/ytpl/token.json"
            check_interval_seconds = 600
            retry_stale_removals = true

            [fetcher]
            subtitle_languages = "en.*"
            max_height = 1080
            attempts = 4
            retry_delay_secs = 2

            [retry]
            max_attempts = 2

            [[playlists]]
            name = "Watch later"
            playlist_url = "https://www.youtube.com/playlist?list=PLabc"
            download_directory = "downloads/watch-later"

            [[playlists]]
            name = "Music"
            playlist_url = "https://youtube.com/playlist?list=PLmusic&si=xyz"
            download_directory = "music"
            "#,
        )?;

        assert_eq!(config.check_interval(), Duration::from_secs(600));
        assert!(config.general.retry_stale_removals);
        assert_eq!(
            config.general.client_secrets_file,
            temp.path().join("secrets/client.json")
        );
        assert_eq!(
            config.general.token_storage_file,
            PathBuf::from("/var/lib/ytpl/token.json")
        );
        assert_eq!(config.fetcher.options().max_height, 1080);
        assert_eq!(config.fetcher.program, PathBuf::from("yt-dlp"));
        assert_eq!(config.retry.policy().max_attempts, 2);
        let fetch = config.fetcher.fetch_policy();
        assert_eq!(fetch.max_attempts, 4);
        assert_eq!(fetch.delay_for(1), Duration::from_secs(2));
        assert_eq!(fetch.delay_for(10), Duration::from_secs(30));

        assert_eq!(config.targets.len(), 2);
        let first = &config.targets[0];
        assert_eq!(first.playlist.playlist_id, "PLabc");
        assert_eq!(first.download_directory, temp.path().join("downloads/watch-later"));
        assert!(first.download_directory.is_dir());
        assert_eq!(config.targets[1].playlist.playlist_id, "PLmusic");
        Ok(())
    }

    #[test]
    fn defaults_apply_to_missing_sections() -> Result<()> {
        let temp = tempdir()?;
        let config = parse(temp.path(), "")?;
        assert!(config.targets.is_empty());
        assert_eq!(config.general.check_interval_seconds, 3600);
        assert_eq!(config.general.log_level, "info");
        assert!(!config.general.retry_stale_removals);
        assert_eq!(config.fetcher.subtitle_languages, "en.*,zh.*");
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        let fetch = config.fetcher.fetch_policy();
        assert_eq!(fetch.max_attempts, 3);
        assert_eq!(fetch.delay_for(1), Duration::from_secs(5));
        assert_eq!(fetch.delay_for(2), Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn zero_interval_is_rejected() -> Result<()> {
        let temp = tempdir()?;
        let err = parse(temp.path(), "[general]\ncheck_interval_seconds = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = parse(temp.path(), "[fetcher]\nattempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        Ok(())
    }

    #[test]
    fn malformed_toml_is_a_parse_error() -> Result<()> {
        let temp = tempdir()?;
        let err = parse(temp.path(), "[general\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        Ok(())
    }

    #[test]
    fn duplicate_and_empty_names_are_rejected() -> Result<()> {
        let temp = tempdir()?;
        let duplicate = r#"
            [[playlists]]
            name = "A"
            playlist_url = "https://www.youtube.com/playlist?list=PL1"
            download_directory = "a"

            [[playlists]]
            name = "A"
            playlist_url = "https://www.youtube.com/playlist?list=PL2"
            download_directory = "b"
        "#;
        assert!(matches!(
            parse(temp.path(), duplicate).unwrap_err(),
            ConfigError::Playlist { .. }
        ));

        let empty = r#"
            [[playlists]]
            name = "  "
            playlist_url = "https://www.youtube.com/playlist?list=PL1"
            download_directory = "a"
        "#;
        assert!(matches!(parse(temp.path(), empty).unwrap_err(), ConfigError::Invalid(_)));
        Ok(())
    }

    #[test]
    fn playlist_urls_are_validated() {
        assert_eq!(
            playlist_id_from_url("https://m.youtube.com/playlist?list=PLx").unwrap(),
            "PLx"
        );
        for bad in [
            "not a url",
            "ftp://www.youtube.com/playlist?list=PL1",
            "https://vimeo.com/playlist?list=PL1",
            "https://www.youtube.com/watch?v=abc&list=PL1",
            "https://www.youtube.com/playlist",
            "https://www.youtube.com/playlist?list=",
        ] {
            assert!(playlist_id_from_url(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn missing_file_is_not_found() -> Result<()> {
        let temp = tempdir()?;
        let err = Config::from_file(&temp.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn config_path_precedence() -> Result<()> {
        let env_file = make_env("YTPL_SYNC_CONFIG=\"/from/dotenv.toml\"\n");
        let with_dotenv = ConfigOverrides {
            config_path: None,
            env_path: Some(env_file.path().to_path_buf()),
        };

        assert_eq!(
            resolve_config_path(with_dotenv.clone(), |_| None)?,
            PathBuf::from("/from/dotenv.toml")
        );
        assert_eq!(
            resolve_config_path(with_dotenv.clone(), |_| Some("/from/env.toml".into()))?,
            PathBuf::from("/from/env.toml")
        );
        let cli = ConfigOverrides {
            config_path: Some(PathBuf::from("/from/cli.toml")),
            ..with_dotenv
        };
        assert_eq!(
            resolve_config_path(cli, |_| Some("/from/env.toml".into()))?,
            PathBuf::from("/from/cli.toml")
        );

        let temp = tempdir()?;
        let nothing = ConfigOverrides {
            config_path: None,
            env_path: Some(temp.path().join("missing.env")),
        };
        assert_eq!(
            resolve_config_path(nothing, |_| None)?,
            PathBuf::from(DEFAULT_CONFIG_PATH)
        );
        Ok(())
    }

    #[test]
    fn dotenv_lookup_handles_export_quotes_and_comments() -> Result<()> {
        let file = make_env(
            r#"
            # YTPL_SYNC_CONFIG=/commented/out.toml
            export YTPL_SYNC_CONFIG="/etc/ytpl.toml"
            RUST_LOG='debug'
            SPACED =  "value"
            INVALID_LINE
            "#,
        );
        assert_eq!(
            dotenv_value(file.path(), CONFIG_PATH_KEY)?.as_deref(),
            Some("/etc/ytpl.toml")
        );
        assert_eq!(dotenv_value(file.path(), "RUST_LOG")?.as_deref(), Some("debug"));
        assert_eq!(dotenv_value(file.path(), "SPACED")?.as_deref(), Some("value"));
        assert_eq!(dotenv_value(file.path(), "INVALID_LINE")?, None);

        let overridden = make_env("YTPL_SYNC_CONFIG=/first.toml\nYTPL_SYNC_CONFIG=''\nYTPL_SYNC_CONFIG=/last.toml\n");
        assert_eq!(
            dotenv_value(overridden.path(), CONFIG_PATH_KEY)?.as_deref(),
            Some("/last.toml")
        );
        Ok(())
    }
}
