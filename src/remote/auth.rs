#![forbid(unsafe_code)]

//! Stored OAuth credentials for the YouTube Data API.
//!
//! The consent flow that produces the first token happens elsewhere; this
//! module only loads the authorized-user token file, refreshes it when it is
//! about to expire, and writes the refreshed copy back.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::RemoteError;
use crate::security::restrict_to_owner;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const REFRESH_MARGIN_SECS: i64 = 60;

/// Authorized-user token file, as written by Google's client libraries.
///
/// Fields we do not use are carried in `extra` so rewriting the file never
/// loses them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(alias = "access_token", default)]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoredToken {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.token, self.expiry) {
            (None, _) => true,
            (Some(_), Some(expiry)) => expiry
                .checked_sub_signed(TimeDelta::seconds(REFRESH_MARGIN_SECS))
                .is_none_or(|refresh_at| refresh_at <= now),
            (Some(_), None) => false,
        }
    }

    /// Takes over a token endpoint answer. A lifetime that does not fit in a
    /// timestamp leaves the token without an expiry.
    fn apply_refresh(&mut self, refreshed: RefreshResponse, now: DateTime<Utc>) {
        self.token = Some(refreshed.access_token);
        self.expiry = refreshed
            .expires_in
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime));
        if let Some(rotated) = refreshed.refresh_token {
            self.refresh_token = Some(rotated);
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

#[derive(Debug, Deserialize)]
struct ClientSecrets {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Hands out valid access tokens, refreshing the stored one on demand.
pub struct TokenProvider {
    token_path: PathBuf,
    token: Mutex<StoredToken>,
    agent: ureq::Agent,
}

impl TokenProvider {
    /// Reads the token file and fills in client credentials from the client
    /// secrets file when the token does not carry them.
    pub fn load(
        token_path: &Path,
        client_secrets_path: &Path,
        agent: ureq::Agent,
    ) -> Result<Self, RemoteError> {
        let raw = fs::read_to_string(token_path).map_err(|err| {
            RemoteError::Auth(format!(
                "no usable token at {} ({err}); complete the OAuth consent flow first",
                token_path.display()
            ))
        })?;
        let mut token: StoredToken = serde_json::from_str(&raw).map_err(|err| {
            RemoteError::Auth(format!("token file {} is invalid: {err}", token_path.display()))
        })?;

        if token.client_id.is_none() || token.client_secret.is_none() {
            let secrets = read_client_secrets(client_secrets_path)?;
            token.client_id.get_or_insert(secrets.client_id);
            token.client_secret.get_or_insert(secrets.client_secret);
            if token.token_uri.is_none() {
                token.token_uri = secrets.token_uri;
            }
        }

        Ok(Self {
            token_path: token_path.to_path_buf(),
            token: Mutex::new(token),
            agent,
        })
    }

    /// Makes sure a valid access token is available. Used once at startup so
    /// authorization problems surface before any playlist work.
    pub fn authenticate(&self) -> Result<(), RemoteError> {
        self.access_token().map(|_| ())
    }

    pub fn access_token(&self) -> Result<String, RemoteError> {
        let mut token = self.token.lock();
        if token.needs_refresh(Utc::now()) {
            self.refresh(&mut token)?;
        }
        token
            .token
            .clone()
            .ok_or_else(|| RemoteError::Auth("token refresh returned no access token".into()))
    }

    /// Forces the next `access_token` call to refresh, e.g. after a 401.
    pub fn invalidate(&self) {
        let mut token = self.token.lock();
        token.expiry = Some(Utc::now() - TimeDelta::seconds(1));
    }

    fn refresh(&self, token: &mut StoredToken) -> Result<(), RemoteError> {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            token.refresh_token.clone(),
            token.client_id.clone(),
            token.client_secret.clone(),
        ) else {
            return Err(RemoteError::Auth(
                "stored token cannot be refreshed (missing refresh token or client credentials)"
                    .into(),
            ));
        };
        let token_uri = token
            .token_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_owned());

        debug!(%token_uri, "refreshing access token");
        let response = self
            .agent
            .post(&token_uri)
            .send_form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .map_err(|err| match err {
                ureq::Error::Status(code, response) if code < 500 && code != 429 => {
                    let body = response.into_string().unwrap_or_default();
                    RemoteError::Auth(format!("token refresh rejected ({code}): {body}"))
                }
                ureq::Error::Status(code, _) => {
                    RemoteError::Transient(format!("token endpoint returned {code}"))
                }
                ureq::Error::Transport(transport) => {
                    RemoteError::Transient(format!("token endpoint unreachable: {transport}"))
                }
            })?;
        let refreshed: RefreshResponse = response
            .into_json()
            .map_err(|err| RemoteError::Auth(format!("unreadable token response: {err}")))?;

        token.apply_refresh(refreshed, Utc::now());
        save_token(&self.token_path, token)
            .map_err(|err| RemoteError::Auth(format!("could not store refreshed token: {err}")))?;
        info!("access token refreshed");
        Ok(())
    }
}

fn read_client_secrets(path: &Path) -> Result<ClientSecrets, RemoteError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        RemoteError::Auth(format!("reading client secrets {}: {err}", path.display()))
    })?;
    let file: ClientSecretsFile = serde_json::from_str(&raw).map_err(|err| {
        RemoteError::Auth(format!("parsing client secrets {}: {err}", path.display()))
    })?;
    file.installed.or(file.web).ok_or_else(|| {
        RemoteError::Auth(format!(
            "client secrets {} has neither an `installed` nor a `web` block",
            path.display()
        ))
    })
}

/// Writes the token next to its final location and renames it into place,
/// readable by the owner only.
fn save_token(path: &Path, token: &StoredToken) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(&serde_json::to_vec_pretty(token)?)?;
    temp.as_file().sync_all()?;
    restrict_to_owner(temp.path())?;
    temp.persist(path)?;
    Ok(())
}
