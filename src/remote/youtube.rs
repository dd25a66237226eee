#![forbid(unsafe_code)]

//! YouTube Data API v3 client for listing and pruning playlists.

use std::collections::HashSet;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::remote::{PlaylistLister, PlaylistRef, PlaylistRemover, RemoteItem, TokenProvider};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const PAGE_SIZE: &str = "50";
const SKIPPED_TITLES: [&str; 2] = ["Deleted video", "Private video"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsPage {
    #[serde(default)]
    items: Vec<PlaylistItemResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemResource {
    id: String,
    #[serde(default)]
    snippet: Option<Snippet>,
    #[serde(default)]
    content_details: Option<ContentDetails>,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentDetails {
    #[serde(default)]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Blocking client over `ureq`. Implements both remote collaborator traits.
pub struct YouTubeClient {
    agent: ureq::Agent,
    tokens: TokenProvider,
    api_base: String,
}

impl YouTubeClient {
    pub fn new(agent: ureq::Agent, tokens: TokenProvider) -> Self {
        Self {
            agent,
            tokens,
            api_base: DEFAULT_API_BASE.to_owned(),
        }
    }

    /// Points the client at another API root, e.g. a local stand-in.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_owned();
        self
    }

    /// Runs `send` with a bearer token, refreshing and retrying once on 401.
    fn authorized(
        &self,
        send: impl Fn(&str) -> Result<ureq::Response, ureq::Error>,
    ) -> Result<ureq::Response, RemoteError> {
        let token = self.tokens.access_token()?;
        match send(&token) {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(401, _)) => {
                debug!("access token rejected, refreshing");
                self.tokens.invalidate();
                let token = self.tokens.access_token()?;
                send(&token).map_err(classify_error)
            }
            Err(err) => Err(classify_error(err)),
        }
    }

    fn fetch_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistItemsPage, RemoteError> {
        let url = format!("{}/playlistItems", self.api_base);
        let response = self.authorized(|token| {
            let mut request = self
                .agent
                .get(&url)
                .set("Authorization", &format!("Bearer {token}"))
                .query("part", "snippet,contentDetails")
                .query("playlistId", playlist_id)
                .query("maxResults", PAGE_SIZE);
            if let Some(page_token) = page_token {
                request = request.query("pageToken", page_token);
            }
            request.call()
        })?;
        response
            .into_json()
            .map_err(|err| RemoteError::Transient(format!("unreadable playlist page: {err}")))
    }
}

impl PlaylistLister for YouTubeClient {
    fn list_items(&self, playlist: &PlaylistRef) -> Result<Vec<RemoteItem>, RemoteError> {
        let mut items = Vec::new();
        let mut seen_tokens = HashSet::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self.fetch_page(&playlist.playlist_id, page_token.as_deref())?;
            let next = page.next_page_token.clone();
            items.extend(items_from_page(page));

            match next {
                Some(token) if seen_tokens.insert(token.clone()) => page_token = Some(token),
                Some(token) => {
                    warn!(playlist = %playlist.name, %token, "page token repeated, stopping");
                    break;
                }
                None => break,
            }
        }

        info!(playlist = %playlist.name, count = items.len(), "listed playlist");
        Ok(items)
    }
}

impl PlaylistRemover for YouTubeClient {
    fn remove_item(&self, playlist: &PlaylistRef, item: &RemoteItem) -> Result<(), RemoteError> {
        let url = format!("{}/playlistItems", self.api_base);
        let result = self.authorized(|token| {
            self.agent
                .delete(&url)
                .set("Authorization", &format!("Bearer {token}"))
                .query("id", &item.entry_id)
                .call()
        });
        match result {
            Ok(_) => {
                info!(playlist = %playlist.name, item_id = %item.item_id, "removed from playlist");
                Ok(())
            }
            Err(RemoteError::NotFound(_)) => {
                info!(
                    playlist = %playlist.name,
                    item_id = %item.item_id,
                    "playlist entry already gone"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Converts one API page into playlist-ordered items, skipping entries
/// without a video id and placeholders for deleted or private videos.
fn items_from_page(page: PlaylistItemsPage) -> Vec<RemoteItem> {
    page.items
        .into_iter()
        .filter_map(|resource| {
            let details = resource.content_details?;
            let item_id = details.video_id.filter(|id| !id.trim().is_empty())?;
            let title = resource
                .snippet
                .and_then(|snippet| snippet.title)
                .unwrap_or_default();
            if SKIPPED_TITLES.contains(&title.as_str()) {
                debug!(entry_id = %resource.id, %title, "skipping unavailable entry");
                return None;
            }
            Some(RemoteItem {
                item_id,
                entry_id: resource.id,
                title,
            })
        })
        .collect()
}

fn classify_error(err: ureq::Error) -> RemoteError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            classify_status(code, &body)
        }
        ureq::Error::Transport(transport) => RemoteError::Transient(transport.to_string()),
    }
}

/// Maps an HTTP failure onto the retry policy. Messages start with the status
/// code.
fn classify_status(code: u16, body: &str) -> RemoteError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
    let reasons: Vec<&str> = parsed
        .as_ref()
        .map(|body| body.error.errors.iter().map(|e| e.reason.as_str()).collect())
        .unwrap_or_default();
    let message = parsed
        .as_ref()
        .map(|body| body.error.message.clone())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| body.chars().take(200).collect());

    match code {
        401 => RemoteError::Auth(format!("{code} {message}")),
        404 => RemoteError::NotFound(format!("{code} {message}")),
        429 | 500..=599 => RemoteError::Transient(format!("{code} {message}")),
        403 if reasons
            .iter()
            .any(|reason| matches!(*reason, "rateLimitExceeded" | "userRateLimitExceeded")) =>
        {
            RemoteError::Transient(format!("{code} {message}"))
        }
        _ => RemoteError::Permanent(format!("{code} {message}")),
    }
}
