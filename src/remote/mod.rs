#![forbid(unsafe_code)]

//! Remote playlist collaborators.
//!
//! The engine only sees the two traits below; the YouTube Data API client is
//! one implementation, test doubles are another.

pub mod auth;
pub mod youtube;

use crate::error::RemoteError;

pub use auth::{StoredToken, TokenProvider};
pub use youtube::YouTubeClient;

/// Identifies a remote playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRef {
    /// Configured display name.
    pub name: String,
    /// Value of the `list` query parameter.
    pub playlist_id: String,
}

/// One entry of a remote playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    /// Video id; stable across playlists.
    pub item_id: String,
    /// Playlist-entry id, needed to delete the entry.
    pub entry_id: String,
    pub title: String,
}

pub trait PlaylistLister {
    /// Current entries of `playlist`, in playlist order.
    fn list_items(&self, playlist: &PlaylistRef) -> Result<Vec<RemoteItem>, RemoteError>;
}

pub trait PlaylistRemover {
    fn remove_item(&self, playlist: &PlaylistRef, item: &RemoteItem) -> Result<(), RemoteError>;
}
