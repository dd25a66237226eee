#![forbid(unsafe_code)]

//! Incremental YouTube playlist sync: download what is new, record it
//! durably, then prune it from the playlist.

pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod index;
pub mod logging;
pub mod naming;
pub mod record;
pub mod remote;
pub mod security;
