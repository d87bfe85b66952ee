#![forbid(unsafe_code)]

//! Local media-download cache.
//!
//! The [`cache::MediaCache`] service answers "do we already have this?"
//! before any network traffic happens, streams cache misses to disk with
//! progress reporting, and remembers playback positions across restarts.
//! The `backend` binary wraps it in a small HTTP API.

pub mod cache;
pub mod config;
pub mod index;
pub mod paths;
pub mod progress;
pub mod security;
pub mod transfer;
