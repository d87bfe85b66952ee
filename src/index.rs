#![forbid(unsafe_code)]

//! Durable indexes backing the cache.
//!
//! Two small JSON documents live under the media root: the cache index maps
//! a normalized origin identifier to the local file that transfer produced,
//! and the playback index remembers the last watched offset per file. Both
//! are loaded once at startup and rewritten wholesale after every mutation;
//! the expected cardinality is a personal archive, so a linear scan is fine.

use anyhow::Result;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fs;
use std::path::{Path, PathBuf};

pub const CACHE_INDEX_FILE: &str = "cache_index.json";
pub const PLAYBACK_INDEX_FILE: &str = "playback.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub origin: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackPosition {
    pub path: String,
    /// Seconds into the file.
    pub time: f64,
}

/// Origin identifier → cached file path.
#[derive(Debug)]
pub struct CacheIndex {
    path: PathBuf,
    entries: Vec<CacheEntry>,
}

impl CacheIndex {
    /// Loads the index document, starting empty when the file is missing and
    /// warning (but not failing) when it does not parse.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_records(&path);
        Self { path, entries }
    }

    pub fn lookup(&self, origin: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.origin == origin)
            .map(|entry| entry.path.as_str())
    }

    /// Records an origin → path mapping and persists the whole document.
    /// An existing entry for the origin is replaced rather than duplicated.
    pub fn insert(&mut self, origin: &str, file_path: &str) {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.origin == origin)
        {
            Some(entry) => entry.path = file_path.to_string(),
            None => self.entries.push(CacheEntry {
                origin: origin.to_string(),
                path: file_path.to_string(),
            }),
        }
        if let Err(err) = write_json_atomic(&self.path, &self.entries) {
            eprintln!("Failed to persist cache index: {err}");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cached file path → last watched offset.
#[derive(Debug)]
pub struct PlaybackIndex {
    path: PathBuf,
    positions: Vec<PlaybackPosition>,
}

impl PlaybackIndex {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let positions = load_records(&path);
        Self { path, positions }
    }

    /// Update-or-insert keyed by file path, persisted after every call.
    pub fn record(&mut self, file_path: &str, time: f64) {
        match self
            .positions
            .iter_mut()
            .find(|position| position.path == file_path)
        {
            Some(position) => position.time = time,
            None => self.positions.push(PlaybackPosition {
                path: file_path.to_string(),
                time,
            }),
        }
        if let Err(err) = write_json_atomic(&self.path, &self.positions) {
            eprintln!("Failed to persist playback index: {err}");
        }
    }

    /// Returns 0.0 for files that were never watched.
    pub fn last(&self, file_path: &str) -> f64 {
        self.positions
            .iter()
            .find(|position| position.path == file_path)
            .map(|position| position.time)
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn load_records<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&raw) {
        Ok(records) => records,
        Err(err) => {
            eprintln!("Ignoring malformed index file {}: {err}", path.display());
            Vec::new()
        }
    }
}

/// Serializes to a sibling `.tmp` file and renames it into place so a crash
/// mid-write never truncates the live document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
