#![forbid(unsafe_code)]

//! Derives local storage targets from resolved download URLs.
//!
//! Download URLs carry positional meaning: splitting the full URL on `/`
//! yields the content kind at index 4 (a leading `m` marks a movie, anything
//! else an episode), the series identifier at index 5, and the remote file
//! name at index 6. Movies land under `<media_root>/m/`, episodes under
//! `<media_root>/t/<series>/`.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::PathBuf;

/// Suffix carried by a file while its transfer is still running.
pub const PARTIAL_EXTENSION: &str = "partial";

const MOVIES_SUBDIR: &str = "m";
const SERIES_SUBDIR: &str = "t";

/// Resolved storage location and display metadata for one download URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Where the finished file lives once the transfer is promoted.
    pub final_path: PathBuf,
    /// Where bytes accumulate while the transfer runs.
    pub partial_path: PathBuf,
    /// File extension of the remote artifact, e.g. `mp4`.
    pub format: String,
    /// Human-readable title derived from the URL.
    pub title: String,
    pub is_series_episode: bool,
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    media_root: PathBuf,
}

impl PathResolver {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
        }
    }

    /// Computes the target for a download URL without touching the disk.
    ///
    /// URLs that do not carry enough path segments, or whose file segment
    /// has no extension, are rejected instead of panicking on an index.
    pub fn resolve(&self, download_url: &str) -> Result<Target> {
        let segments: Vec<&str> = download_url.split('/').collect();
        if segments.len() < 7 {
            bail!("unrecognized download URL shape: {download_url}");
        }

        let kind = segments[4];
        let series = segments[5];
        let raw_file = segments[6];
        let is_series_episode = !kind.starts_with('m');

        // The query string never participates in naming.
        let base = raw_file
            .split_once('?')
            .map_or(raw_file, |(before, _)| before);
        let Some((stem, format)) = base.rsplit_once('.') else {
            bail!("download URL file segment has no extension: {download_url}");
        };
        if stem.is_empty() || format.is_empty() {
            bail!("download URL file segment has no extension: {download_url}");
        }

        let dir = if is_series_episode {
            self.media_root.join(SERIES_SUBDIR).join(series)
        } else {
            self.media_root.join(MOVIES_SUBDIR)
        };
        let final_path = dir.join(format!("{stem}.{format}"));
        let partial_path = dir.join(format!("{stem}.{PARTIAL_EXTENSION}"));

        let title = if is_series_episode {
            format!("{} {stem}", display_title(series, stem))
        } else {
            display_title(base, stem)
        };

        Ok(Target {
            final_path,
            partial_path,
            format: format.to_string(),
            title,
            is_series_episode,
        })
    }

    /// Creates the storage directory for a target. Safe to call repeatedly;
    /// existing directories are left alone.
    pub fn ensure_directories(&self, target: &Target) -> Result<()> {
        let dir = target
            .final_path
            .parent()
            .unwrap_or(self.media_root.as_path());
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(())
    }
}

/// Cuts the raw name before its second-to-last dot segment (usually the
/// quality tag, e.g. `.1080p`) and turns the remaining dots into spaces, so
/// `Some.Movie.2020.1080p.mp4` reads `Some Movie 2020`.
fn display_title(raw: &str, stem: &str) -> String {
    let marker = stem
        .rsplit_once('.')
        .map(|(_, last)| format!(".{last}"))
        .unwrap_or_default();
    let cut = if marker.is_empty() {
        raw
    } else {
        raw.split(&marker).next().unwrap_or(raw)
    };
    cut.replace('.', " ")
}
