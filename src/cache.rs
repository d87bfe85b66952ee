#![forbid(unsafe_code)]

//! The cache service: admission, in-flight bookkeeping, and both durable
//! indexes behind one owned object.
//!
//! Admission deduplicates by resolved target path: a partial or final file
//! on disk, or a registered in-flight transfer, all mean "do not fetch
//! again". The registry entry carrying the live remote URL exists from
//! before the body transfer starts until promotion or failure, so the
//! player layer can stream straight from the source while caching runs in
//! the background.

use crate::index::{CACHE_INDEX_FILE, CacheIndex, PLAYBACK_INDEX_FILE, PlaybackIndex};
use crate::paths::{PathResolver, Target};
use crate::transfer;
use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub const CACHE_REFERENCE_PREFIX: &str = "cached-video::";

/// What a caller gets back from a play request: either "serve this local
/// file through the cache endpoint" or a plain remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheReference {
    Cached(PathBuf),
    Remote(String),
}

impl CacheReference {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(CACHE_REFERENCE_PREFIX) {
            Some(path) => Self::Cached(PathBuf::from(path)),
            None => Self::Remote(raw.to_string()),
        }
    }
}

impl fmt::Display for CacheReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached(path) => write!(f, "{CACHE_REFERENCE_PREFIX}{}", path.display()),
            Self::Remote(url) => f.write_str(url),
        }
    }
}

/// Outcome of one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    AlreadyComplete,
    AlreadyInFlight,
    StartNew,
}

/// Tri-state readiness of a target path, plus Unknown for paths the cache
/// has never heard of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    InFlight,
    Failed,
    Unknown,
}

/// Ephemeral per-transfer state. Lost on restart by design: an orphaned
/// `.partial` file from a dead process reads as "in flight" to admission
/// but has no live remote URL to offer.
#[derive(Debug, Default)]
struct TransferBoard {
    /// Final path → remote URL currently feeding it.
    in_flight: HashMap<PathBuf, String>,
    /// Targets whose last transfer ended in a terminal failure.
    failed: HashSet<PathBuf>,
}

#[derive(Clone)]
pub struct MediaCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    resolver: PathResolver,
    client: reqwest::Client,
    index: RwLock<CacheIndex>,
    playback: RwLock<PlaybackIndex>,
    board: Mutex<TransferBoard>,
    shutdown: CancellationToken,
}

impl MediaCache {
    pub fn new(media_root: impl Into<PathBuf>) -> Result<Self> {
        let media_root = media_root.into();
        fs::create_dir_all(&media_root)
            .with_context(|| format!("creating {}", media_root.display()))?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                resolver: PathResolver::new(&media_root),
                client: transfer::build_client()?,
                index: RwLock::new(CacheIndex::load(media_root.join(CACHE_INDEX_FILE))),
                playback: RwLock::new(PlaybackIndex::load(media_root.join(PLAYBACK_INDEX_FILE))),
                board: Mutex::new(TransferBoard::default()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Cheap index-plus-disk lookup, no network. A stale index row whose
    /// file has since disappeared reads as a miss.
    pub fn lookup(&self, origin: &str) -> Option<CacheReference> {
        let index = self.inner.index.read();
        let path = index.lookup(origin)?;
        let path = PathBuf::from(path);
        if path.is_file() {
            Some(CacheReference::Cached(path))
        } else {
            None
        }
    }

    /// Resolves an origin to a cache reference, launching a background
    /// transfer when the target is genuinely new. Always returns
    /// immediately; for a fresh transfer the reference names the eventual
    /// final file.
    pub fn resolve_or_start_download(
        &self,
        origin: &str,
        download_url: &str,
    ) -> Result<CacheReference> {
        self.admit(origin, download_url)
            .map(|(reference, _)| reference)
    }

    /// Admission proper, with the decision exposed.
    pub fn admit(&self, origin: &str, download_url: &str) -> Result<(CacheReference, Admission)> {
        if let Some(reference) = self.lookup(origin) {
            return Ok((reference, Admission::AlreadyComplete));
        }

        let target = self.inner.resolver.resolve(download_url)?;
        self.inner.resolver.ensure_directories(&target)?;
        let final_path = target.final_path.clone();

        // The whole decision happens under the board lock so two callers
        // racing on the same target can never both launch a transfer.
        let mut board = self.inner.board.lock();
        if final_path.is_file() {
            self.remember_alias(origin, &final_path);
            return Ok((
                CacheReference::Cached(final_path),
                Admission::AlreadyComplete,
            ));
        }
        if board.in_flight.contains_key(&final_path) || target.partial_path.is_file() {
            self.remember_alias(origin, &final_path);
            return Ok((
                CacheReference::Cached(final_path),
                Admission::AlreadyInFlight,
            ));
        }
        board
            .in_flight
            .insert(final_path.clone(), download_url.to_string());
        board.failed.remove(&final_path);
        drop(board);

        self.spawn_transfer(origin.to_string(), download_url.to_string(), target);
        Ok((CacheReference::Cached(final_path), Admission::StartNew))
    }

    pub fn record_playback_position(&self, path: &str, time: f64) {
        self.inner.playback.write().record(path, time);
    }

    pub fn last_playback_position(&self, path: &str) -> f64 {
        self.inner.playback.read().last(path)
    }

    pub fn is_final_file_ready(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    /// Remote URL feeding a still-running transfer for this final path.
    pub fn in_flight_remote_url(&self, path: &str) -> Option<String> {
        self.inner
            .board
            .lock()
            .in_flight
            .get(Path::new(path))
            .cloned()
    }

    pub fn transfer_readiness(&self, path: &str) -> Readiness {
        if self.is_final_file_ready(path) {
            return Readiness::Ready;
        }
        let board = self.inner.board.lock();
        if board.in_flight.contains_key(Path::new(path)) {
            Readiness::InFlight
        } else if board.failed.contains(Path::new(path)) {
            Readiness::Failed
        } else {
            Readiness::Unknown
        }
    }

    /// Asks running transfers to stop and clean up their partial files.
    pub fn begin_shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Registers an origin that resolved to an already known target, so the
    /// next request for the same origin is a plain index hit.
    fn remember_alias(&self, origin: &str, final_path: &Path) {
        let final_str = final_path.to_string_lossy();
        let mut index = self.inner.index.write();
        if index.lookup(origin) != Some(final_str.as_ref()) {
            index.insert(origin, final_str.as_ref());
        }
    }

    fn spawn_transfer(&self, origin: String, remote_url: String, target: Target) {
        let cache = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            println!("Downloading {} from {remote_url}", target.title);

            let result = transfer::download(
                &cache.inner.client,
                &remote_url,
                &target,
                &cache.inner.shutdown,
            )
            .await;

            let final_path = target.final_path.clone();
            match result {
                Ok(()) => {
                    let final_str = final_path.to_string_lossy().into_owned();
                    cache.inner.index.write().insert(&origin, &final_str);
                    cache.inner.board.lock().in_flight.remove(&final_path);
                    println!(
                        "Download of {} completed in {:.1?}",
                        target.title,
                        started.elapsed()
                    );
                }
                Err(err) => {
                    eprintln!("Download of {} failed: {err:#}", target.title);
                    let mut board = cache.inner.board.lock();
                    board.in_flight.remove(&final_path);
                    board.failed.insert(final_path);
                }
            }
        });
    }
}
