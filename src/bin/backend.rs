#![forbid(unsafe_code)]

//! HTTP control layer over the media cache.
//!
//! All the real state lives in [`MediaCache`]; the handlers here only
//! normalize origins, translate cache decisions into JSON, and stream
//! cached files back to the player with Range support.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use vidcache::cache::{MediaCache, Readiness};
use vidcache::config::{RuntimeOverrides, resolve_runtime_config};
use vidcache::security::ensure_not_root;

#[derive(Debug, Clone)]
struct BackendArgs {
    media_root: PathBuf,
    origin_base: String,
    vidcache_port: u16,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut media_root_override: Option<PathBuf> = None;
        let mut origin_base_override: Option<String> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--media-root=") {
                media_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--origin-base=") {
                origin_base_override = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--media-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--media-root requires a value"))?;
                    media_root_override = Some(PathBuf::from(value));
                }
                "--origin-base" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--origin-base requires a value"))?;
                    origin_base_override = Some(value);
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime = resolve_runtime_config(RuntimeOverrides {
            media_root: media_root_override.clone(),
            origin_base: origin_base_override.clone(),
            vidcache_port: port_override,
            vidcache_host: None,
            env_path: None,
        })?;
        let listen_host = match host_override {
            Some(host) => host,
            None => parse_host_arg(&runtime.vidcache_host)?,
        };

        Ok(Self {
            media_root: runtime.media_root,
            origin_base: runtime.origin_base,
            vidcache_port: runtime.vidcache_port,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/VIDCACHE_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    cache: MediaCache,
    media_root: Arc<PathBuf>,
    origin_base: Arc<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayRequest {
    /// Source page the user asked for; normalized into the origin key.
    page: String,
    /// Resolved direct media URL (extracted client side).
    download_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayResponse {
    reference: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRequest {
    video_path: String,
    time: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerInfo {
    video_path: String,
    /// Where the player should fetch bytes from right now: the local media
    /// endpoint when the file is ready, the live remote URL while the
    /// transfer is still running, nothing when the download failed.
    video_url: Option<String>,
    start_point: f64,
    readiness: String,
}

fn readiness_label(readiness: Readiness) -> &'static str {
    match readiness {
        Readiness::Ready => "ready",
        Readiness::InFlight => "downloading",
        Readiness::Failed => "failed",
        Readiness::Unknown => "unknown",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs {
        media_root,
        origin_base,
        vidcache_port,
        listen_host,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    let cache = MediaCache::new(&media_root)?;
    let state = AppState {
        cache: cache.clone(),
        media_root: Arc::new(media_root),
        origin_base: Arc::new(origin_base),
    };

    let app = router(state);

    let addr = SocketAddr::new(listen_host, vidcache_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("vidcache listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cache))
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/api/play", post(play))
        .route("/api/position", post(set_position))
        .route("/api/player/{*path}", get(player_info))
        .route("/media/{*path}", get(serve_media))
        .with_state(state)
}

async fn shutdown_signal(cache: MediaCache) {
    // Graceful shutdown is best effort; the process still terminates when
    // Ctrl+C fires even if the handler could not be installed.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
    cache.begin_shutdown();
}

async fn ping() -> &'static str {
    "Pong!"
}

async fn play(
    State(state): State<AppState>,
    Json(payload): Json<PlayRequest>,
) -> ApiResult<Json<PlayResponse>> {
    let origin = normalize_origin(&state.origin_base, &payload.page);

    let reference = match state.cache.lookup(&origin) {
        Some(reference) => reference,
        None => state
            .cache
            .resolve_or_start_download(&origin, &payload.download_url)
            .map_err(|err| ApiError::bad_request(err.to_string()))?,
    };

    Ok(Json(PlayResponse {
        reference: reference.to_string(),
    }))
}

async fn set_position(
    State(state): State<AppState>,
    Json(payload): Json<PositionRequest>,
) -> ApiResult<&'static str> {
    state
        .cache
        .record_playback_position(&payload.video_path, payload.time);
    Ok("OK")
}

async fn player_info(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult<Json<PlayerInfo>> {
    let readiness = state.cache.transfer_readiness(&path);
    let video_url = match readiness {
        Readiness::Ready => Some(local_media_url(&state.media_root, Path::new(&path))),
        Readiness::InFlight => state.cache.in_flight_remote_url(&path),
        Readiness::Failed | Readiness::Unknown => None,
    };

    Ok(Json(PlayerInfo {
        start_point: state.cache.last_playback_position(&path),
        readiness: readiness_label(readiness).to_string(),
        video_path: path,
        video_url,
    }))
}

async fn serve_media(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let target = resolve_media_path(&state.media_root, &path)?;
    stream_file(target, &headers).await
}

/// Maps a cached file path to the `/media/` URL the player streams from.
/// Paths outside the media root (possible only through a hand-edited index)
/// are handed back verbatim as a last resort.
fn local_media_url(media_root: &Path, file_path: &Path) -> String {
    match file_path.strip_prefix(media_root) {
        Ok(relative) => format!("/media/{}", relative.display()),
        Err(_) => file_path.display().to_string(),
    }
}

/// Rebuilds the origin identifier for a requested page: the configured
/// origin base plus the page's path, query stripped. Mirrors across its
/// scheme/host variants collapse onto one cache key.
fn normalize_origin(origin_base: &str, page: &str) -> String {
    let path = page
        .split_once("://")
        .map(|(_, rest)| match rest.find('/') {
            Some(index) => &rest[index..],
            None => "/",
        })
        .unwrap_or(page);
    let path = path.split('?').next().unwrap_or(path);
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("{origin_base}{path}")
}

fn resolve_media_path(media_root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let candidate = Path::new(request_path);
    if request_path.is_empty()
        || candidate
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(media_root.join(candidate))
}

async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let mime = MimeGuess::from_path(&path).first();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", size).parse().unwrap(),
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, size).parse().unwrap(),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length.to_string().parse().unwrap());
            response
        }
    } else {
        Body::from_stream(ReaderStream::new(file)).into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if let Some(mime) = mime
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::extract::State as AxumState;
    use std::sync::Mutex;
    use std::{env, time::Duration};
    use tempfile::tempdir;
    use vidcache::cache::CacheReference;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_file(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let mut contents = String::new();
        for (key, value) in vars {
            contents.push_str(&format!("{key}=\"{value}\"\n"));
        }
        std::fs::write(dir.path().join(".env"), contents).unwrap();
        let cwd = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        f();
        env::set_current_dir(cwd).unwrap();
    }

    fn parse_backend_args(env_values: &[(&str, &str)], extra: &[&str]) -> BackendArgs {
        let argv = extra
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>();
        let mut parsed = None;
        with_env_file(env_values, || {
            parsed = Some(BackendArgs::from_iter(argv.clone()).expect("parsed args"));
        });
        parsed.expect("args set")
    }

    fn test_state(media_root: &Path) -> AppState {
        AppState {
            cache: MediaCache::new(media_root).unwrap(),
            media_root: Arc::new(media_root.to_path_buf()),
            origin_base: Arc::new("https://mirror.example.test".to_string()),
        }
    }

    const BASE_ENV: &[(&str, &str)] = &[
        ("MEDIA_ROOT", "/srv/media"),
        ("ORIGIN_BASE", "https://mirror.example.test"),
        ("VIDCACHE_PORT", "4242"),
        ("VIDCACHE_HOST", "127.0.0.1"),
    ];

    #[test]
    fn backend_args_read_env_file() {
        let args = parse_backend_args(BASE_ENV, &[]);
        assert_eq!(args.media_root, PathBuf::from("/srv/media"));
        assert_eq!(args.origin_base, "https://mirror.example.test");
        assert_eq!(args.vidcache_port, 4242);
        assert_eq!(args.listen_host, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn backend_args_overrides_win() {
        let args = parse_backend_args(
            BASE_ENV,
            &[
                "--media-root",
                "/custom/media",
                "--origin-base=https://other.test",
                "--port=9000",
                "--host",
                "0.0.0.0",
            ],
        );
        assert_eq!(args.media_root, PathBuf::from("/custom/media"));
        assert_eq!(args.origin_base, "https://other.test");
        assert_eq!(args.vidcache_port, 9000);
        assert_eq!(args.listen_host, "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn backend_args_reject_unknown_flags() {
        let mut err = None;
        with_env_file(BASE_ENV, || {
            err = Some(BackendArgs::from_iter(vec!["--bogus".to_string()]).unwrap_err());
        });
        assert!(err.unwrap().to_string().contains("unknown argument"));
    }

    #[test]
    fn normalize_origin_rebases_scheme_and_host() {
        assert_eq!(
            normalize_origin("https://mirror.test", "http://some.proxy/watch/film-2024"),
            "https://mirror.test/watch/film-2024"
        );
    }

    #[test]
    fn normalize_origin_strips_query() {
        assert_eq!(
            normalize_origin("https://mirror.test", "https://x.test/watch/film?ref=42"),
            "https://mirror.test/watch/film"
        );
    }

    #[test]
    fn normalize_origin_accepts_bare_paths() {
        assert_eq!(
            normalize_origin("https://mirror.test", "/watch/film"),
            "https://mirror.test/watch/film"
        );
        assert_eq!(
            normalize_origin("https://mirror.test", "watch/film"),
            "https://mirror.test/watch/film"
        );
    }

    #[test]
    fn resolve_media_path_rejects_traversal() {
        let root = PathBuf::from("/srv/media");
        assert!(resolve_media_path(&root, "../etc/passwd").is_err());
        assert!(resolve_media_path(&root, "/etc/passwd").is_err());
        assert!(resolve_media_path(&root, "").is_err());
        assert_eq!(
            resolve_media_path(&root, "m/Film.mp4").unwrap(),
            PathBuf::from("/srv/media/m/Film.mp4")
        );
    }

    #[test]
    fn local_media_url_is_relative_to_root() {
        assert_eq!(
            local_media_url(Path::new("/srv/media"), Path::new("/srv/media/m/Film.mp4")),
            "/media/m/Film.mp4"
        );
    }

    fn range_of(raw: &str, size: u64) -> Option<(u64, u64)> {
        parse_range_header(&raw.parse().unwrap(), size)
    }

    #[test]
    fn range_header_variants() {
        assert_eq!(range_of("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(range_of("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(range_of("bytes=-100", 1000), Some((900, 999)));
        assert_eq!(range_of("bytes=-2000", 1000), Some((0, 999)));
        assert_eq!(range_of("bytes=9-5", 1000), None);
        assert_eq!(range_of("chunks=0-99", 1000), None);
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        assert_eq!(ping().await, "Pong!");
    }

    #[tokio::test]
    async fn set_position_then_player_info_round_trip() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        set_position(
            AxumState(state.clone()),
            Json(PositionRequest {
                video_path: "media/m/Film.mp4".into(),
                time: 42.5,
            }),
        )
        .await
        .unwrap();

        let Json(info) = player_info(
            AxumState(state),
            AxumPath("media/m/Film.mp4".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(info.start_point, 42.5);
        assert_eq!(info.readiness, "unknown");
        assert_eq!(info.video_url, None);
    }

    #[tokio::test]
    async fn player_info_for_ready_file_points_at_media_endpoint() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        std::fs::create_dir_all(dir.path().join("m")).unwrap();
        let file_path = dir.path().join("m/Ready.2020.1080p.mp4");
        std::fs::write(&file_path, b"data").unwrap();

        let Json(info) = player_info(
            AxumState(state),
            AxumPath(file_path.to_string_lossy().into_owned()),
        )
        .await
        .unwrap();
        assert_eq!(info.readiness, "ready");
        assert_eq!(info.video_url.as_deref(), Some("/media/m/Ready.2020.1080p.mp4"));
    }

    #[tokio::test]
    async fn play_with_cached_file_returns_reference_without_download() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        // Seed the index through the cache API with a file that exists.
        std::fs::create_dir_all(dir.path().join("m")).unwrap();
        let final_path = dir.path().join("m/Seen.2020.1080p.mp4");
        std::fs::write(&final_path, b"data").unwrap();
        let download_url = "https://cdn.test/dl/m1/y/Seen.2020.1080p.mp4";
        let (_, _) = state
            .cache
            .admit("https://mirror.example.test/watch/seen", download_url)
            .unwrap();

        let Json(response) = play(
            AxumState(state),
            Json(PlayRequest {
                page: "https://anything.test/watch/seen?utm=1".into(),
                download_url: download_url.into(),
            }),
        )
        .await
        .unwrap();

        let reference = CacheReference::parse(&response.reference);
        assert_eq!(reference, CacheReference::Cached(final_path));
    }

    #[tokio::test]
    async fn play_rejects_malformed_download_urls() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        let err = play(
            AxumState(state),
            Json(PlayRequest {
                page: "https://x.test/watch/film".into(),
                download_url: "https://cdn.test/nope".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn serve_media_streams_with_range() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        std::fs::create_dir_all(dir.path().join("m")).unwrap();
        std::fs::write(dir.path().join("m/Clip.mp4"), b"0123456789").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=2-5".parse().unwrap());
        let response = serve_media(
            AxumState(state.clone()),
            AxumPath("m/Clip.mp4".to_string()),
            headers,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"2345");

        let full = serve_media(
            AxumState(state),
            AxumPath("m/Clip.mp4".to_string()),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        let body = to_bytes(full.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"0123456789");
    }

    #[tokio::test]
    async fn serve_media_missing_file_is_404() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        let err = serve_media(
            AxumState(state),
            AxumPath("m/Nope.mp4".to_string()),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn play_then_player_info_reports_failure_for_dead_remote() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        // Nothing listens on this port, so the transfer fails quickly while
        // the play call itself still succeeds with a reference.
        let Json(response) = play(
            AxumState(state.clone()),
            Json(PlayRequest {
                page: "https://x.test/watch/dead".into(),
                download_url: "http://127.0.0.1:9/dl/m1/y/Dead.2024.1080p.mp4".into(),
            }),
        )
        .await
        .unwrap();
        let CacheReference::Cached(final_path) = CacheReference::parse(&response.reference) else {
            panic!("expected cached reference");
        };

        let final_str = final_path.to_string_lossy().into_owned();
        for _ in 0..200 {
            if state.cache.transfer_readiness(&final_str) == Readiness::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(state.cache.transfer_readiness(&final_str), Readiness::Failed);

        let Json(info) = player_info(AxumState(state), AxumPath(final_str)).await.unwrap();
        assert_eq!(info.readiness, "failed");
        assert_eq!(info.video_url, None);
    }
}
