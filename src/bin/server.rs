#![forbid(unsafe_code)]

//! Axum server that turns YouTube URLs into MP3 files.
//!
//! Each download request runs the probe/download/transcode pipeline behind a
//! bounded semaphore, records the finished file in the history index, and
//! leaves the MP3 under the downloads directory for `/download_file` to
//! stream back.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal, sync::Semaphore};
use tokio_util::io::ReaderStream;
use tubemp3::config::{RuntimeOverrides, resolve_runtime_settings};
use tubemp3::history::{HistoryEntry, HistoryStore};
use tubemp3::pipeline::{ErrorKind, PipelineError, ToolConfig, fetch_audio};
use tubemp3::probe::{self, VideoMetadata};
use tubemp3::progress::{ProgressSnapshot, ProgressTracker};
use tubemp3::security::{ensure_not_root, is_safe_leaf};
use tubemp3::validate::is_valid_media_url;

// SQLite history index relative to the downloads root.
const HISTORY_DB_FILE: &str = "history.db";

#[derive(Debug, Clone)]
struct ServerArgs {
    downloads_root: PathBuf,
    www_root: PathBuf,
    port: u16,
    listen_host: IpAddr,
    max_concurrent: usize,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut downloads_root_override: Option<PathBuf> = None;
        let mut www_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<String> = None;
        let mut max_concurrent_override: Option<usize> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--downloads-root=") {
                downloads_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                www_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--max-concurrent=") {
                max_concurrent_override = Some(parse_concurrency_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--downloads-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--downloads-root requires a value"))?;
                    downloads_root_override = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    www_root_override = Some(PathBuf::from(value));
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
                    host_override = Some(value);
                }
                "--max-concurrent" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--max-concurrent requires a value"))?;
                    max_concurrent_override = Some(parse_concurrency_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_runtime_settings(RuntimeOverrides {
            downloads_root: downloads_root_override,
            www_root: www_root_override,
            port: port_override,
            host: host_override,
            max_concurrent: max_concurrent_override,
            ..RuntimeOverrides::default()
        })?;
        let listen_host = parse_host_arg(&settings.host)?;

        Ok(Self {
            downloads_root: settings.downloads_root,
            www_root: settings.www_root,
            port: settings.port,
            listen_host,
            max_concurrent: settings.max_concurrent,
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
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEMP3_HOST")
}

fn parse_concurrency_arg(value: &str) -> Result<usize> {
    let parsed = value
        .parse::<usize>()
        .context("expected a positive number for --max-concurrent")?;
    if parsed == 0 {
        bail!("--max-concurrent must be at least 1");
    }
    Ok(parsed)
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    tools: Arc<ToolConfig>,
    tracker: Arc<ProgressTracker>,
    history: Arc<HistoryStore>,
    downloads_root: Arc<PathBuf>,
    www_root: Arc<PathBuf>,
    download_slots: Arc<Semaphore>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::InvalidInput,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: ErrorKind::NotFound,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match err.kind {
            ErrorKind::InvalidInput | ErrorKind::ProbeFailure => StatusCode::BAD_REQUEST,
            ErrorKind::ToolFailure | ErrorKind::Timeout => StatusCode::BAD_GATEWAY,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind,
            message: err.message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind.as_str(),
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let ServerArgs {
        downloads_root,
        www_root,
        port,
        listen_host,
        max_concurrent,
    } = ServerArgs::parse()?;

    ensure_not_root("server")?;

    let tools = ToolConfig::from_env();
    ensure_program_available(&tools.downloader)?;
    ensure_program_available(&tools.transcoder)?;

    std::fs::create_dir_all(&downloads_root)
        .with_context(|| format!("creating {}", downloads_root.display()))?;
    let history = HistoryStore::open(&downloads_root.join(HISTORY_DB_FILE))
        .await
        .context("initializing download history")?;

    let state = AppState {
        tools: Arc::new(tools),
        tracker: Arc::new(ProgressTracker::new()),
        history: Arc::new(history),
        downloads_root: Arc::new(downloads_root),
        www_root: Arc::new(www_root),
        download_slots: Arc::new(Semaphore::new(max_concurrent)),
    };

    let app = Router::new()
        .route("/get_video_info", get(get_video_info).post(post_video_info))
        .route("/download", post(download))
        .route("/download_file/{filename}", get(download_file))
        .route("/get_history", get(get_history))
        .route("/get_progress/{id}", get(get_progress))
        .fallback(static_fallback)
        .with_state(state);

    let addr = SocketAddr::new(listen_host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("tubemp3 listening on http://{} ({max_concurrent} concurrent downloads)", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

/// Verifies an external tool responds to `--version` before accepting any
/// requests that would need it.
fn ensure_program_available(program: &Path) -> Result<()> {
    let status = std::process::Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("launching {}", program.display()))?;
    if !status.success() {
        bail!("{} --version exited with {}", program.display(), status);
    }
    Ok(())
}

#[derive(Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

#[derive(Deserialize)]
struct UrlRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    filename: String,
    title: String,
}

fn require_valid_url(url: Option<&str>) -> ApiResult<&str> {
    let url = url.map(str::trim).filter(|value| !value.is_empty());
    let url = url.ok_or_else(|| ApiError::invalid_input("missing url"))?;
    if !is_valid_media_url(url) {
        return Err(ApiError::invalid_input("not a recognized YouTube video URL"));
    }
    Ok(url)
}

async fn get_video_info(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Json<VideoMetadata>> {
    video_info(&state, query.url.as_deref()).await
}

async fn post_video_info(
    State(state): State<AppState>,
    Json(payload): Json<UrlRequest>,
) -> ApiResult<Json<VideoMetadata>> {
    video_info(&state, payload.url.as_deref()).await
}

async fn video_info(state: &AppState, url: Option<&str>) -> ApiResult<Json<VideoMetadata>> {
    let url = require_valid_url(url)?;
    let metadata = probe::probe(&state.tools, url).await?;
    Ok(Json(metadata))
}

async fn download(
    State(state): State<AppState>,
    Json(payload): Json<UrlRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let url = require_valid_url(payload.url.as_deref())?.to_owned();

    // Callers queue here when every download slot is busy.
    let _permit = state
        .download_slots
        .acquire()
        .await
        .map_err(|_| ApiError::internal("download pool is shut down"))?;

    let outcome = fetch_audio(&state.tools, &url, &state.downloads_root, &state.tracker).await?;

    let entry = HistoryEntry::now(
        &outcome.filename,
        &outcome.video_id,
        &outcome.title,
        outcome.size_bytes,
    );
    // The file is already on disk, so an index failure only degrades history.
    if let Err(err) = state.history.record(&entry).await {
        eprintln!("Failed to record {} in history: {err}", outcome.filename);
    }

    println!(
        "Downloaded {} ({} bytes) for video {}",
        outcome.filename, outcome.size_bytes, outcome.video_id
    );
    Ok(Json(DownloadResponse {
        success: true,
        filename: outcome.filename,
        title: outcome.title,
    }))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    if !is_safe_leaf(&filename) {
        return Err(ApiError::not_found("file not found"));
    }

    let path = state.downloads_root.join(&filename);
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(
        header::CONTENT_LENGTH,
        size.to_string()
            .parse()
            .map_err(|_| ApiError::internal("building response headers"))?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{filename}\"")
            .parse()
            .map_err(|_| ApiError::internal("building response headers"))?,
    );
    Ok(response)
}

async fn get_history(State(state): State<AppState>) -> ApiResult<Json<Vec<HistoryEntry>>> {
    let entries = state
        .history
        .list()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(entries))
}

async fn get_progress(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ProgressSnapshot>> {
    let snapshot = state
        .tracker
        .snapshot(&id)
        .ok_or_else(|| ApiError::not_found("no download in progress for that id"))?;
    Ok(Json(snapshot))
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    match serve_www_path(&state.www_root, req.uri().path()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let target = match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => root.join("index.html"),
        Ok(_) => target,
        Err(_) => return Err(ApiError::not_found("file not found")),
    };

    let file = File::open(&target)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&target).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}
