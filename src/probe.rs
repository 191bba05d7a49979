#![forbid(unsafe_code)]

//! Metadata probe: asks yt-dlp for a single JSON document describing a video
//! without downloading any media.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

use crate::pipeline::{PipelineError, ToolConfig};

/// What a successful probe reports back to the client. Serialized verbatim
/// as the `/get_video_info` response body.
#[derive(Debug, Clone, Serialize)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub formats: Vec<FormatDescriptor>,
}

/// One available source format, trimmed to the fields the frontend shows.
#[derive(Debug, Clone, Serialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tbr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
}

// yt-dlp's --dump-single-json output carries far more than we surface; the
// deserializer only names what survives into VideoMetadata.
#[derive(Debug, Deserialize)]
struct RawInfo {
    id: String,
    title: String,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    ext: Option<String>,
    format_note: Option<String>,
    filesize: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    tbr: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
}

impl From<RawInfo> for VideoMetadata {
    fn from(raw: RawInfo) -> Self {
        Self {
            id: raw.id,
            title: raw.title,
            thumbnail: raw.thumbnail,
            formats: raw
                .formats
                .into_iter()
                .map(|format| FormatDescriptor {
                    format_id: format.format_id,
                    ext: format.ext,
                    note: format.format_note,
                    filesize: format.filesize,
                    width: format.width,
                    height: format.height,
                    fps: format.fps,
                    tbr: format.tbr,
                    vcodec: format.vcodec,
                    acodec: format.acodec,
                })
                .collect(),
        }
    }
}

/// Fetches metadata for `url` within the configured probe deadline.
///
/// Any tool failure here, including unreadable JSON, is a probe failure:
/// the URL looked valid but does not resolve to a usable video.
pub async fn probe(config: &ToolConfig, url: &str) -> Result<VideoMetadata, PipelineError> {
    let mut command = Command::new(&config.downloader);
    command
        .arg("--dump-single-json")
        .arg("--skip-download")
        .arg("--no-playlist")
        .arg("--no-warnings")
        .arg("--socket-timeout")
        .arg(config.socket_timeout_secs.to_string());
    if config.skip_certificate_checks {
        command.arg("--no-check-certificates");
    }
    command
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let finished = match timeout(config.probe_timeout, command.output()).await {
        Ok(result) => result.map_err(|err| {
            PipelineError::internal(format!(
                "launching {}: {err}",
                config.downloader.display()
            ))
        })?,
        Err(_) => return Err(PipelineError::timeout("metadata probe", config.probe_timeout)),
    };

    if !finished.status.success() {
        let stderr = String::from_utf8_lossy(&finished.stderr);
        let detail = stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .unwrap_or("no diagnostic output");
        return Err(PipelineError::probe_failure(format!(
            "could not read video metadata: {detail}"
        )));
    }

    let raw: RawInfo = serde_json::from_slice(&finished.stdout).map_err(|err| {
        PipelineError::probe_failure(format!("unreadable metadata from downloader: {err}"))
    })?;
    Ok(raw.into())
}
