#![forbid(unsafe_code)]

//! Download/transcode pipeline: drives yt-dlp and ffmpeg to turn a validated
//! video URL into an MP3 under the downloads directory.
//!
//! The whole operation is single-attempt: either a finished file lands in
//! the downloads directory, or the request fails with a typed error and the
//! temporary working directory is released. No partial results survive.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use crate::probe;
use crate::progress::{ProgressTracker, parse_progress_line};
use crate::sanitize::sanitize_title;

const SOURCE_BASENAME: &str = "source.m4a";
const TRANSCODED_BASENAME: &str = "audio.mp3";
const AUDIO_EXTENSION: &str = "mp3";

/// Stable machine-readable failure classification, exposed to API clients
/// alongside the human message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    ProbeFailure,
    ToolFailure,
    Timeout,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::ProbeFailure => "probe_failure",
            Self::ToolFailure => "tool_failure",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Internal => "internal_error",
        }
    }
}

#[derive(Debug)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn probe_failure(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ProbeFailure,
            message: message.into(),
        }
    }

    pub fn tool_failure(stage: Stage, detail: &str) -> Self {
        let detail = if detail.is_empty() {
            "no diagnostic output"
        } else {
            detail
        };
        Self {
            kind: ErrorKind::ToolFailure,
            message: format!("{} failed: {detail}", stage.label()),
        }
    }

    pub fn timeout(stage_label: &str, limit: Duration) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: format!("{stage_label} exceeded the {}s limit", limit.as_secs()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PipelineError {}

/// Pipeline stage names used in error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Download,
    Transcode,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Self::Download => "audio download",
            Self::Transcode => "transcode",
        }
    }
}

/// Fixed invocation options for the two external tools.
///
/// Every field is set at startup and never reachable from the HTTP boundary.
/// The retry count and socket timeout are internal to yt-dlp; the service
/// itself never retries a failed stage.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Path or command name of the downloader (yt-dlp).
    pub downloader: PathBuf,
    /// Path or command name of the transcoder (ffmpeg).
    pub transcoder: PathBuf,
    /// yt-dlp `-f` selector; prefers an m4a audio track, else best audio.
    pub format_selector: String,
    /// Intermediate container handed to the transcode stage.
    pub audio_format: String,
    /// yt-dlp `--audio-quality`; "0" is best.
    pub audio_quality: String,
    /// Final MP3 bitrate.
    pub bitrate: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub retries: u32,
    pub socket_timeout_secs: u64,
    pub user_agent: String,
    pub skip_certificate_checks: bool,
    /// Deadline for the metadata probe.
    pub probe_timeout: Duration,
    /// Deadline applied to each of the two pipeline stages.
    pub stage_timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            downloader: PathBuf::from("yt-dlp"),
            transcoder: PathBuf::from("ffmpeg"),
            format_selector: "bestaudio[ext=m4a]/bestaudio/best".to_string(),
            audio_format: "m4a".to_string(),
            audio_quality: "0".to_string(),
            bitrate: "320k".to_string(),
            sample_rate: 44_100,
            channels: 2,
            retries: 3,
            socket_timeout_secs: 15,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .to_string(),
            skip_certificate_checks: true,
            probe_timeout: Duration::from_secs(30),
            stage_timeout: Duration::from_secs(300),
        }
    }
}

impl ToolConfig {
    /// Builds the default config, honoring `TUBEMP3_YTDLP_BIN` and
    /// `TUBEMP3_FFMPEG_BIN` overrides for non-PATH installs.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("TUBEMP3_YTDLP_BIN") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                config.downloader = PathBuf::from(trimmed);
            }
        }
        if let Ok(value) = std::env::var("TUBEMP3_FFMPEG_BIN") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                config.transcoder = PathBuf::from(trimmed);
            }
        }
        config
    }
}

/// Everything the `/download` handler needs to answer the client and index
/// the finished file.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub filename: String,
    pub title: String,
    pub video_id: String,
    pub size_bytes: u64,
}

/// Runs the full lifecycle for one request: probe, download, transcode, and
/// relocation into `downloads_root`. Progress for the download stage is
/// published to `tracker` under the probed video id.
pub async fn fetch_audio(
    config: &ToolConfig,
    url: &str,
    downloads_root: &Path,
    tracker: &ProgressTracker,
) -> Result<DownloadOutcome, PipelineError> {
    let metadata = probe::probe(config, url).await?;

    let workdir = tempfile::tempdir()
        .map_err(|err| PipelineError::internal(format!("creating working directory: {err}")))?;
    let source_path = workdir.path().join(SOURCE_BASENAME);
    let transcoded_path = workdir.path().join(TRANSCODED_BASENAME);

    tracker.start(&metadata.id);
    let staged = async {
        run_downloader(config, url, &source_path, tracker, &metadata.id).await?;
        run_transcoder(config, &source_path, &transcoded_path).await
    }
    .await;
    if let Err(err) = staged {
        tracker.forget(&metadata.id);
        return Err(err);
    }
    tracker.finish(&metadata.id);

    let outcome = finalize(
        &transcoded_path,
        downloads_root,
        &metadata.title,
        &metadata.id,
    )
    .await?;

    // `workdir` drops here, releasing the intermediate m4a on success; the
    // same drop runs on every error return above.
    drop(workdir);
    Ok(outcome)
}

/// Stage one: yt-dlp writes the best audio track as m4a into the working
/// directory, emitting one parseable progress line per update.
async fn run_downloader(
    config: &ToolConfig,
    url: &str,
    output: &Path,
    tracker: &ProgressTracker,
    video_id: &str,
) -> Result<(), PipelineError> {
    let mut command = Command::new(&config.downloader);
    command
        .arg("-f")
        .arg(&config.format_selector)
        .arg("--extract-audio")
        .arg("--audio-format")
        .arg(&config.audio_format)
        .arg("--audio-quality")
        .arg(&config.audio_quality)
        .arg("--retries")
        .arg(config.retries.to_string())
        .arg("--socket-timeout")
        .arg(config.socket_timeout_secs.to_string())
        .arg("--no-playlist")
        .arg("--no-warnings")
        .arg("--newline")
        .arg("--add-header")
        .arg(format!("User-Agent:{}", config.user_agent));
    if config.skip_certificate_checks {
        command.arg("--no-check-certificates");
    }
    command.arg("-o").arg(output).arg(url);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| {
        PipelineError::internal(format!(
            "launching {}: {err}",
            config.downloader.display()
        ))
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::internal("downloader stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| PipelineError::internal("downloader stderr not captured"))?;

    let drive = async {
        let mut stderr_buf = String::new();
        let progress_pump = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(update) = parse_progress_line(&line) {
                    tracker.update(video_id, update);
                }
            }
            Ok::<(), std::io::Error>(())
        };
        let mut stderr_reader = BufReader::new(stderr);
        let stderr_pump = stderr_reader.read_to_string(&mut stderr_buf);

        let (progress_result, stderr_result) = tokio::join!(progress_pump, stderr_pump);
        progress_result?;
        stderr_result?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, stderr_buf))
    };

    // Bind first so the timeout future (which borrows the child) is dropped
    // before the kill path needs the handle back.
    let driven = timeout(config.stage_timeout, drive).await;
    match driven {
        Ok(Ok((status, _))) if status.success() => Ok(()),
        Ok(Ok((_, stderr_buf))) => Err(PipelineError::tool_failure(
            Stage::Download,
            &stderr_excerpt(&stderr_buf),
        )),
        Ok(Err(err)) => Err(PipelineError::internal(format!(
            "reading downloader output: {err}"
        ))),
        Err(_) => {
            let _ = child.kill().await;
            Err(PipelineError::timeout("audio download", config.stage_timeout))
        }
    }
}

/// Stage two: ffmpeg re-encodes the intermediate track to a fixed-bitrate
/// stereo MP3 at the configured sample rate.
async fn run_transcoder(
    config: &ToolConfig,
    input: &Path,
    output: &Path,
) -> Result<(), PipelineError> {
    let mut command = Command::new(&config.transcoder);
    command
        .arg("-i")
        .arg(input)
        .arg("-vn")
        .arg("-ar")
        .arg(config.sample_rate.to_string())
        .arg("-ac")
        .arg(config.channels.to_string())
        .arg("-b:a")
        .arg(&config.bitrate)
        .arg("-y")
        .arg(output)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output_result = match timeout(config.stage_timeout, command.output()).await {
        Ok(result) => result,
        Err(_) => return Err(PipelineError::timeout("transcode", config.stage_timeout)),
    };

    let finished = output_result.map_err(|err| {
        PipelineError::internal(format!(
            "launching {}: {err}",
            config.transcoder.display()
        ))
    })?;

    if finished.status.success() {
        Ok(())
    } else {
        let stderr_buf = String::from_utf8_lossy(&finished.stderr);
        Err(PipelineError::tool_failure(
            Stage::Transcode,
            &stderr_excerpt(&stderr_buf),
        ))
    }
}

/// Moves the finished MP3 into the downloads directory under its sanitized
/// title, falling back to copy+remove across filesystems.
async fn finalize(
    transcoded: &Path,
    downloads_root: &Path,
    title: &str,
    video_id: &str,
) -> Result<DownloadOutcome, PipelineError> {
    tokio::fs::create_dir_all(downloads_root)
        .await
        .map_err(|err| {
            PipelineError::internal(format!(
                "creating {}: {err}",
                downloads_root.display()
            ))
        })?;

    let target = resolve_target_path(downloads_root, &sanitize_title(title), video_id);

    if tokio::fs::rename(transcoded, &target).await.is_err() {
        tokio::fs::copy(transcoded, &target).await.map_err(|err| {
            PipelineError::internal(format!("moving file to {}: {err}", target.display()))
        })?;
        let _ = tokio::fs::remove_file(transcoded).await;
    }

    let size_bytes = tokio::fs::metadata(&target)
        .await
        .map(|meta| meta.len())
        .map_err(|err| {
            PipelineError::internal(format!("inspecting {}: {err}", target.display()))
        })?;

    let filename = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| PipelineError::internal("finished file has no name"))?;

    Ok(DownloadOutcome {
        filename,
        title: title.to_owned(),
        video_id: video_id.to_owned(),
        size_bytes,
    })
}

/// Picks the destination filename. Once the sanitized title is taken, the
/// video id is appended so distinct videos sharing a title never overwrite
/// each other. The suffixed name is deterministic per video, so repeating a
/// download replaces that video's own suffixed file rather than fanning out
/// further copies.
fn resolve_target_path(root: &Path, safe_title: &str, video_id: &str) -> PathBuf {
    let preferred = root.join(format!("{safe_title}.{AUDIO_EXTENSION}"));
    if !preferred.exists() {
        return preferred;
    }
    root.join(format!("{safe_title}_{video_id}.{AUDIO_EXTENSION}"))
}

/// Keeps error payloads readable: the last few non-empty stderr lines.
fn stderr_excerpt(raw: &str) -> String {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStatus;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    const STUB_INFO_JSON: &str = r#"{"id":"abc12345678","title":"Test Title","thumbnail":"https://img.example/t.jpg","formats":[]}"#;

    fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// yt-dlp stand-in: answers the probe with canned JSON, otherwise writes
    /// a fake m4a to the `-o` target while emitting progress lines.
    fn downloader_stub(dir: &Path) -> PathBuf {
        write_stub(
            dir,
            "yt-dlp-stub",
            &format!(
                r#"case "$*" in
  *--dump-single-json*) echo '{STUB_INFO_JSON}'; exit 0;;
esac
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
done
echo "[download]  50.0% of 1.00MiB at 512.00KiB/s ETA 00:01"
echo "[download] 100% of 1.00MiB in 00:02"
printf 'm4a-payload' > "$out""#
            ),
        )
    }

    /// ffmpeg stand-in: copies the `-i` input to the final (last) argument.
    fn transcoder_stub(dir: &Path) -> PathBuf {
        write_stub(
            dir,
            "ffmpeg-stub",
            r#"in=""
prev=""
out=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then in="$arg"; fi
  prev="$arg"
  out="$arg"
done
cp "$in" "$out""#,
        )
    }

    fn stub_config(stubs: &Path) -> ToolConfig {
        ToolConfig {
            downloader: downloader_stub(stubs),
            transcoder: transcoder_stub(stubs),
            ..ToolConfig::default()
        }
    }

    #[tokio::test]
    async fn fetch_audio_happy_path() {
        let stubs = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let config = stub_config(stubs.path());
        let tracker = ProgressTracker::new();

        let outcome = fetch_audio(
            &config,
            "https://www.youtube.com/watch?v=abc12345678",
            downloads.path(),
            &tracker,
        )
        .await
        .unwrap();

        assert_eq!(outcome.title, "Test Title");
        assert_eq!(outcome.video_id, "abc12345678");
        assert_eq!(outcome.filename, "Test_Title.mp3");

        let produced = downloads.path().join(&outcome.filename);
        assert_eq!(fs::read(&produced).unwrap(), b"m4a-payload");
        assert_eq!(outcome.size_bytes, "m4a-payload".len() as u64);

        // Only the finished file remains; no temp artifacts leak into the
        // downloads directory.
        let entries: Vec<_> = fs::read_dir(downloads.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        let snapshot = tracker.snapshot("abc12345678").unwrap();
        assert_eq!(snapshot.status, ProgressStatus::Finished);
        assert_eq!(snapshot.percent, 100.0);
    }

    #[tokio::test]
    async fn downloader_failure_reports_stderr() {
        let stubs = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let mut config = stub_config(stubs.path());
        config.downloader = write_stub(
            stubs.path(),
            "yt-dlp-broken",
            &format!(
                r#"case "$*" in
  *--dump-single-json*) echo '{STUB_INFO_JSON}'; exit 0;;
esac
echo "ERROR: fragment not found" >&2
exit 2"#
            ),
        );
        let tracker = ProgressTracker::new();

        let err = fetch_audio(
            &config,
            "https://www.youtube.com/watch?v=abc12345678",
            downloads.path(),
            &tracker,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ToolFailure);
        assert!(err.message.contains("audio download failed"));
        assert!(err.message.contains("fragment not found"));

        // Failed downloads leave no in-flight record behind.
        assert!(tracker.snapshot("abc12345678").is_none());
    }

    #[tokio::test]
    async fn transcoder_failure_reports_stage() {
        let stubs = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let mut config = stub_config(stubs.path());
        config.transcoder = write_stub(
            stubs.path(),
            "ffmpeg-broken",
            r#"echo "Invalid data found when processing input" >&2
exit 1"#,
        );
        let tracker = ProgressTracker::new();

        let err = fetch_audio(
            &config,
            "https://www.youtube.com/watch?v=abc12345678",
            downloads.path(),
            &tracker,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ToolFailure);
        assert!(err.message.contains("transcode failed"));
        assert!(err.message.contains("Invalid data"));
        assert!(tracker.snapshot("abc12345678").is_none());
    }

    #[tokio::test]
    async fn stage_deadline_kills_stuck_downloader() {
        let stubs = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let mut config = stub_config(stubs.path());
        let pid_file = stubs.path().join("stuck.pid");
        config.downloader = write_stub(
            stubs.path(),
            "yt-dlp-stuck",
            &format!(
                r#"case "$*" in
  *--dump-single-json*) echo '{STUB_INFO_JSON}'; exit 0;;
esac
echo $$ > {pid_file}
exec sleep 30"#,
                pid_file = pid_file.display()
            ),
        );
        config.stage_timeout = Duration::from_millis(300);
        let tracker = ProgressTracker::new();

        let err = fetch_audio(
            &config,
            "https://www.youtube.com/watch?v=abc12345678",
            downloads.path(),
            &tracker,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("audio download"));
        assert!(tracker.snapshot("abc12345678").is_none());

        // The stuck child was killed and reaped, not left running.
        let pid: i32 = fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }

    #[test]
    fn collision_appends_video_id() {
        let downloads = TempDir::new().unwrap();
        let first = resolve_target_path(downloads.path(), "Same_Title", "aaaaaaaaaaa");
        assert_eq!(first, downloads.path().join("Same_Title.mp3"));

        fs::write(&first, b"x").unwrap();
        let second = resolve_target_path(downloads.path(), "Same_Title", "bbbbbbbbbbb");
        assert_eq!(
            second,
            downloads.path().join("Same_Title_bbbbbbbbbbb.mp3")
        );

        // The suffixed name is stable: repeating the same video resolves to
        // the same target instead of producing a third copy.
        fs::write(&second, b"y").unwrap();
        let repeat = resolve_target_path(downloads.path(), "Same_Title", "bbbbbbbbbbb");
        assert_eq!(repeat, second);
    }

    #[test]
    fn stderr_excerpt_keeps_the_tail() {
        let raw = (0..20)
            .map(|index| format!("line {index}"))
            .collect::<Vec<_>>()
            .join("\n");
        let excerpt = stderr_excerpt(&raw);
        assert!(excerpt.contains("line 19"));
        assert!(!excerpt.contains("line 3"));

        assert_eq!(stderr_excerpt(""), "");
        assert_eq!(stderr_excerpt("  \n\n boom \n"), "boom");
    }

    #[test]
    fn error_kinds_serialize_stably() {
        assert_eq!(ErrorKind::InvalidInput.as_str(), "invalid_input");
        assert_eq!(ErrorKind::ProbeFailure.as_str(), "probe_failure");
        assert_eq!(ErrorKind::ToolFailure.as_str(), "tool_failure");
        assert_eq!(ErrorKind::Timeout.as_str(), "timeout");
        assert_eq!(ErrorKind::NotFound.as_str(), "not_found");
        assert_eq!(ErrorKind::Internal.as_str(), "internal_error");
    }
}
