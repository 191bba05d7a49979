#![forbid(unsafe_code)]

//! Process-wide download progress tracking.
//!
//! One record per in-flight download, keyed by the video id reported by the
//! metadata probe. Writers are the pipeline tasks parsing yt-dlp output;
//! readers are `/get_progress` handlers. The map lives behind a single
//! `RwLock` and carries bounded retention so finished entries cannot
//! accumulate for the life of the process.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

const MAX_ENTRIES: usize = 256;
const FINISHED_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Downloading,
    Finished,
}

/// Counters extracted from one yt-dlp progress line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: Option<f64>,
}

struct ProgressEntry {
    started: Instant,
    finished_at: Option<Instant>,
    status: ProgressStatus,
    percent: f64,
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    speed_bytes_per_sec: Option<f64>,
}

impl ProgressEntry {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            finished_at: None,
            status: ProgressStatus::Downloading,
            percent: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            speed_bytes_per_sec: None,
        }
    }
}

/// Read-side view returned to API clients.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressSnapshot {
    pub status: ProgressStatus,
    pub percent: f64,
    pub downloaded_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_bytes_per_sec: Option<f64>,
    pub elapsed_secs: f64,
}

#[derive(Default)]
pub struct ProgressTracker {
    inner: RwLock<HashMap<String, ProgressEntry>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh record for a download that is about to start,
    /// evicting stale entries while the write lock is held anyway.
    pub fn start(&self, id: &str) {
        let mut map = self.inner.write();
        evict(&mut map);
        map.insert(id.to_owned(), ProgressEntry::new());
    }

    pub fn update(&self, id: &str, update: ProgressUpdate) {
        let mut map = self.inner.write();
        let entry = map.entry(id.to_owned()).or_insert_with(ProgressEntry::new);
        entry.percent = update.percent.clamp(0.0, 100.0);
        if update.total_bytes.is_some() {
            entry.total_bytes = update.total_bytes;
        }
        if update.speed_bytes_per_sec.is_some() {
            entry.speed_bytes_per_sec = update.speed_bytes_per_sec;
        }
        if let Some(total) = entry.total_bytes {
            entry.downloaded_bytes = ((entry.percent / 100.0) * total as f64) as u64;
        }
    }

    pub fn finish(&self, id: &str) {
        let mut map = self.inner.write();
        if let Some(entry) = map.get_mut(id) {
            entry.status = ProgressStatus::Finished;
            entry.percent = 100.0;
            if let Some(total) = entry.total_bytes {
                entry.downloaded_bytes = total;
            }
            entry.finished_at = Some(Instant::now());
        }
    }

    /// Drops the record for a download that failed. Readers then see the id
    /// as unknown instead of perpetually in flight, and the entry no longer
    /// occupies the cap while waiting out a retention window it would never
    /// reach.
    pub fn forget(&self, id: &str) {
        self.inner.write().remove(id);
    }

    pub fn snapshot(&self, id: &str) -> Option<ProgressSnapshot> {
        let map = self.inner.read();
        let entry = map.get(id)?;
        Some(ProgressSnapshot {
            status: entry.status,
            percent: entry.percent,
            downloaded_bytes: entry.downloaded_bytes,
            total_bytes: entry.total_bytes,
            speed_bytes_per_sec: entry.speed_bytes_per_sec,
            elapsed_secs: entry.started.elapsed().as_secs_f64(),
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.read().len()
    }
}

/// Drops finished entries past their retention window, then enforces the
/// entry cap by removing finished entries first, oldest first.
fn evict(map: &mut HashMap<String, ProgressEntry>) {
    map.retain(|_, entry| match entry.finished_at {
        Some(at) => at.elapsed() < FINISHED_RETENTION,
        None => true,
    });

    while map.len() >= MAX_ENTRIES {
        let victim = map
            .iter()
            .min_by_key(|(_, entry)| (entry.finished_at.is_none(), entry.started))
            .map(|(key, _)| key.clone());
        match victim {
            Some(key) => {
                map.remove(&key);
            }
            None => break,
        }
    }
}

/// Parses one `--newline` progress line from yt-dlp, e.g.
/// `[download]  45.2% of 10.55MiB at 2.50MiB/s ETA 00:03`.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.trim().strip_prefix("[download]")?.trim_start();
    let (percent_str, tail) = rest.split_once('%')?;
    let percent = percent_str.trim().parse::<f64>().ok()?;
    if !(0.0..=100.0).contains(&percent) {
        return None;
    }

    let mut total_bytes = None;
    let mut speed_bytes_per_sec = None;
    let mut tokens = tail.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            // Totals may be estimates, rendered as "~12.00MiB" or "~ 12.00MiB".
            "of" => {
                if let Some(value) = tokens.next() {
                    let value = value.trim_start_matches('~');
                    if value.is_empty() {
                        if let Some(value) = tokens.next() {
                            total_bytes = parse_size(value);
                        }
                    } else {
                        total_bytes = parse_size(value);
                    }
                }
            }
            "at" => {
                if let Some(value) = tokens.next() {
                    speed_bytes_per_sec = value
                        .strip_suffix("/s")
                        .and_then(parse_size)
                        .map(|bytes| bytes as f64);
                }
            }
            _ => {}
        }
    }

    Some(ProgressUpdate {
        percent,
        total_bytes,
        speed_bytes_per_sec,
    })
}

fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number = number.parse::<f64>().ok()?;
    let factor: f64 = match unit {
        "" | "B" => 1.0,
        "KiB" | "KB" => 1024.0,
        "MiB" | "MB" => 1024.0 * 1024.0,
        "GiB" | "GB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" | "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regular_progress_line() {
        let update =
            parse_progress_line("[download]  45.2% of 10.00MiB at 2.50MiB/s ETA 00:03").unwrap();
        assert_eq!(update.percent, 45.2);
        assert_eq!(update.total_bytes, Some(10 * 1024 * 1024));
        assert_eq!(update.speed_bytes_per_sec, Some(2.5 * 1024.0 * 1024.0));
    }

    #[test]
    fn parses_estimated_total_and_final_line() {
        let update =
            parse_progress_line("[download]   3.1% of ~ 120.00KiB at 512.00KiB/s ETA 00:01")
                .unwrap();
        assert_eq!(update.total_bytes, Some(120 * 1024));

        let packed = parse_progress_line("[download]   3.1% of ~120.00KiB at 512.00KiB/s").unwrap();
        assert_eq!(packed.total_bytes, Some(120 * 1024));

        let done = parse_progress_line("[download] 100% of 1.00MiB in 00:02").unwrap();
        assert_eq!(done.percent, 100.0);
        assert_eq!(done.total_bytes, Some(1024 * 1024));
        assert!(done.speed_bytes_per_sec.is_none());
    }

    #[test]
    fn parses_unknown_speed() {
        let update =
            parse_progress_line("[download]  10.0% of 2.00GiB at Unknown speed ETA Unknown").unwrap();
        assert_eq!(update.percent, 10.0);
        assert_eq!(update.total_bytes, Some(2 * 1024 * 1024 * 1024));
        assert!(update.speed_bytes_per_sec.is_none());
    }

    #[test]
    fn ignores_non_progress_lines() {
        assert!(parse_progress_line("[info] Writing metadata").is_none());
        assert!(parse_progress_line("[download] Destination: /tmp/x.m4a").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("512B"), Some(512));
        assert_eq!(parse_size("1.50KiB"), Some(1536));
        assert_eq!(parse_size("bogus"), None);
        assert_eq!(parse_size("1.0XB"), None);
    }

    #[test]
    fn lifecycle_start_update_finish() {
        let tracker = ProgressTracker::new();
        tracker.start("abc12345678");
        tracker.update(
            "abc12345678",
            ProgressUpdate {
                percent: 50.0,
                total_bytes: Some(1000),
                speed_bytes_per_sec: Some(100.0),
            },
        );

        let snap = tracker.snapshot("abc12345678").unwrap();
        assert_eq!(snap.status, ProgressStatus::Downloading);
        assert_eq!(snap.percent, 50.0);
        assert_eq!(snap.downloaded_bytes, 500);
        assert_eq!(snap.total_bytes, Some(1000));

        tracker.finish("abc12345678");
        let snap = tracker.snapshot("abc12345678").unwrap();
        assert_eq!(snap.status, ProgressStatus::Finished);
        assert_eq!(snap.percent, 100.0);
        assert_eq!(snap.downloaded_bytes, 1000);
    }

    #[test]
    fn forget_removes_the_entry() {
        let tracker = ProgressTracker::new();
        tracker.start("abc12345678");
        assert!(tracker.snapshot("abc12345678").is_some());

        tracker.forget("abc12345678");
        assert!(tracker.snapshot("abc12345678").is_none());
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn unknown_id_returns_none() {
        let tracker = ProgressTracker::new();
        assert!(tracker.snapshot("ghost").is_none());
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let tracker = ProgressTracker::new();
        tracker.start("first-video");
        tracker.start("second-video");
        tracker.update(
            "first-video",
            ProgressUpdate {
                percent: 75.0,
                total_bytes: Some(400),
                speed_bytes_per_sec: None,
            },
        );
        tracker.update(
            "second-video",
            ProgressUpdate {
                percent: 10.0,
                total_bytes: Some(8000),
                speed_bytes_per_sec: None,
            },
        );

        let first = tracker.snapshot("first-video").unwrap();
        let second = tracker.snapshot("second-video").unwrap();
        assert_eq!(first.percent, 75.0);
        assert_eq!(first.total_bytes, Some(400));
        assert_eq!(second.percent, 10.0);
        assert_eq!(second.total_bytes, Some(8000));
    }

    #[test]
    fn map_size_stays_bounded() {
        let tracker = ProgressTracker::new();
        for index in 0..(MAX_ENTRIES * 2) {
            let id = format!("video-{index}");
            tracker.start(&id);
            tracker.finish(&id);
        }
        assert!(tracker.len() <= MAX_ENTRIES);
    }
}
