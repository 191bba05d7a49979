#![forbid(unsafe_code)]

//! Shared library for the tubemp3 server binary.
//!
//! The crate turns a YouTube watch URL into an MP3 file on disk by driving
//! two external tools (yt-dlp for extraction, ffmpeg for transcoding) and
//! exposes the request lifecycle pieces individually so each one can be
//! tested with stub executables.

pub mod config;
pub mod history;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod sanitize;
pub mod security;
pub mod validate;
