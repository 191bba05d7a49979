#![forbid(unsafe_code)]

//! Runtime configuration for the tubemp3 server.
//!
//! Values resolve in order: CLI overrides, process environment, `.env` file,
//! built-in defaults. The `.env` parser accepts `export` prefixes, quoting,
//! and comments so the same file can be sourced by a shell.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOADS_ROOT: &str = "downloads";
pub const DEFAULT_WWW_ROOT: &str = "www";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub downloads_root: PathBuf,
    pub www_root: PathBuf,
    pub port: u16,
    pub host: String,
    pub max_concurrent: usize,
}

/// Values that outrank both the environment and the `.env` file, typically
/// sourced from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub max_concurrent: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(RuntimeOverrides::default())
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let downloads_root = overrides
        .downloads_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DOWNLOADS_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DOWNLOADS_ROOT.to_string());
    let www_root = overrides
        .www_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_WWW_ROOT.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEMP3_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("TUBEMP3_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let max_concurrent = overrides
        .max_concurrent
        .or_else(|| {
            lookup_value("TUBEMP3_MAX_CONCURRENT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<usize>().ok())
        })
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENT);

    Ok(RuntimeSettings {
        downloads_root: PathBuf::from(downloads_root),
        www_root: PathBuf::from(www_root),
        port,
        host,
        max_concurrent,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
