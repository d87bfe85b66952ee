#![forbid(unsafe_code)]

//! Runtime configuration for the vidcache binaries.
//!
//! Values come from three places with fixed precedence: explicit overrides
//! (CLI), process environment variables, then the `.env` file next to the
//! binary. Only `MEDIA_ROOT` and `ORIGIN_BASE` are mandatory.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_VIDCACHE_PORT: u16 = 8918;
pub const DEFAULT_VIDCACHE_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the cached media tree plus both index documents.
    pub media_root: PathBuf,
    /// Base URL used to normalize origin identifiers, e.g. the canonical
    /// scheme+host of the mirrored site.
    pub origin_base: String,
    pub vidcache_port: u16,
    pub vidcache_host: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub origin_base: Option<String>,
    pub vidcache_port: Option<u16>,
    pub vidcache_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let media_root = overrides
        .media_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("MEDIA_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set"))?;
    let origin_base = overrides
        .origin_base
        .and_then(non_blank)
        .or_else(|| lookup_value("ORIGIN_BASE", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("ORIGIN_BASE not set"))?;
    let vidcache_port = overrides
        .vidcache_port
        .or_else(|| {
            lookup_value("VIDCACHE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_VIDCACHE_PORT);
    let vidcache_host = overrides
        .vidcache_host
        .and_then(non_blank)
        .or_else(|| lookup_value("VIDCACHE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_VIDCACHE_HOST.to_string());
    Ok(RuntimeConfig {
        media_root: PathBuf::from(media_root),
        origin_base: origin_base.trim_end_matches('/').to_string(),
        vidcache_port,
        vidcache_host,
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
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
