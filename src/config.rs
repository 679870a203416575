use anyhow::{Context, Result};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Immutable process configuration, read once from the environment and
/// passed by reference into every component that needs it.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub source_base_url: Url,
    pub master_dir: PathBuf,
    pub result_dir: PathBuf,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    pub allowed_prefixes: Option<HashSet<String>>,
    pub max_download_conns_per_host: usize,
    pub max_in_flight_requests: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 8080);

        let source_base_url = env::var("SOURCE_BASE_URL")
            .context("SOURCE_BASE_URL is required (upstream origin for master images)")?;
        let source_base_url = Url::parse(source_base_url.trim())
            .context("SOURCE_BASE_URL must be an absolute URL")?;

        let master_dir = PathBuf::from(
            env::var("MASTER_DIR").unwrap_or_else(|_| "/tmp/imgsrv_master".to_string()),
        );
        let result_dir = PathBuf::from(
            env::var("RESULT_DIR").unwrap_or_else(|_| "/tmp/imgsrv_result".to_string()),
        );

        let request_timeout = Duration::from_secs(parse_u64("PROCESS_TIMEOUT_SECONDS", 30).max(1));
        let download_timeout = Duration::from_secs(parse_u64("DOWNLOAD_TIMEOUT_SECONDS", 30).max(1));

        let allowed_prefixes = parse_allowed_prefixes("ALLOWED_PATH_PREFIXES");
        let max_download_conns_per_host = parse_usize("MAX_DOWNLOAD_CONNS_PER_HOST", 8).max(1);
        let max_in_flight_requests = parse_usize("MAX_IN_FLIGHT_REQUESTS", 512);

        Ok(Self {
            host,
            port,
            source_base_url,
            master_dir,
            result_dir,
            request_timeout,
            download_timeout,
            allowed_prefixes,
            max_download_conns_per_host,
            max_in_flight_requests,
        })
    }
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Allow-list of first path segments. Absent, empty, or a lone `*`
/// disables enforcement entirely.
fn parse_allowed_prefixes(key: &str) -> Option<HashSet<String>> {
    let values = parse_list_env(key)?;
    if values.iter().any(|value| value == "*") {
        return None;
    }
    Some(values.into_iter().collect())
}

fn parse_list_env(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).ok()
    } else {
        let list = raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>();
        if list.is_empty() { None } else { Some(list) }
    }
}
