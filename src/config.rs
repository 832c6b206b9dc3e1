use std::{collections::HashSet, path::PathBuf, time::Duration};

use url::Url;

use crate::error::ApiError;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_JOB_RETENTION_SECONDS: u64 = 20 * 60;
const DEFAULT_MAX_JOBS: usize = 256;
const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 750;

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub yt_dlp_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub ffmpeg_location: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub yt_dlp_timeout: Duration,
    pub max_download_bytes: Option<u64>,
    pub job_retention: Duration,
    pub max_jobs: usize,
    pub retry_max_attempts: usize,
    pub retry_backoff: Duration,
    /// `None` allows any origin.
    pub allowed_origins: Option<HashSet<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            yt_dlp_bin: PathBuf::from("yt-dlp"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffmpeg_location: None,
            work_dir: std::env::temp_dir().join("direct-downloader"),
            static_dir: PathBuf::from("static"),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            yt_dlp_timeout: Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            max_download_bytes: None,
            job_retention: Duration::from_secs(DEFAULT_JOB_RETENTION_SECONDS),
            max_jobs: DEFAULT_MAX_JOBS,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            allowed_origins: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ApiError> {
        let defaults = Self::default();

        let allowed_origins = match read_string_env("ALLOWED_ORIGINS") {
            Some(value) => Some(parse_allowed_origins(&value)?),
            None => None,
        };

        Ok(Self {
            bind_addr: resolve_bind_addr(),
            yt_dlp_bin: read_path_env("YT_DLP_BIN").unwrap_or(defaults.yt_dlp_bin),
            ffmpeg_bin: read_path_env("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
            ffmpeg_location: read_path_env("FFMPEG_LOCATION"),
            work_dir: read_path_env("WORK_DIR").unwrap_or(defaults.work_dir),
            static_dir: read_path_env("STATIC_DIR").unwrap_or(defaults.static_dir),
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_concurrent_downloads),
            yt_dlp_timeout: read_u64_env("YT_DLP_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.yt_dlp_timeout),
            max_download_bytes: read_u64_env("MAX_DOWNLOAD_BYTES").filter(|value| *value > 0),
            job_retention: read_u64_env("JOB_RETENTION_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_retention),
            max_jobs: read_usize_env("MAX_JOBS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_jobs),
            retry_max_attempts: read_usize_env("RETRY_MAX_ATTEMPTS")
                .map(|value| value.max(1))
                .unwrap_or(defaults.retry_max_attempts),
            retry_backoff: read_u64_env("RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            allowed_origins,
        })
    }
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_path_env(name: &str) -> Option<PathBuf> {
    read_string_env(name).map(PathBuf::from)
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

fn parse_allowed_origins(value: &str) -> Result<HashSet<String>, ApiError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect()
}

pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
