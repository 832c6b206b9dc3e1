//! Thin wrapper around the `yt-dlp` binary.
//!
//! Every call is a subprocess with a bounded lifetime. Metadata comes from
//! `-J`, downloads land in a caller-owned folder, and piped mode hands back
//! the child's stdout for relaying.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{config::Config, options::DownloadOptions};

const OUTPUT_TEMPLATE: &str = "%(title).140B [%(id)s].%(ext)s";
const PIPE_EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("{binary} is not installed or not on PATH")]
    NotInstalled { binary: String },
    #[error("the extractor did not finish within {seconds} seconds")]
    TimedOut { seconds: u64 },
    #[error("{message}")]
    Failed { message: String, detail: String },
    #[error("could not read media metadata: {0}")]
    InvalidMetadata(String),
    #[error("the downloaded file could not be found")]
    MissingOutput,
    #[error("the file exceeds the {} download limit", format_limit(.limit_bytes))]
    TooLarge { limit_bytes: u64 },
    #[error("extractor I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractorError {
    /// Whether another attempt, possibly with different headers, could succeed.
    pub fn is_transient(&self) -> bool {
        let ExtractorError::Failed { detail, .. } = self else {
            return false;
        };
        let lower = detail.to_ascii_lowercase();

        if lower.contains("unsupported url") || lower.contains("requested format is not available")
        {
            return false;
        }

        lower.contains("http error 403")
            || lower.contains("http error 429")
            || lower.contains("http error 5")
            || lower.contains("unable to download webpage")
            || lower.contains("connection reset")
            || lower.contains("timed out")
            || lower.contains("temporary failure")
    }

    pub(crate) fn from_stderr(stderr: &[u8]) -> Self {
        let detail = String::from_utf8_lossy(stderr)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .unwrap_or("the extractor could not complete the operation")
            .to_string();

        Self::Failed {
            message: friendly_message(&detail),
            detail,
        }
    }

    pub(crate) fn spawn_failed(binary: &Path, error: std::io::Error) -> Self {
        if error.kind() == ErrorKind::NotFound {
            Self::NotInstalled {
                binary: binary.display().to_string(),
            }
        } else {
            Self::Io(error)
        }
    }
}

fn format_limit(bytes: &u64) -> String {
    const MIB: u64 = 1_048_576;
    if *bytes >= MIB && bytes % MIB == 0 {
        format!("{} MB", bytes / MIB)
    } else {
        format!("{bytes} bytes")
    }
}

/// yt-dlp exits 0 without writing anything when `--max-filesize` rejects a
/// file. With `--quiet` the notice is usually suppressed too.
fn skipped_for_size(output: &Output) -> bool {
    [&output.stdout, &output.stderr]
        .iter()
        .any(|stream| String::from_utf8_lossy(stream).contains("larger than max-filesize"))
}

fn friendly_message(detail: &str) -> String {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        "Unsupported or invalid URL for download.".to_string()
    } else if lower.contains("http error 403") {
        "The media host refused the request (HTTP 403).".to_string()
    } else if lower.contains("http error 429") {
        "The media host is rate limiting requests (HTTP 429). Try again later.".to_string()
    } else if lower.contains("requested format is not available") {
        "The requested quality or format is not available for this URL.".to_string()
    } else {
        detail.trim_start_matches("ERROR:").trim().to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub ext: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
}

/// A running extractor or transcoder whose stdout is being relayed.
#[derive(Debug)]
pub struct PipedProcess {
    binary: PathBuf,
    child: Child,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl PipedProcess {
    pub(crate) fn spawn(mut command: Command, binary: &Path) -> Result<(Self, ChildStdout), ExtractorError> {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| ExtractorError::spawn_failed(binary, error))?;

        let stdout = child.stdout.take().ok_or(ExtractorError::MissingOutput)?;
        let stderr = child.stderr.take().map(collect_stderr);

        Ok((
            Self {
                binary: binary.to_path_buf(),
                child,
                stderr,
            },
            stdout,
        ))
    }

    /// Waits briefly for the process to exit and explains why it produced no data.
    /// `None` means it exited cleanly.
    pub async fn failure(&mut self) -> Option<ExtractorError> {
        let status = match timeout(PIPE_EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(error)) => return Some(ExtractorError::Io(error)),
            Err(_) => {
                warn!("{} did not exit after closing its output", self.binary.display());
                let _ = self.child.start_kill();
                return Some(ExtractorError::TimedOut {
                    seconds: PIPE_EXIT_GRACE.as_secs(),
                });
            }
        };

        if status.success() {
            return None;
        }

        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        Some(ExtractorError::from_stderr(&stderr))
    }
}

fn collect_stderr(mut stderr: ChildStderr) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Err(error) = stderr.read_to_end(&mut buffer).await {
            debug!("could not read subprocess stderr: {error}");
        }
        buffer
    })
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    ffmpeg_location: Option<PathBuf>,
    timeout: Duration,
    max_bytes: Option<u64>,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            ffmpeg_location: None,
            timeout,
            max_bytes: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg_location: config.ffmpeg_location.clone(),
            ..Self::new(&config.yt_dlp_bin, config.yt_dlp_timeout)
        }
        .with_max_bytes(config.max_download_bytes)
    }

    pub fn with_max_bytes(mut self, limit: Option<u64>) -> Self {
        self.max_bytes = limit;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn probe(&self, options: &DownloadOptions) -> Result<MediaInfo, ExtractorError> {
        self.probe_with(options.probe_args(), &options.url).await
    }

    /// Probes with the same format selection piped mode will use.
    pub async fn probe_pipe(&self, options: &DownloadOptions) -> Result<MediaInfo, ExtractorError> {
        self.probe_with(options.pipe_args(), &options.url).await
    }

    async fn probe_with(&self, mut args: Vec<String>, url: &str) -> Result<MediaInfo, ExtractorError> {
        args.extend(["-J".to_string(), "--skip-download".to_string()]);
        self.push_url(&mut args, url);

        let output = self.run(args).await?;
        serde_json::from_slice::<MediaInfo>(&output.stdout)
            .map_err(|error| ExtractorError::InvalidMetadata(error.to_string()))
    }

    pub async fn download(
        &self,
        options: &DownloadOptions,
        dir: &Path,
    ) -> Result<DownloadedFile, ExtractorError> {
        let mut args = options.extractor_args();
        self.push_common(&mut args);
        args.extend([
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            dir.join(OUTPUT_TEMPLATE).to_string_lossy().into_owned(),
        ]);
        self.push_url(&mut args, &options.url);

        let output = self.run(args).await?;
        if let Some(limit) = self.max_bytes
            && skipped_for_size(&output)
        {
            return Err(ExtractorError::TooLarge { limit_bytes: limit });
        }

        let printed_path = extract_printed_path(&output.stdout);
        let path = match resolve_downloaded_file(dir, printed_path.as_deref()).await {
            Err(ExtractorError::MissingOutput) if printed_path.is_none() => {
                return Err(match self.max_bytes {
                    Some(limit) => ExtractorError::TooLarge { limit_bytes: limit },
                    None => ExtractorError::MissingOutput,
                });
            }
            result => result?,
        };

        let size = tokio::fs::metadata(&path).await?.len();
        if let Some(limit) = self.max_bytes
            && size > limit
        {
            return Err(ExtractorError::TooLarge { limit_bytes: limit });
        }

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("download.{}", options.extension()));

        Ok(DownloadedFile {
            path,
            filename,
            size,
        })
    }

    /// Starts writing the selected stream to stdout without touching disk.
    pub fn spawn_pipe(
        &self,
        options: &DownloadOptions,
    ) -> Result<(PipedProcess, ChildStdout), ExtractorError> {
        let mut args = options.pipe_args();
        self.push_common(&mut args);
        args.extend(["-o".to_string(), "-".to_string()]);
        self.push_url(&mut args, &options.url);

        debug!("spawning {} {:?}", self.binary.display(), args);
        let mut command = Command::new(&self.binary);
        command.args(args).stdin(Stdio::null());
        PipedProcess::spawn(command, &self.binary)
    }

    fn push_common(&self, args: &mut Vec<String>) {
        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(location.to_string_lossy().into_owned());
        }
        if let Some(limit) = self.max_bytes {
            args.push("--max-filesize".to_string());
            args.push(limit.to_string());
        }
    }

    fn push_url(&self, args: &mut Vec<String>, url: &str) {
        args.push("--".to_string());
        args.push(url.to_string());
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, ExtractorError> {
        debug!("running {} {:?}", self.binary.display(), args);

        let command_future = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| ExtractorError::TimedOut {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|error| ExtractorError::spawn_failed(&self.binary, error))?;

        if !output.status.success() {
            return Err(ExtractorError::from_stderr(&output.stderr));
        }

        Ok(output)
    }
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

async fn resolve_downloaded_file(
    dir: &Path,
    printed_path: Option<&str>,
) -> Result<PathBuf, ExtractorError> {
    let canonical_dir = tokio::fs::canonicalize(dir).await?;

    if let Some(path_value) = printed_path {
        let path = PathBuf::from(path_value);
        if let Some(valid_path) = resolve_candidate(&canonical_dir, &path).await? {
            return Ok(valid_path);
        }

        if let Some(valid_path) = resolve_candidate(&canonical_dir, &dir.join(path_value)).await? {
            return Ok(valid_path);
        }
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_partial = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "part" | "ytdl" | "temp"));
        if is_partial {
            continue;
        }

        if let Some(valid_path) = resolve_candidate(&canonical_dir, &path).await? {
            return Ok(valid_path);
        }
    }

    Err(ExtractorError::MissingOutput)
}

async fn resolve_candidate(
    canonical_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, ExtractorError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate).await?;
    if !canonical_candidate.starts_with(canonical_dir) {
        warn!(
            "ignoring downloaded file outside its temp folder: {:?}",
            canonical_candidate
        );
        return Ok(None);
    }

    Ok(Some(canonical_candidate))
}
