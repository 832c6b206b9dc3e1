use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::body::Body;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{Instant, timeout_at},
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{
    config::Config,
    delivery::{media_filename, pipe_body},
    error::ApiError,
    extractor::{DownloadedFile, ExtractorError, MediaInfo, PipedProcess, YtDlp},
    options::DownloadOptions,
    retry::RetryPolicy,
    transcode::{AudioPipeFormat, spawn_transcoder},
};

const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A body that relays a subprocess pipeline, plus the name to send it under.
pub struct MediaStream {
    pub filename: String,
    pub body: Body,
}

/// Holds the pipeline's processes and permit until the body is dropped.
struct PipeGuard {
    _processes: Vec<PipedProcess>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct Downloader {
    ytdlp: YtDlp,
    ffmpeg_bin: PathBuf,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    work_dir: PathBuf,
}

impl Downloader {
    pub fn new(
        ytdlp: YtDlp,
        ffmpeg_bin: PathBuf,
        retry: RetryPolicy,
        max_concurrent: usize,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            ytdlp,
            ffmpeg_bin,
            retry,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            work_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            YtDlp::from_config(config),
            config.ffmpeg_bin.clone(),
            RetryPolicy::new(config.retry_max_attempts, config.retry_backoff),
            config.max_concurrent_downloads,
            config.work_dir.clone(),
        )
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ApiError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ApiError::internal("Could not reserve download capacity."))
    }

    pub async fn probe(&self, options: &DownloadOptions) -> Result<MediaInfo, ApiError> {
        let info = self
            .retry
            .run(options, |attempt| async move { self.ytdlp.probe(&attempt).await })
            .await?;
        Ok(info)
    }

    /// Downloads into a fresh temp folder. The folder is removed when the
    /// returned `TempDir` is dropped.
    pub async fn download(
        &self,
        options: &DownloadOptions,
    ) -> Result<(TempDir, DownloadedFile), ApiError> {
        let dir = self.create_temp_dir()?;
        let dir_path = dir.path().to_path_buf();

        let file = self
            .retry
            .run(options, |attempt| {
                let dir_path = dir_path.clone();
                async move { self.ytdlp.download(&attempt, &dir_path).await }
            })
            .await?;

        info!(
            "downloaded {:?} ({} bytes) for {:?}",
            file.filename, file.size, options.url
        );
        Ok((dir, file))
    }

    /// Pipes the extractor's stdout, through ffmpeg for audio, without
    /// touching disk. Waits for the first chunk so early failures surface as
    /// errors instead of an empty body. The whole relay shares one timeout.
    pub async fn open_stream(&self, options: &DownloadOptions) -> Result<MediaStream, ApiError> {
        let permit = self.acquire().await?;

        let info = self
            .retry
            .run(options, |attempt| async move { self.ytdlp.probe_pipe(&attempt).await })
            .await?;
        let extension = if options.is_audio() {
            options.extension().to_string()
        } else {
            info.ext
                .clone()
                .filter(|ext| !ext.trim().is_empty())
                .unwrap_or_else(|| options.extension().to_string())
        };
        let filename = media_filename(&info, &extension);

        let now = Instant::now();
        let deadline = now.checked_add(self.ytdlp.timeout()).unwrap_or(now + FAR_FUTURE);
        let (extractor, extractor_stdout) = self.ytdlp.spawn_pipe(options)?;
        let mut processes = vec![extractor];
        let stdout = match AudioPipeFormat::for_output(options.output) {
            Some(format) => {
                let (transcoder, transcoder_stdout) = spawn_transcoder(
                    &self.ffmpeg_bin,
                    extractor_stdout,
                    format,
                    options.audio_bitrate_kbps,
                )?;
                processes.push(transcoder);
                transcoder_stdout
            }
            None => extractor_stdout,
        };

        let mut reader = ReaderStream::new(stdout);
        let first = timeout_at(deadline, reader.next())
            .await
            .map_err(|_| ExtractorError::TimedOut {
                seconds: self.ytdlp.timeout().as_secs(),
            })?;

        match first {
            Some(Ok(chunk)) => {
                info!("streaming {:?} for {:?}", filename, options.url);
                let guard = PipeGuard {
                    _processes: processes,
                    _permit: permit,
                };
                Ok(MediaStream {
                    filename,
                    body: pipe_body(chunk, reader, deadline, guard),
                })
            }
            Some(Err(error)) => Err(ExtractorError::Io(error).into()),
            None => Err(pipeline_failure(processes).await.into()),
        }
    }

    fn create_temp_dir(&self) -> Result<TempDir, ApiError> {
        tempfile::Builder::new()
            .prefix("dl-")
            .tempdir_in(&self.work_dir)
            .map_err(|error| {
                ApiError::internal(format!("Could not prepare a temporary folder: {error}"))
            })
    }
}

/// Picks the stage that explains the empty output. A broken pipe only means
/// the next stage went away first.
async fn pipeline_failure(processes: Vec<PipedProcess>) -> ExtractorError {
    let mut failures = Vec::new();
    for mut process in processes {
        if let Some(error) = process.failure().await {
            failures.push(error);
        }
    }

    let root_cause = failures
        .iter()
        .position(|error| !error.to_string().to_ascii_lowercase().contains("broken pipe"))
        .unwrap_or(0);
    if root_cause < failures.len() {
        return failures.swap_remove(root_cause);
    }

    warn!("stream pipeline exited cleanly without producing output");
    ExtractorError::MissingOutput
}
