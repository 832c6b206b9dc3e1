//! Background downloads tracked in memory.
//!
//! Each job owns its temp folder through a `TempDir`, so removing a job from
//! the map (explicitly or by the sweeper) also deletes its file. Removed jobs
//! are dropped on the blocking pool, never under the lock.

use std::{collections::HashMap, io::ErrorKind, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::TempDir;
use tokio::{fs::File, sync::Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    downloader::Downloader,
    error::ApiError,
    extractor::DownloadedFile,
    options::{DownloadOptions, OutputType},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum JobState {
    Queued,
    Running,
    Completed { dir: TempDir, file: DownloadedFile },
    Failed { error: String },
}

impl JobState {
    fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    pub output: OutputType,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub status: &'static str,
    pub url: String,
    pub output_type: OutputType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let (filename, size, error) = match &job.state {
            JobState::Completed { file, .. } => (Some(file.filename.clone()), Some(file.size), None),
            JobState::Failed { error } => (None, None, Some(error.clone())),
            JobState::Queued | JobState::Running => (None, None, None),
        };

        Self {
            id: job.id,
            status: job.state.label(),
            url: job.url.clone(),
            output_type: job.output,
            filename,
            size,
            error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// A completed job's file, opened while the job was still held.
#[derive(Debug)]
pub struct CompletedFile {
    pub file: File,
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
    retention: Duration,
    max_jobs: usize,
}

impl JobStore {
    pub fn new(retention: Duration, max_jobs: usize) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            retention,
            max_jobs: max_jobs.max(1),
        }
    }

    pub async fn submit(
        &self,
        options: DownloadOptions,
        downloader: Arc<Downloader>,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        {
            let mut jobs = self.jobs.lock().await;
            discard(sweep_locked(&mut jobs, now, self.retention));
            if jobs.len() >= self.max_jobs {
                return Err(ApiError::unavailable(
                    "Too many downloads in progress. Try again later.",
                ));
            }

            jobs.insert(
                id,
                Job {
                    id,
                    url: options.url.clone(),
                    output: options.output,
                    state: JobState::Queued,
                    created_at: now,
                    updated_at: now,
                },
            );
        }

        let store = self.clone();
        tokio::spawn(async move {
            store.execute(id, options, downloader).await;
        });

        info!("queued job {id}");
        Ok(id)
    }

    async fn execute(&self, id: Uuid, options: DownloadOptions, downloader: Arc<Downloader>) {
        let _permit = match downloader.acquire().await {
            Ok(permit) => permit,
            Err(error) => {
                self.finish(id, JobState::Failed { error: error.message }).await;
                return;
            }
        };

        if !self.transition(id, JobState::Running).await {
            info!("job {id} was removed before it started");
            return;
        }

        let state = match downloader.download(&options).await {
            Ok((dir, file)) => JobState::Completed { dir, file },
            Err(error) => {
                warn!("job {id} failed: {}", error.message);
                JobState::Failed {
                    error: error.message,
                }
            }
        };
        self.finish(id, state).await;
    }

    async fn transition(&self, id: Uuid, state: JobState) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) => {
                job.state = state;
                job.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    async fn finish(&self, id: Uuid, state: JobState) {
        let label = state.label();
        if self.transition(id, state).await {
            info!("job {id} {label}");
        }
    }

    pub async fn status(&self, id: Uuid) -> Option<JobView> {
        self.jobs.lock().await.get(&id).map(JobView::from)
    }

    pub async fn completed_file(&self, id: Uuid) -> Result<CompletedFile, ApiError> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(&id)
            .ok_or_else(|| ApiError::not_found(format!("Unknown job {id}.")))?;

        match &job.state {
            JobState::Completed { file, .. } => {
                let opened = File::open(&file.path).await.map_err(|error| {
                    if error.kind() == ErrorKind::NotFound {
                        ApiError::not_found(format!("The file for job {id} is gone."))
                    } else {
                        ApiError::internal(format!("Could not open the downloaded file: {error}"))
                    }
                })?;

                Ok(CompletedFile {
                    file: opened,
                    filename: file.filename.clone(),
                    size: file.size,
                })
            }
            JobState::Failed { error } => Err(ApiError::internal(error.clone())),
            JobState::Queued | JobState::Running => {
                Err(ApiError::conflict(format!("Job {id} is not finished yet.")))
            }
        }
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.jobs.lock().await.remove(&id);
        match removed {
            Some(job) => {
                discard(vec![job]);
                true
            }
            None => false,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired = sweep_locked(&mut *self.jobs.lock().await, now, self.retention);
        let count = expired.len();
        discard(expired);
        count
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub fn spawn_sweeper(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let removed = store.sweep(Utc::now()).await;
                if removed > 0 {
                    info!("expired {removed} finished job(s)");
                }
            }
        });
    }
}

fn sweep_locked(jobs: &mut HashMap<Uuid, Job>, now: DateTime<Utc>, retention: Duration) -> Vec<Job> {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let expired: Vec<Uuid> = jobs
        .values()
        .filter(|job| job.state.is_finished() && now - job.updated_at >= retention)
        .map(|job| job.id)
        .collect();

    expired.iter().filter_map(|id| jobs.remove(id)).collect()
}

/// Dropping a completed job deletes its folder with blocking I/O.
fn discard(jobs: Vec<Job>) {
    if jobs.is_empty() {
        return;
    }

    tokio::task::spawn_blocking(move || drop(jobs));
}
