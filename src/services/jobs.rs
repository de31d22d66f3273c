//! Job bookkeeping: upload storage, background runs, artifact lifetime.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::pipeline::Pipeline;
use super::progress::ProgressBus;
use crate::models::Stage;

/// Lifetime settings for job artifacts.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Directory holding uploads and outputs.
    pub tmp_dir: PathBuf,
    /// How long live progress streams stay open after a job finishes.
    pub progress_grace: Duration,
    /// How long an unclaimed output is kept.
    pub artifact_ttl: Duration,
}

#[derive(Debug, Clone)]
struct JobRecord {
    upload: PathBuf,
    output: Option<PathBuf>,
}

/// Generate a unique job identifier, e.g. `excel_1718000000000_k3j9x0a1b`.
pub fn new_job_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("excel_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// Runs uploaded workbooks through the pipeline and tracks their artifacts.
#[derive(Clone)]
pub struct JobManager {
    pipeline: Pipeline,
    options: Arc<JobOptions>,
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl JobManager {
    pub fn new(pipeline: Pipeline, options: JobOptions) -> Self {
        Self {
            pipeline,
            options: Arc::new(options),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn bus(&self) -> &ProgressBus {
        self.pipeline.bus()
    }

    /// Store an upload and start processing it in the background.
    ///
    /// Returns the job id immediately.
    pub async fn submit(&self, upload: &[u8]) -> std::io::Result<String> {
        tokio::fs::create_dir_all(&self.options.tmp_dir).await?;

        let job_id = new_job_id();
        let upload_path = self
            .options
            .tmp_dir
            .join(format!("upload_{}.xlsx", job_id));
        tokio::fs::write(&upload_path, upload).await?;

        self.jobs.write().await.insert(
            job_id.clone(),
            JobRecord {
                upload: upload_path.clone(),
                output: None,
            },
        );
        self.bus().publish(
            &job_id,
            Stage::Uploaded,
            "file uploaded, processing started",
            5,
        );
        info!("Accepted upload {} ({} bytes)", job_id, upload.len());

        let manager = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move { manager.run(id, upload_path).await });

        Ok(job_id)
    }

    async fn run(&self, job_id: String, upload: PathBuf) {
        let output = self
            .options
            .tmp_dir
            .join(format!("output_{}.xlsx", job_id));

        // Record the output before `complete` goes out so a download request
        // triggered by that event always finds it.
        let result = self.pipeline.convert_file(&job_id, &upload, &output).await;
        match &result {
            Ok(_) => {
                if let Some(record) = self.jobs.write().await.get_mut(&job_id) {
                    record.output = Some(output);
                }
            }
            Err(_) => {
                self.jobs.write().await.remove(&job_id);
                remove_artifact(&upload).await;
            }
        }
        let _ = self.pipeline.finish(&job_id, result);

        self.schedule_teardown(job_id);
    }

    /// Close live streams after the grace period, then drop everything left
    /// once the artifact TTL runs out.
    fn schedule_teardown(&self, job_id: String) {
        let manager = self.clone();
        let grace = self.options.progress_grace;
        let remaining = self.options.artifact_ttl.saturating_sub(grace);

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.bus().close_subscribers(&job_id);

            // Failed jobs have no artifacts left to wait for.
            if !manager.jobs.read().await.contains_key(&job_id) {
                manager.bus().remove(&job_id);
                return;
            }

            tokio::time::sleep(remaining).await;
            if manager.discard(&job_id).await {
                info!("Expired unclaimed output for {}", job_id);
            }
        });
    }

    /// Read a completed job's output and tear the job down.
    ///
    /// The job is claimed under the write lock before its file is read, so of
    /// several concurrent callers exactly one gets the bytes. Returns `None`
    /// if the job is unknown, unfinished, already taken, or its file is gone.
    pub async fn take_output(&self, job_id: &str) -> Option<Vec<u8>> {
        let record = {
            let mut jobs = self.jobs.write().await;
            if jobs.get(job_id)?.output.is_none() {
                return None;
            }
            jobs.remove(job_id)?
        };
        self.bus().remove(job_id);

        let output = record.output.as_deref()?;
        let bytes = tokio::fs::read(output).await;
        remove_artifact(&record.upload).await;
        remove_artifact(output).await;
        debug!("Handed out output for {}", job_id);

        match bytes {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Output for {} unreadable: {}", job_id, e);
                None
            }
        }
    }

    /// Delete a job's artifacts and progress record. Returns whether any job
    /// bookkeeping existed.
    pub async fn discard(&self, job_id: &str) -> bool {
        let record = self.jobs.write().await.remove(job_id);
        self.bus().remove(job_id);

        let Some(record) = record else {
            return false;
        };
        remove_artifact(&record.upload).await;
        if let Some(output) = &record.output {
            remove_artifact(output).await;
        }
        debug!("Discarded job {}", job_id);
        true
    }

    pub async fn is_complete(&self, job_id: &str) -> bool {
        self.jobs
            .read()
            .await
            .get(job_id)
            .is_some_and(|r| r.output.is_some())
    }
}

async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
    }
}
