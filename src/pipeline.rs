use crate::downloader::{DownloadError, DownloadJob};
use crate::job::Job;
use crate::state::AppState;
use crate::transform::TransformError;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("read or write cache entry: {0}")]
    Io(#[from] std::io::Error),
    #[error("processing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("processing deadline exceeded")]
    Timeout,
}

/// Run one request through the pipeline and return the result-cache
/// path to serve. A result-cache hit returns immediately; a miss is
/// bounded by the configured deadline. On deadline expiry the caller
/// gets `Timeout` while the in-flight work keeps running and fills the
/// cache for later requests.
pub async fn process(state: &AppState, job: Job) -> Result<PathBuf, PipelineError> {
    let result_path = state.cache.result_path(job.fingerprint());
    if state.cache.is_cached(&result_path).await {
        return Ok(result_path);
    }
    match tokio::time::timeout(state.config.request_timeout, populate_result(state, job)).await {
        Ok(outcome) => outcome.map(|_| result_path),
        Err(_) => Err(PipelineError::Timeout),
    }
}

/// Miss path. One leader per fingerprint does the work in a detached
/// task; concurrent requests for the same fingerprint wait for that
/// task instead of duplicating the download and transform. A timed-out
/// caller abandons only its wait, never the task.
async fn populate_result(state: &AppState, job: Job) -> Result<(), PipelineError> {
    let result_path = state.cache.result_path(job.fingerprint());
    loop {
        let permit = state.singleflight.acquire(job.fingerprint());
        if permit.is_leader() {
            let task_state = state.clone();
            let task_job = job.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let outcome = execute(&task_state, &task_job).await;
                if let Err(err) = &outcome {
                    warn!(
                        source_path = %task_job.source_path,
                        fingerprint = %task_job.fingerprint(),
                        error = %err,
                        "pipeline task failed"
                    );
                }
                outcome
            });
            return handle.await.map_err(PipelineError::Task)?;
        }
        permit.wait_result(state.config.request_timeout).await;
        if state.cache.is_cached(&result_path).await {
            return Ok(());
        }
        // Leader failed or the wake-up raced its completion; contend
        // for leadership and run the pipeline ourselves.
    }
}

/// CHECK_MASTER_CACHE -> DOWNLOAD -> TRANSFORM -> WRITE_RESULT.
async fn execute(state: &AppState, job: &Job) -> Result<(), PipelineError> {
    let result_path = state.cache.result_path(job.fingerprint());
    if state.cache.is_cached(&result_path).await {
        return Ok(());
    }

    let download = DownloadJob::from_job(job, &state.cache);
    let master_path = download.target_path();
    if !state.cache.is_cached(&master_path).await {
        state.downloader.process(&download).await?;
    }

    let master = tokio::fs::read(&master_path).await?;
    let transformer = state.transformer.clone();
    let params = job.params;
    let output = tokio::task::spawn_blocking(move || transformer.transform(&master, &params))
        .await
        .map_err(PipelineError::Task)??;

    state.cache.store_file(&result_path, &output).await?;
    Ok(())
}
