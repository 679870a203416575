use crate::cache::CacheStore;
use crate::config::Config;
use crate::job::Job;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{source_path} {status}")]
    UpstreamStatus {
        source_path: String,
        status: StatusCode,
    },
    #[error("download {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("store master file: {0}")]
    Io(#[from] std::io::Error),
}

/// Master image download definition, derived from a `Job` and executed
/// at most once per job.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub source_url: Url,
    pub source_path: String,
    pub target_dir: PathBuf,
    pub target_filename: String,
}

impl DownloadJob {
    pub fn from_job(job: &Job, cache: &CacheStore) -> Self {
        Self {
            source_url: job.source_url.clone(),
            source_path: job.source_path.clone(),
            target_dir: cache.master_dir.clone(),
            target_filename: crate::cache::master_filename(&job.source_path),
        }
    }

    pub fn target_path(&self) -> PathBuf {
        self.target_dir.join(&self.target_filename)
    }
}

/// Fetches masters from the upstream source. One shared client with a
/// bounded per-host connection pool; downloads are whole-body, not
/// streamed. Two concurrent downloads of the same source path both run;
/// the atomic store means the second rename simply replaces the first
/// complete file.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    cache: CacheStore,
}

impl Downloader {
    pub fn new(config: &Config, cache: CacheStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .pool_max_idle_per_host(config.max_download_conns_per_host)
            .user_agent(concat!("imageserver/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build download client")?;
        Ok(Self { client, cache })
    }

    /// Fetch the master image. On success the full body sits at the
    /// target path; on any failure nothing is left behind, not even a
    /// truncated file.
    pub async fn process(&self, job: &DownloadJob) -> Result<(), DownloadError> {
        let response = self
            .client
            .get(job.source_url.clone())
            .send()
            .await
            .map_err(|source| DownloadError::Transport {
                url: job.source_url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::UpstreamStatus {
                source_path: job.source_path.clone(),
                status,
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| DownloadError::Transport {
                url: job.source_url.to_string(),
                source,
            })?;
        self.cache.store_file(&job.target_path(), &body).await?;
        debug!(source_path = %job.source_path, bytes = body.len(), "master downloaded");
        Ok(())
    }
}
