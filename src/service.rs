//! Composition root: wires the registry, queue and worker manager together
//! and implements the façade collaborator contract (`start_scan`,
//! `get_scan`, shutdown) plus repository URL validation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::manager::WorkerManager;
use crate::queue::JobQueue;
use crate::registry::ScanRegistry;
use crate::types::{Job, ScanError, ScanErrorCode, ScanStatus, Vulnerability};

/// Outcome of a scan request at admission time.
#[derive(Debug, Clone, PartialEq)]
pub enum StartScanOutcome {
    Queued { scan_id: String },
    /// The queue is at capacity; the caller should retry after the hint.
    Rejected {
        scan_id: String,
        retry_after: Duration,
    },
}

/// Client-facing projection of a scan record: vulnerabilities and the
/// truncation flag are only present once the scan finished, the error only
/// when it failed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanView {
    pub scan_id: String,
    pub repo_url: String,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<Vec<Vulnerability>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScanError>,
}

pub struct ScanService {
    registry: Arc<ScanRegistry>,
    queue: Arc<JobQueue>,
    manager: Arc<WorkerManager>,
    retry_after: Duration,
}

impl ScanService {
    /// Wire the queue's processor to the manager and install the guard that
    /// marks a job `Unknown` if dispatch ever fails synchronously.
    pub fn new(
        registry: Arc<ScanRegistry>,
        queue: Arc<JobQueue>,
        manager: Arc<WorkerManager>,
        retry_after: Duration,
    ) -> Arc<Self> {
        {
            let registry = Arc::clone(&registry);
            queue.set_failure_handler(Arc::new(move |job: &Job, err| {
                registry.set_error(
                    &job.scan_id,
                    ScanError::new(
                        ScanErrorCode::Unknown,
                        format!("Worker process error: {err}"),
                    ),
                );
            }));
        }
        {
            let manager = Arc::clone(&manager);
            queue.set_processor(Arc::new(move |job: Job| {
                Arc::clone(&manager).run_job(job);
                Ok(())
            }));
        }

        Arc::new(Self {
            registry,
            queue,
            manager,
            retry_after,
        })
    }

    /// Admit a new scan: create the record, then enqueue. An admission
    /// failure is recorded on the scan itself so clients polling the id see
    /// why nothing ever ran.
    pub fn start_scan(&self, repo_url: &str) -> Result<StartScanOutcome> {
        let scan_id = Uuid::new_v4().to_string();
        self.registry.create(&scan_id, repo_url)?;

        let admitted = self.queue.enqueue(Job {
            scan_id: scan_id.clone(),
            repo_url: repo_url.to_string(),
        });
        if !admitted {
            self.registry
                .set_error(&scan_id, ScanError::new(ScanErrorCode::Unknown, "Queue is full"));
            return Ok(StartScanOutcome::Rejected {
                scan_id,
                retry_after: self.retry_after,
            });
        }

        tracing::info!(%scan_id, repo_url, "scan queued");
        Ok(StartScanOutcome::Queued { scan_id })
    }

    pub fn get_scan(&self, scan_id: &str) -> Option<ScanView> {
        let record = self.registry.get(scan_id)?;
        let finished = record.status == ScanStatus::Finished;
        Some(ScanView {
            scan_id: record.scan_id,
            repo_url: record.repo_url,
            status: record.status,
            created_at: record.created_at,
            updated_at: record.updated_at,
            vulnerabilities: finished.then_some(record.vulnerabilities),
            truncated: finished.then_some(record.truncated),
            error: record.error,
        })
    }

    pub fn registry(&self) -> &ScanRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn live_workers(&self) -> usize {
        self.manager.live_workers()
    }

    /// Drain live workers: polite first, forceful after the grace period.
    pub async fn shutdown(&self, grace: Duration) {
        self.manager.shutdown_workers(grace).await;
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum UrlError {
    #[error("repository URL does not parse: {0}")]
    Unparseable(String),
    #[error("repository URL must use https")]
    NotHttps,
    #[error("repository host must be github.com")]
    WrongHost,
    #[error("repository URL must not carry credentials")]
    HasUserinfo,
    #[error("repository path must name an owner and a repository")]
    BadPath,
}

/// Validate a repository URL before anything touches the registry: https
/// only, github.com only, no userinfo, at least owner + repository in the
/// path.
pub fn validate_repo_url(raw: &str) -> Result<Url, UrlError> {
    let url = Url::parse(raw).map_err(|err| UrlError::Unparseable(err.to_string()))?;

    if url.scheme() != "https" {
        return Err(UrlError::NotHttps);
    }
    if url.host_str() != Some("github.com") {
        return Err(UrlError::WrongHost);
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlError::HasUserinfo);
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
        .unwrap_or_default();
    if segments.len() < 2 {
        return Err(UrlError::BadPath);
    }

    Ok(url)
}
