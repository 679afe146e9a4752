use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scan lifecycle status.
///
/// `Finished` and `Failed` are terminal; the registry never transitions a
/// record out of a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScanStatus {
    Queued,
    Scanning,
    Finished,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Finished | ScanStatus::Failed)
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ScanStatus::Queued => "Queued",
            ScanStatus::Scanning => "Scanning",
            ScanStatus::Finished => "Finished",
            ScanStatus::Failed => "Failed",
        };
        write!(f, "{label}")
    }
}

/// Machine-readable failure classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanErrorCode {
    TrivyFailed,
    CloneFailed,
    DiskFull,
    ParseFailed,
    Timeout,
    Oom,
    Unknown,
}

/// A classified scan failure, surfaced to clients verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanError {
    pub code: ScanErrorCode,
    pub message: String,
}

impl ScanError {
    pub fn new(code: ScanErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// One CRITICAL vulnerability, already mapped from the scanner's report shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub id: String,
    pub package: String,
    pub installed_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_version: Option<String>,
    pub severity: String,
    pub title: String,
    pub description: String,
}

/// Complete scan state as held by the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub scan_id: String,
    pub repo_url: String,
    pub status: ScanStatus,
    pub vulnerabilities: Vec<Vulnerability>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScanError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanRecord {
    pub(crate) fn new(scan_id: &str, repo_url: &str) -> Self {
        let now = Utc::now();
        Self {
            scan_id: scan_id.to_string(),
            repo_url: repo_url.to_string(),
            status: ScanStatus::Queued,
            vulnerabilities: Vec::new(),
            truncated: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A unit of queued work. Owned by the queue until dispatched, then by the
/// worker manager until settled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub scan_id: String,
    pub repo_url: String,
}
