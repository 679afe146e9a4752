use anyhow::{bail, Result};
use chrono::Utc;
use indexmap::IndexMap;
use std::sync::Mutex;

use crate::types::{ScanError, ScanRecord, ScanStatus, Vulnerability};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_entries: usize,
    pub max_vulns_per_scan: usize,
}

/// Process-local store of scan records.
///
/// Entries are kept in insertion order, which doubles as the eviction order:
/// the registry tracks no last-access time, so oldest-first is the LRU proxy.
/// All state lives behind one mutex; operations are short and never await.
pub struct ScanRegistry {
    config: RegistryConfig,
    records: Mutex<IndexMap<String, ScanRecord>>,
}

impl ScanRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            records: Mutex::new(IndexMap::new()),
        }
    }

    /// Insert a fresh `Queued` record, evicting first if the registry is at
    /// capacity. A duplicate scan id is refused rather than overwritten.
    pub fn create(&self, scan_id: &str, repo_url: &str) -> Result<ScanRecord> {
        let mut records = self.records.lock().unwrap();
        Self::evict(&mut records, self.config.max_entries);

        if records.contains_key(scan_id) {
            bail!("duplicate scan id {scan_id}");
        }

        let record = ScanRecord::new(scan_id, repo_url);
        records.insert(scan_id.to_string(), record.clone());
        Ok(record)
    }

    pub fn get(&self, scan_id: &str) -> Option<ScanRecord> {
        self.records.lock().unwrap().get(scan_id).cloned()
    }

    /// Set the status of a record. No-op for unknown ids; refuses to move a
    /// record out of a terminal state.
    pub fn update_status(&self, scan_id: &str, status: ScanStatus) {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(scan_id) else {
            return;
        };
        if record.status.is_terminal() {
            tracing::debug!(scan_id, %status, "ignoring status update for terminal record");
            return;
        }
        record.status = status;
        record.updated_at = Utc::now();
    }

    /// Append vulnerabilities up to the per-scan cap, preserving incoming
    /// order. Anything past the cap is discarded and flips `truncated`.
    pub fn append_vulnerabilities(&self, scan_id: &str, vulns: Vec<Vulnerability>) {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(scan_id) else {
            return;
        };

        let remaining = self
            .config
            .max_vulns_per_scan
            .saturating_sub(record.vulnerabilities.len());
        if remaining == 0 {
            if !vulns.is_empty() {
                record.truncated = true;
            }
            return;
        }

        if vulns.len() > remaining {
            record.truncated = true;
        }
        let accepted = vulns.into_iter().take(remaining).collect::<Vec<_>>();
        if !accepted.is_empty() {
            record.vulnerabilities.extend(accepted);
            record.updated_at = Utc::now();
        }
    }

    /// Record a failure: overwrites any previous error and forces the status
    /// to `Failed`. No-op for unknown ids and for records that already
    /// finished successfully (terminal safety).
    pub fn set_error(&self, scan_id: &str, error: ScanError) {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(scan_id) else {
            return;
        };
        if record.status == ScanStatus::Finished {
            tracing::debug!(scan_id, "ignoring error for finished record");
            return;
        }
        record.error = Some(error);
        record.status = ScanStatus::Failed;
        record.updated_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status counts for telemetry and CLI output.
    pub fn stats(&self) -> RegistryStats {
        let records = self.records.lock().unwrap();
        let mut stats = RegistryStats {
            total: records.len(),
            ..Default::default()
        };
        for record in records.values() {
            match record.status {
                ScanStatus::Queued => stats.queued += 1,
                ScanStatus::Scanning => stats.scanning += 1,
                ScanStatus::Finished => stats.finished += 1,
                ScanStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Make room for one insertion. Terminal records go first, oldest first;
    /// if none are left and the registry is still at capacity, the oldest
    /// record goes regardless of status. Evicting an in-flight scan does not
    /// cancel its worker; that worker's later IPC finds no record and is
    /// dropped by the mutators above.
    fn evict(records: &mut IndexMap<String, ScanRecord>, max_entries: usize) {
        while records.len() >= max_entries {
            let victim = records
                .iter()
                .find(|(_, record)| record.status.is_terminal())
                .map(|(id, _)| id.clone())
                .or_else(|| records.keys().next().cloned());

            match victim {
                Some(id) => {
                    tracing::debug!(scan_id = %id, "evicting scan record");
                    records.shift_remove(&id);
                }
                None => break,
            }
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub queued: usize,
    pub scanning: usize,
    pub finished: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScanErrorCode;

    fn registry(max_entries: usize, max_vulns: usize) -> ScanRegistry {
        ScanRegistry::new(RegistryConfig {
            max_entries,
            max_vulns_per_scan: max_vulns,
        })
    }

    fn vuln(id: &str) -> Vulnerability {
        Vulnerability {
            id: id.to_string(),
            package: "pkg".to_string(),
            installed_version: "1.0.0".to_string(),
            fixed_version: None,
            severity: "CRITICAL".to_string(),
            title: String::new(),
            description: String::new(),
        }
    }

    #[test]
    fn create_starts_queued_and_empty() {
        let reg = registry(10, 10);
        let record = reg.create("s1", "https://github.com/owner/repo").unwrap();
        assert_eq!(record.status, ScanStatus::Queued);
        assert!(record.vulnerabilities.is_empty());
        assert!(!record.truncated);
        assert!(record.error.is_none());
        assert!(record.created_at <= record.updated_at);
    }

    #[test]
    fn duplicate_create_is_refused() {
        let reg = registry(10, 10);
        reg.create("s1", "https://github.com/owner/repo").unwrap();
        assert!(reg.create("s1", "https://github.com/owner/other").is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn status_transitions_stop_at_terminal() {
        let reg = registry(10, 10);
        reg.create("s1", "url").unwrap();
        reg.update_status("s1", ScanStatus::Scanning);
        reg.update_status("s1", ScanStatus::Finished);
        assert_eq!(reg.get("s1").unwrap().status, ScanStatus::Finished);

        // Terminal records never move again.
        reg.update_status("s1", ScanStatus::Scanning);
        assert_eq!(reg.get("s1").unwrap().status, ScanStatus::Finished);
        reg.set_error("s1", ScanError::new(ScanErrorCode::Unknown, "late"));
        assert_eq!(reg.get("s1").unwrap().status, ScanStatus::Finished);
        assert!(reg.get("s1").unwrap().error.is_none());
    }

    #[test]
    fn failed_without_error_is_a_transient_state() {
        // update_status(Failed) is permitted without a payload; a later
        // set_error fills the error in.
        let reg = registry(10, 10);
        reg.create("s1", "url").unwrap();
        reg.update_status("s1", ScanStatus::Failed);
        let record = reg.get("s1").unwrap();
        assert_eq!(record.status, ScanStatus::Failed);
        assert!(record.error.is_none());

        reg.set_error("s1", ScanError::new(ScanErrorCode::Timeout, "late detail"));
        let record = reg.get("s1").unwrap();
        assert_eq!(record.status, ScanStatus::Failed);
        assert_eq!(record.error.unwrap().code, ScanErrorCode::Timeout);
    }

    #[test]
    fn set_error_is_idempotent() {
        let reg = registry(10, 10);
        reg.create("s1", "url").unwrap();
        let error = ScanError::new(ScanErrorCode::CloneFailed, "boom");
        reg.set_error("s1", error.clone());
        let first = reg.get("s1").unwrap();
        reg.set_error("s1", error);
        let second = reg.get("s1").unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(first.error, second.error);
        assert!(first.updated_at <= second.updated_at);
    }

    #[test]
    fn mutators_ignore_unknown_ids() {
        let reg = registry(10, 10);
        reg.update_status("ghost", ScanStatus::Scanning);
        reg.append_vulnerabilities("ghost", vec![vuln("CVE-1")]);
        reg.set_error("ghost", ScanError::new(ScanErrorCode::Unknown, "x"));
        assert!(reg.is_empty());
    }

    #[test]
    fn append_respects_cap_and_marks_truncation() {
        let reg = registry(10, 3);
        reg.create("s1", "url").unwrap();
        reg.append_vulnerabilities("s1", vec![vuln("CVE-1"), vuln("CVE-2")]);
        let record = reg.get("s1").unwrap();
        assert_eq!(record.vulnerabilities.len(), 2);
        assert!(!record.truncated);

        reg.append_vulnerabilities("s1", vec![vuln("CVE-3"), vuln("CVE-4"), vuln("CVE-5")]);
        let record = reg.get("s1").unwrap();
        let ids: Vec<&str> = record.vulnerabilities.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, ["CVE-1", "CVE-2", "CVE-3"]);
        assert!(record.truncated);

        // Once full, further appends only re-confirm truncation.
        reg.append_vulnerabilities("s1", vec![vuln("CVE-6")]);
        assert_eq!(reg.get("s1").unwrap().vulnerabilities.len(), 3);
    }

    #[test]
    fn append_exactly_remaining_does_not_truncate() {
        let reg = registry(10, 2);
        reg.create("s1", "url").unwrap();
        reg.append_vulnerabilities("s1", vec![vuln("CVE-1"), vuln("CVE-2")]);
        let record = reg.get("s1").unwrap();
        assert_eq!(record.vulnerabilities.len(), 2);
        assert!(!record.truncated);
    }

    #[test]
    fn eviction_prefers_terminal_records() {
        let reg = registry(2, 10);
        reg.create("s1", "url-1").unwrap();
        reg.update_status("s1", ScanStatus::Scanning);
        reg.create("s2", "url-2").unwrap();
        reg.update_status("s2", ScanStatus::Scanning);
        reg.update_status("s2", ScanStatus::Finished);

        reg.create("s3", "url-3").unwrap();
        assert!(reg.get("s2").is_none(), "terminal record should go first");
        assert!(reg.get("s1").is_some());
        assert!(reg.get("s3").is_some());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn eviction_falls_back_to_oldest_when_nothing_is_terminal() {
        let reg = registry(2, 10);
        reg.create("s1", "url-1").unwrap();
        reg.update_status("s1", ScanStatus::Scanning);
        reg.create("s2", "url-2").unwrap();
        reg.update_status("s2", ScanStatus::Scanning);

        reg.create("s3", "url-3").unwrap();
        assert!(reg.get("s1").is_none(), "oldest in-flight record should go");
        assert!(reg.get("s2").is_some());
        assert!(reg.get("s3").is_some());
    }

    #[test]
    fn registry_never_exceeds_max_entries() {
        let reg = registry(5, 10);
        for i in 0..20 {
            reg.create(&format!("s{i}"), "url").unwrap();
            assert!(reg.len() <= 5);
        }
    }

    #[test]
    fn stats_count_by_status() {
        let reg = registry(10, 10);
        reg.create("s1", "url").unwrap();
        reg.create("s2", "url").unwrap();
        reg.update_status("s2", ScanStatus::Scanning);
        reg.create("s3", "url").unwrap();
        reg.set_error("s3", ScanError::new(ScanErrorCode::Oom, "oom"));

        let stats = reg.stats();
        assert_eq!(
            stats,
            RegistryStats {
                total: 3,
                queued: 1,
                scanning: 1,
                finished: 0,
                failed: 1,
            }
        );
    }
}
