//! Deployment metrics and failure tracking.
//!
//! One [`Metrics`] accumulator is shared by every host worker. Each
//! concern lives behind its own lock; the per-file error map is a
//! many-reader/one-writer map because the dependency check reads it on
//! the hot path to decide whether a dependent artifact must be skipped.
//! Error strings are sanitized on intake so the summary and the retry
//! file stay line-clean.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use confship_duration::{format_bytes, format_elapsed};
use confship_output_sanitizer::sanitize_line;
use confship_retry::{FailureRecord, RetryFile};

use crate::types::{ActionKind, DeployError};

/// Outcome of one (host, artifact) application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Applied and actually modified the host.
    Deployed,
    /// Probed, diffed, nothing to do.
    UpToDate,
    /// Application failed.
    Failed,
    /// Not attempted because a dependency failed.
    Skipped,
}

#[derive(Debug, Clone)]
struct ItemRecord {
    file: String,
    action: ActionKind,
    outcome: ItemOutcome,
}

/// Thread-safe accumulator of per-host and per-file outcomes.
#[derive(Debug)]
pub struct Metrics {
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    items: Mutex<BTreeMap<String, Vec<ItemRecord>>>,
    /// host -> file -> sanitized error message.
    file_errors: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
    host_errors: Mutex<BTreeMap<String, String>>,
    host_bytes: Mutex<BTreeMap<String, u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
            items: Mutex::new(BTreeMap::new()),
            file_errors: RwLock::new(BTreeMap::new()),
            host_errors: Mutex::new(BTreeMap::new()),
            host_bytes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a successful application.
    pub fn record_success(&self, host: &str, file: &str, action: ActionKind, modified: bool) {
        let outcome = if modified {
            ItemOutcome::Deployed
        } else {
            ItemOutcome::UpToDate
        };
        self.push_item(host, file, action, outcome);
    }

    /// Record a failed application.
    pub fn record_failure(&self, host: &str, file: &str, action: ActionKind, error: &DeployError) {
        self.push_item(host, file, action, ItemOutcome::Failed);
        self.file_errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host.to_string())
            .or_default()
            .insert(file.to_string(), sanitize_line(&format!("{error}")));
    }

    /// Record an artifact skipped because a dependency failed.
    pub fn record_skipped(&self, host: &str, file: &str, action: ActionKind, reason: &str) {
        self.push_item(host, file, action, ItemOutcome::Skipped);
        self.file_errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host.to_string())
            .or_default()
            .insert(file.to_string(), sanitize_line(reason));
    }

    /// Flip an already-recorded item to failed. Used when a reload-group
    /// command fails after its members applied successfully.
    pub fn mark_failed(&self, host: &str, file: &str, error: &DeployError) {
        let flipped = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            match items
                .entry(host.to_string())
                .or_default()
                .iter_mut()
                .rev()
                .find(|r| r.file == file)
            {
                Some(record) => {
                    record.outcome = ItemOutcome::Failed;
                    true
                }
                None => false,
            }
        };
        if !flipped {
            self.push_item(host, file, ActionKind::Create, ItemOutcome::Failed);
        }
        self.file_errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host.to_string())
            .or_default()
            .insert(file.to_string(), sanitize_line(&format!("{error}")));
    }

    /// Record a host-level failure (session setup, transport loss).
    pub fn record_host_failure(&self, host: &str, message: &str) {
        self.host_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.to_string(), sanitize_line(message));
    }

    /// Whether an artifact failed or was skipped on this host. Read by
    /// the dependency check before each artifact.
    pub fn file_failed(&self, host: &str, file: &str) -> bool {
        self.file_errors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .is_some_and(|files| files.contains_key(file))
    }

    /// Count transferred bytes against a host (actual transfers only).
    pub fn add_bytes(&self, host: &str, bytes: u64) {
        *self
            .host_bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host.to_string())
            .or_insert(0) += bytes;
    }

    /// Stamp the end of the run.
    pub fn finish(&self) {
        *self.finished_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    fn push_item(&self, host: &str, file: &str, action: ActionKind, outcome: ItemOutcome) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host.to_string())
            .or_default()
            .push(ItemRecord {
                file: file.to_string(),
                action,
                outcome,
            });
    }

    /// Build the summary report.
    pub fn summary(&self, commit_id: &str) -> Summary {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let host_errors = self.host_errors.lock().unwrap_or_else(|e| e.into_inner());
        let host_bytes = self.host_bytes.lock().unwrap_or_else(|e| e.into_inner());
        let file_errors = self.file_errors.read().unwrap_or_else(|e| e.into_inner());

        let mut host_names: Vec<&String> = items.keys().collect();
        for host in host_errors.keys() {
            if !items.contains_key(host) {
                host_names.push(host);
            }
        }

        let mut hosts = Vec::new();
        let mut counters = Counters::default();
        let mut total_bytes = 0u64;

        for host in host_names {
            let records = items.get(host).map(Vec::as_slice).unwrap_or_default();
            let errors = file_errors.get(host);
            let status = host_status(records, host_errors.contains_key(host));
            let bytes = host_bytes.get(host).copied().unwrap_or(0);
            total_bytes += bytes;

            counters.hosts += 1;
            counters.items += records.len() as u64;
            let failed_items = records
                .iter()
                .filter(|r| matches!(r.outcome, ItemOutcome::Failed | ItemOutcome::Skipped))
                .count() as u64;
            counters.items_failed += failed_items;
            counters.items_completed += records.len() as u64 - failed_items;
            if matches!(status, Status::Failed | Status::Partial) {
                counters.hosts_failed += 1;
            } else {
                counters.hosts_completed += 1;
            }

            let item_reports = records
                .iter()
                .map(|r| ItemReport {
                    name: r.file.clone(),
                    deployment_action: r.action.as_str().to_string(),
                    status: Some(match r.outcome {
                        ItemOutcome::Deployed => Status::Deployed,
                        ItemOutcome::UpToDate => Status::UpToDate,
                        ItemOutcome::Failed | ItemOutcome::Skipped => Status::Failed,
                    }),
                    error_message: errors.and_then(|e| e.get(&r.file).cloned()),
                })
                .collect();

            hosts.push(HostReport {
                name: host.clone(),
                status,
                error_message: host_errors.get(host).cloned(),
                total_items: Some(records.len() as u64),
                transferred_size: Some(format_bytes(bytes)),
                items: item_reports,
            });
        }

        let finished = self
            .finished_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_else(Utc::now);
        let elapsed = (finished - self.started_at)
            .to_std()
            .unwrap_or_default();

        Summary {
            status: overall_status(&hosts),
            start_time: self.started_at.to_rfc3339(),
            end_time: finished.to_rfc3339(),
            elapsed_time: format_elapsed(elapsed),
            transferred_size: format_bytes(total_bytes),
            counters,
            deployment_commit_hash: commit_id.to_string(),
            hosts,
        }
    }

    /// Build the retry file, or `None` when nothing failed.
    pub fn build_retry_file(&self, commit_id: &str) -> Option<RetryFile> {
        let file_errors = self.file_errors.read().unwrap_or_else(|e| e.into_inner());
        let host_errors = self.host_errors.lock().unwrap_or_else(|e| e.into_inner());

        let mut retry = RetryFile::new(commit_id).ok()?;

        let mut hosts: Vec<&String> = file_errors.keys().collect();
        for host in host_errors.keys() {
            if !file_errors.contains_key(host) {
                hosts.push(host);
            }
        }

        for host in hosts {
            let files: Vec<String> = file_errors
                .get(host)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            let message = host_errors
                .get(host)
                .cloned()
                .or_else(|| {
                    file_errors
                        .get(host)
                        .and_then(|m| m.values().next().cloned())
                })
                .unwrap_or_default();
            if let Ok(record) = FailureRecord::new(host.clone(), files, &message) {
                retry.push(record);
            }
        }

        if retry.is_empty() { None } else { Some(retry) }
    }
}

fn host_status(records: &[ItemRecord], has_host_error: bool) -> Status {
    let deployed = records
        .iter()
        .filter(|r| r.outcome == ItemOutcome::Deployed)
        .count();
    let failed = records
        .iter()
        .filter(|r| matches!(r.outcome, ItemOutcome::Failed | ItemOutcome::Skipped))
        .count();

    if records.is_empty() {
        if has_host_error { Status::Failed } else { Status::UpToDate }
    } else if failed == 0 && has_host_error {
        // Session died after the last item; the host did not finish clean.
        if deployed > 0 { Status::Partial } else { Status::Failed }
    } else if failed == 0 && deployed > 0 {
        Status::Deployed
    } else if failed == 0 {
        Status::UpToDate
    } else if deployed > 0 {
        Status::Partial
    } else {
        Status::Failed
    }
}

fn overall_status(hosts: &[HostReport]) -> Status {
    let any_partial = hosts.iter().any(|h| h.status == Status::Partial);
    let any_failed = hosts.iter().any(|h| h.status == Status::Failed);
    let any_deployed = hosts.iter().any(|h| h.status == Status::Deployed);

    if any_partial || (any_failed && any_deployed) {
        Status::Partial
    } else if any_failed {
        Status::Failed
    } else if any_deployed {
        Status::Deployed
    } else {
        Status::UpToDate
    }
}

/// Deployment status, shared by hosts, items, and the overall run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Deployed,
    Partial,
    Failed,
    UpToDate,
    Unknown,
}

/// Counter block of the summary report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(rename = "Hosts")]
    pub hosts: u64,
    #[serde(rename = "Items")]
    pub items: u64,
    #[serde(rename = "Hosts-Completed")]
    pub hosts_completed: u64,
    #[serde(rename = "Items-Completed")]
    pub items_completed: u64,
    #[serde(rename = "Hosts-Failed")]
    pub hosts_failed: u64,
    #[serde(rename = "Items-Failed")]
    pub items_failed: u64,
}

/// One item of a host report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Deployment-Action")]
    pub deployment_action: String,
    #[serde(rename = "Status", skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(rename = "Error-Message", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One host of the summary report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostReport {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "Error-Message", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "Total-Items", skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
    #[serde(rename = "Transferred-Size", skip_serializing_if = "Option::is_none")]
    pub transferred_size: Option<String>,
    #[serde(rename = "Items")]
    pub items: Vec<ItemReport>,
}

/// The deployment summary report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "Start-Time")]
    pub start_time: String,
    #[serde(rename = "End-Time")]
    pub end_time: String,
    #[serde(rename = "Elapsed-Time")]
    pub elapsed_time: String,
    #[serde(rename = "Transferred-Size")]
    pub transferred_size: String,
    #[serde(rename = "Counters")]
    pub counters: Counters,
    #[serde(rename = "Deployment-Commit-Hash")]
    pub deployment_commit_hash: String,
    #[serde(rename = "Hosts", skip_serializing_if = "Vec::is_empty", default)]
    pub hosts: Vec<HostReport>,
}

impl Summary {
    /// Process exit policy: success only when everything landed.
    pub fn is_success(&self) -> bool {
        matches!(self.status, Status::Deployed | Status::UpToDate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMIT: &str = "2222222222222222222222222222222222222222";

    #[test]
    fn all_deployed_host_is_deployed() {
        let metrics = Metrics::new();
        metrics.record_success("web01", "web01/etc/a", ActionKind::Create, true);
        metrics.record_success("web01", "web01/etc/b", ActionKind::Create, true);
        metrics.finish();

        let summary = metrics.summary(COMMIT);
        assert_eq!(summary.status, Status::Deployed);
        assert_eq!(summary.counters.hosts, 1);
        assert_eq!(summary.counters.items, 2);
        assert_eq!(summary.counters.items_completed, 2);
        assert_eq!(summary.counters.hosts_completed, 1);
        assert!(summary.is_success());
    }

    #[test]
    fn unmodified_items_leave_the_host_up_to_date() {
        let metrics = Metrics::new();
        metrics.record_success("web01", "web01/etc/a", ActionKind::Create, false);
        metrics.finish();

        let summary = metrics.summary(COMMIT);
        assert_eq!(summary.status, Status::UpToDate);
        assert_eq!(summary.hosts[0].status, Status::UpToDate);
        assert!(summary.is_success());
    }

    #[test]
    fn mixed_outcomes_are_partial() {
        let metrics = Metrics::new();
        metrics.record_success("web01", "web01/etc/a", ActionKind::Create, true);
        metrics.record_failure(
            "web01",
            "web01/etc/b",
            ActionKind::Create,
            &DeployError::Transport("connection reset".to_string()),
        );
        metrics.finish();

        let summary = metrics.summary(COMMIT);
        assert_eq!(summary.status, Status::Partial);
        assert_eq!(summary.counters.items_failed, 1);
        assert_eq!(summary.counters.hosts_failed, 1);
        assert!(!summary.is_success());
    }

    #[test]
    fn all_failed_host_is_failed() {
        let metrics = Metrics::new();
        metrics.record_failure(
            "web01",
            "web01/etc/a",
            ActionKind::Create,
            &DeployError::Auth("denied".to_string()),
        );
        metrics.finish();

        assert_eq!(metrics.summary(COMMIT).status, Status::Failed);
    }

    #[test]
    fn no_items_means_up_to_date() {
        let metrics = Metrics::new();
        metrics.finish();
        let summary = metrics.summary(COMMIT);
        assert_eq!(summary.status, Status::UpToDate);
        assert!(summary.hosts.is_empty());
    }

    #[test]
    fn host_error_without_items_is_failed() {
        let metrics = Metrics::new();
        metrics.record_host_failure("db01", "connection refused");
        metrics.finish();

        let summary = metrics.summary(COMMIT);
        assert_eq!(summary.status, Status::Failed);
        assert_eq!(summary.hosts[0].error_message.as_deref(), Some("connection refused"));
    }

    #[test]
    fn file_failed_feeds_the_dependency_check() {
        let metrics = Metrics::new();
        assert!(!metrics.file_failed("web01", "web01/etc/a"));
        metrics.record_failure(
            "web01",
            "web01/etc/a",
            ActionKind::Create,
            &DeployError::Conflict("x".to_string()),
        );
        assert!(metrics.file_failed("web01", "web01/etc/a"));
        assert!(!metrics.file_failed("web02", "web01/etc/a"));
    }

    #[test]
    fn skipped_items_count_as_failures() {
        let metrics = Metrics::new();
        metrics.record_skipped(
            "web01",
            "web01/etc/b",
            ActionKind::Create,
            "skipped: dependency web01/etc/a failed",
        );
        metrics.finish();

        let summary = metrics.summary(COMMIT);
        assert_eq!(summary.counters.items_failed, 1);
        assert_eq!(summary.status, Status::Failed);
        assert!(metrics.file_failed("web01", "web01/etc/b"));
    }

    #[test]
    fn error_messages_are_sanitized() {
        let metrics = Metrics::new();
        metrics.record_failure(
            "web01",
            "web01/etc/a",
            ActionKind::Create,
            &DeployError::Transport("line one\r\nline two".to_string()),
        );
        let summary = metrics.summary(COMMIT);
        let msg = summary.hosts[0].items[0].error_message.as_deref().expect("message");
        assert!(!msg.contains('\n'));
        assert!(!msg.contains('\r'));
    }

    #[test]
    fn bytes_roll_up_into_the_summary() {
        let metrics = Metrics::new();
        metrics.record_success("web01", "web01/etc/a", ActionKind::Create, true);
        metrics.add_bytes("web01", 1024);
        metrics.finish();

        let summary = metrics.summary(COMMIT);
        assert_eq!(summary.transferred_size, "1.00 KiB");
        assert_eq!(summary.hosts[0].transferred_size.as_deref(), Some("1.00 KiB"));
    }

    #[test]
    fn retry_file_collects_failed_pairs_and_host_failures() {
        let metrics = Metrics::new();
        metrics.record_failure(
            "web01",
            "web01/etc/a",
            ActionKind::Create,
            &DeployError::HashMismatch {
                path: "/etc/a".to_string(),
                expected: "a".repeat(64),
                actual: "b".repeat(64),
            },
        );
        metrics.record_host_failure("db01", "no route to host");

        let retry = metrics.build_retry_file(COMMIT).expect("retry file");
        assert_eq!(retry.commit_id, COMMIT);
        assert_eq!(retry.failed_pairs(), vec![("web01", "web01/etc/a")]);
        let db = retry
            .records
            .iter()
            .find(|r| r.endpoint_name == "db01")
            .expect("db01 record");
        assert!(db.files.is_empty());
        assert_eq!(db.error_message, "no route to host");
    }

    #[test]
    fn no_failures_means_no_retry_file() {
        let metrics = Metrics::new();
        metrics.record_success("web01", "web01/etc/a", ActionKind::Create, true);
        assert!(metrics.build_retry_file(COMMIT).is_none());
    }

    #[test]
    fn summary_serializes_with_exact_field_names() {
        let metrics = Metrics::new();
        metrics.record_success("web01", "web01/etc/hello.conf", ActionKind::Create, true);
        metrics.add_bytes("web01", 3);
        metrics.finish();

        let json = serde_json::to_value(metrics.summary(COMMIT)).expect("serialize");
        for key in [
            "Status",
            "Start-Time",
            "End-Time",
            "Elapsed-Time",
            "Transferred-Size",
            "Counters",
            "Deployment-Commit-Hash",
            "Hosts",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        let counters = &json["Counters"];
        for key in [
            "Hosts",
            "Items",
            "Hosts-Completed",
            "Items-Completed",
            "Hosts-Failed",
            "Items-Failed",
        ] {
            assert!(counters.get(key).is_some(), "missing Counters.{key}");
        }
        let host = &json["Hosts"][0];
        assert_eq!(host["Name"], "web01");
        assert_eq!(host["Status"], "Deployed");
        let item = &host["Items"][0];
        assert_eq!(item["Name"], "web01/etc/hello.conf");
        assert_eq!(item["Deployment-Action"], "create");
    }
}
