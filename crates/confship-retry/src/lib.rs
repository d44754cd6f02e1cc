//! The persisted failure-tracking file.
//!
//! After a deployment with failures, the engine writes a line-structured
//! record of every (host, file) pair that did not apply, pinned to the
//! commit that was being deployed. A later `deploy --failures` run reads
//! the file back and re-attempts exactly that subset at that commit,
//! ignoring the current HEAD.
//!
//! ## Format
//!
//! ```text
//! commitid:1111111111111111111111111111111111111111
//! {"endpointName":"web01","files":["web01/etc/foo.conf"],"errorMessage":"hash mismatch"}
//! {"endpointName":"db01","files":[],"errorMessage":"connection refused"}
//! ```
//!
//! The first line carries the 40-hex commit id; every following line is
//! one JSON record. A record with an empty `files` array marks a
//! host-level failure. Because the format is line-structured, file names
//! and messages containing CR/LF are rejected by the writer; callers
//! sanitize messages on intake with [`confship_output_sanitizer`].

use std::fmt::Write as _;
use std::path::Path;

use confship_output_sanitizer::{has_line_breaks, sanitize_line};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const COMMIT_PREFIX: &str = "commitid:";

/// Errors raised while reading or writing a retry file.
#[derive(Debug, Error)]
pub enum RetryFileError {
    #[error("retry file commit id must be 40 hex characters, got {0:?}")]
    BadCommitId(String),
    #[error("{what} contains a line break and cannot be stored: {value:?}")]
    LineBreaks { what: &'static str, value: String },
    #[error("retry file line {line} is not a valid record: {source}")]
    BadRecord {
        line: usize,
        source: serde_json::Error,
    },
    #[error("retry file is missing the commitid header line")]
    MissingHeader,
    #[error("failed to access retry file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// One failure record: a host and the repository files that failed on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub endpoint_name: String,
    pub files: Vec<String>,
    pub error_message: String,
}

impl FailureRecord {
    /// Build a record, sanitizing the error message and rejecting file
    /// names that cannot be stored on one line.
    pub fn new(
        endpoint_name: impl Into<String>,
        files: Vec<String>,
        error_message: &str,
    ) -> Result<Self, RetryFileError> {
        let endpoint_name = endpoint_name.into();
        if has_line_breaks(&endpoint_name) {
            return Err(RetryFileError::LineBreaks {
                what: "endpoint name",
                value: endpoint_name,
            });
        }
        for file in &files {
            if has_line_breaks(file) {
                return Err(RetryFileError::LineBreaks {
                    what: "file name",
                    value: file.clone(),
                });
            }
        }
        Ok(Self {
            endpoint_name,
            files,
            error_message: sanitize_line(error_message),
        })
    }
}

/// The parsed form of a retry file: a commit id plus failure records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFile {
    pub commit_id: String,
    pub records: Vec<FailureRecord>,
}

impl RetryFile {
    /// Start an empty retry file for the given commit.
    pub fn new(commit_id: impl Into<String>) -> Result<Self, RetryFileError> {
        let commit_id = commit_id.into();
        if !is_commit_hash(&commit_id) {
            return Err(RetryFileError::BadCommitId(commit_id));
        }
        Ok(Self {
            commit_id,
            records: Vec::new(),
        })
    }

    /// Append a failure record.
    pub fn push(&mut self, record: FailureRecord) {
        self.records.push(record);
    }

    /// True when no failures were recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All (host, file) pairs named by the records, in file order.
    ///
    /// Host-level records (empty `files`) contribute no pairs; the caller
    /// decides how to re-plan those hosts.
    pub fn failed_pairs(&self) -> Vec<(&str, &str)> {
        self.records
            .iter()
            .flat_map(|r| {
                r.files
                    .iter()
                    .map(move |f| (r.endpoint_name.as_str(), f.as_str()))
            })
            .collect()
    }

    /// Hosts named by any record, including host-level failures.
    pub fn failed_hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self.records.iter().map(|r| r.endpoint_name.as_str()).collect();
        hosts.dedup();
        hosts
    }

    /// Render the on-disk form.
    pub fn render(&self) -> String {
        let mut out = format!("{COMMIT_PREFIX}{}\n", self.commit_id);
        for record in &self.records {
            // FailureRecord construction guarantees single-line fields.
            let line = serde_json::to_string(record).expect("record serializes");
            let _ = writeln!(out, "{line}");
        }
        out
    }

    /// Parse the on-disk form.
    pub fn parse(content: &str) -> Result<Self, RetryFileError> {
        let mut lines = content.lines().enumerate();

        let commit_id = match lines.next() {
            Some((_, first)) => first
                .strip_prefix(COMMIT_PREFIX)
                .ok_or(RetryFileError::MissingHeader)?
                .to_string(),
            None => return Err(RetryFileError::MissingHeader),
        };
        if !is_commit_hash(&commit_id) {
            return Err(RetryFileError::BadCommitId(commit_id));
        }

        let mut records = Vec::new();
        for (idx, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            let record: FailureRecord = serde_json::from_str(line)
                .map_err(|source| RetryFileError::BadRecord {
                    line: idx + 1,
                    source,
                })?;
            records.push(record);
        }

        Ok(Self { commit_id, records })
    }

    /// Write the file to disk.
    pub fn write(&self, path: &Path) -> Result<(), RetryFileError> {
        std::fs::write(path, self.render()).map_err(|source| RetryFileError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load and parse a retry file from disk.
    pub fn load(path: &Path) -> Result<Self, RetryFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| RetryFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }
}

fn is_commit_hash(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const COMMIT: &str = "1111111111111111111111111111111111111111";

    #[test]
    fn render_and_parse_roundtrip() {
        let mut rf = RetryFile::new(COMMIT).expect("new");
        rf.push(
            FailureRecord::new(
                "web01",
                vec!["web01/etc/foo.conf".to_string()],
                "hash mismatch",
            )
            .expect("record"),
        );
        rf.push(FailureRecord::new("db01", vec![], "connection refused").expect("record"));

        let parsed = RetryFile::parse(&rf.render()).expect("parse");
        assert_eq!(parsed, rf);
        assert_eq!(parsed.failed_pairs(), vec![("web01", "web01/etc/foo.conf")]);
        assert_eq!(parsed.failed_hosts(), vec!["web01", "db01"]);
    }

    #[test]
    fn commit_id_must_be_forty_hex() {
        assert!(RetryFile::new("abc").is_err());
        assert!(RetryFile::new("z".repeat(40)).is_err());
        assert!(RetryFile::new(COMMIT).is_ok());
    }

    #[test]
    fn messages_are_sanitized_on_intake() {
        let record = FailureRecord::new("web01", vec![], "line one\r\nline two").expect("record");
        assert_eq!(record.error_message, "line one line two");
    }

    #[test]
    fn file_names_with_line_breaks_are_rejected() {
        let err = FailureRecord::new("web01", vec!["bad\nname".to_string()], "msg")
            .expect_err("must fail");
        assert!(matches!(err, RetryFileError::LineBreaks { what: "file name", .. }));
    }

    #[test]
    fn parse_rejects_missing_header() {
        let err = RetryFile::parse("{\"endpointName\":\"a\",\"files\":[],\"errorMessage\":\"\"}")
            .expect_err("must fail");
        assert!(matches!(err, RetryFileError::MissingHeader));
    }

    #[test]
    fn parse_reports_bad_record_line() {
        let content = format!("commitid:{COMMIT}\nnot json\n");
        let err = RetryFile::parse(&content).expect_err("must fail");
        assert!(matches!(err, RetryFileError::BadRecord { line: 2, .. }));
    }

    #[test]
    fn write_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("failures");

        let mut rf = RetryFile::new(COMMIT).expect("new");
        rf.push(FailureRecord::new("web01", vec!["web01/a".to_string()], "boom").expect("record"));
        rf.write(&path).expect("write");

        let loaded = RetryFile::load(&path).expect("load");
        assert_eq!(loaded, rf);
    }

    proptest! {
        #[test]
        fn arbitrary_records_roundtrip(
            hosts in proptest::collection::vec("[a-z0-9.-]{1,12}", 1..5),
            files in proptest::collection::vec("[a-z0-9/._-]{1,24}", 0..6),
            message in "[ -~]{0,48}",
        ) {
            let mut rf = RetryFile::new(COMMIT).unwrap();
            for host in &hosts {
                rf.push(FailureRecord::new(host.clone(), files.clone(), &message).unwrap());
            }
            let parsed = RetryFile::parse(&rf.render()).unwrap();
            prop_assert_eq!(parsed, rf);
        }
    }
}
