//! Extraction of the metadata header from repository file content.
//!
//! Every deployable file starts with a JSON block fenced by the literal
//! delimiter `#|^^^|#`, each delimiter on its own logical line. The start
//! delimiter may be preceded by a comment opener and the end delimiter
//! followed by a comment closer, so the header stays a comment in
//! whatever language the file is written in:
//!
//! ```text
//! #|^^^|#
//! # {
//! #   "FileOwnerGroup": "root:root",
//! #   "FilePermissions": 644
//! # }
//! #|^^^|#
//! payload...
//! ```
//!
//! When every metadata line shares an identical leading comment marker
//! (`#`, `;`, or `//`), the marker is stripped before JSON parsing; block
//! comment wrappers (`/* ... */`, `<!-- ... -->`) live on the delimiter
//! lines and leave the JSON untouched.

use crate::types::{DeployError, MetaHeader};

/// The 7-character metadata fence.
pub const DELIMITER: &str = "#|^^^|#";

/// Suffix marking a repository file whose payload ships as-is and whose
/// target path drops the suffix.
pub const ARTIFACT_POINTER_SUFFIX: &str = ".remote-artifact";

/// File name that carries metadata for its parent directory.
pub const DIRECTORY_METADATA_NAME: &str = ".directory_metadata_information.json";

/// Bytes examined by the text-vs-binary heuristic.
const BINARY_SNIFF_LEN: usize = 500;
/// Fraction of non-printable bytes above which content reads as binary.
const BINARY_THRESHOLD: f64 = 0.30;
/// PDF 1.4 magic: `%PDF-1.4\n`.
const PDF_MAGIC: &[u8] = &[0x25, 0x50, 0x44, 0x46, 0x2D, 0x31, 0x2E, 0x34, 0x0A];

/// Result of splitting file content into header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitContent<'a> {
    pub header: MetaHeader,
    pub payload: &'a [u8],
}

/// Split file content into its metadata header and payload.
///
/// Fails with [`DeployError::BadMetadata`] when either delimiter is
/// missing, the header is not valid JSON, or the content is obviously
/// binary.
pub fn split_content<'a>(repo_path: &str, content: &'a [u8]) -> Result<SplitContent<'a>, DeployError> {
    if is_probably_binary(content) {
        return Err(bad(repo_path, "binary content cannot carry a metadata header"));
    }

    let delim = DELIMITER.as_bytes();
    let start = find(content, delim, 0)
        .ok_or_else(|| bad(repo_path, "missing metadata start delimiter"))?;
    let header_from = start + delim.len();
    let end = find(content, delim, header_from)
        .ok_or_else(|| bad(repo_path, "missing metadata end delimiter"))?;

    let section = std::str::from_utf8(&content[header_from..end])
        .map_err(|_| bad(repo_path, "metadata section is not valid UTF-8"))?;
    let json = strip_comment_markers(section);

    let header: MetaHeader = serde_json::from_str(&json)
        .map_err(|e| bad(repo_path, &format!("metadata is not valid JSON: {e}")))?;

    let payload = payload_after(content, end + delim.len());

    Ok(SplitContent { header, payload })
}

/// The payload begins after the end delimiter's logical line: an optional
/// comment closer and one optional newline are consumed, nothing else.
fn payload_after(content: &[u8], mut pos: usize) -> &[u8] {
    let trimmed = skip_spaces(content, pos);
    for closer in ["*/", "-->"] {
        if content[trimmed..].starts_with(closer.as_bytes()) {
            pos = trimmed + closer.len();
            break;
        }
    }

    let at_break = skip_spaces(content, pos);
    if content[at_break..].starts_with(b"\r\n") {
        return &content[at_break + 2..];
    }
    if content[at_break..].starts_with(b"\n") {
        return &content[at_break + 1..];
    }
    &content[pos..]
}

fn skip_spaces(content: &[u8], mut pos: usize) -> usize {
    while pos < content.len() && (content[pos] == b' ' || content[pos] == b'\t') {
        pos += 1;
    }
    pos
}

/// Strip a uniform leading comment marker from every metadata line.
///
/// Only applies when every non-blank line (ignoring indentation) starts
/// with the same marker; otherwise the section is returned as-is.
fn strip_comment_markers(section: &str) -> String {
    let lines: Vec<&str> = section
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return String::new();
    }

    for marker in ["//", "#", ";"] {
        if lines.iter().all(|l| l.trim_start().starts_with(marker)) {
            return lines
                .iter()
                .map(|l| {
                    let stripped = l.trim_start();
                    stripped[marker.len()..].to_string()
                })
                .collect::<Vec<_>>()
                .join("\n");
        }
    }

    lines.join("\n")
}

/// Text-vs-binary heuristic: examine up to 500 bytes, count bytes outside
/// printable ASCII plus whitespace, and treat a PDF magic prefix as
/// binary outright.
pub fn is_probably_binary(content: &[u8]) -> bool {
    if content.is_empty() {
        return false;
    }
    if content.starts_with(PDF_MAGIC) {
        return true;
    }

    let window = &content[..content.len().min(BINARY_SNIFF_LEN)];
    let non_printable = window
        .iter()
        .filter(|b| !matches!(**b, 0x20..=0x7E | b'\n' | b'\r' | b'\t'))
        .count();

    (non_printable as f64) / (window.len() as f64) > BINARY_THRESHOLD
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn bad(repo_path: &str, reason: &str) -> DeployError {
    DeployError::BadMetadata {
        path: repo_path.to_string(),
        reason: reason.to_string(),
    }
}
