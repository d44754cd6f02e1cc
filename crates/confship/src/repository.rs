//! Repository access: commit snapshots, blobs, and change sets.
//!
//! The source of truth is a git repository whose top-level directories are
//! host names, the universal directory, and universal-group directories.
//! Everything is read through the `git` binary; a commit is never
//! modified, with the single exception of [`Repository::rollback_commit`]
//! for commits this process authored itself.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::header::{
    ARTIFACT_POINTER_SUFFIX, DIRECTORY_METADATA_NAME, split_content,
};
use crate::process::{ExecOutput, run_with_timeout};
use crate::types::{ActionKind, Artifact, DeployError, MetaHeader};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// SHA-256 of a byte slice, lower-case hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// One entry of a commit tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: String,
    pub oid: String,
    pub path: String,
}

/// Kind of change a commit made to one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One path touched by a commit; renames surface as delete + create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
}

/// Handle to the source-of-truth repository.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Open the repository at `root`, verifying git can see it.
    pub fn open(root: &Path) -> Result<Self, DeployError> {
        let repo = Self {
            root: root.to_path_buf(),
        };
        let out = repo.git(&["rev-parse", "--git-dir"])?;
        if !out.success() {
            return Err(DeployError::LocalSetup(format!(
                "{} is not a git repository: {}",
                root.display(),
                out.stderr.trim()
            )));
        }
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a ref to its full 40-hex commit id.
    pub fn resolve_commit(&self, refname: &str) -> Result<String, DeployError> {
        let spec = format!("{refname}^{{commit}}");
        let out = self.git(&["rev-parse", "--verify", &spec])?;
        if !out.success() {
            return Err(DeployError::LocalSetup(format!(
                "cannot resolve {refname}: {}",
                out.stderr.trim()
            )));
        }
        Ok(out.stdout_trimmed())
    }

    /// Enumerate the full tree of a commit.
    pub fn list_tree(&self, commit: &str) -> Result<Vec<TreeEntry>, DeployError> {
        let out = self.git(&["ls-tree", "-r", "-z", commit])?;
        if !out.success() {
            return Err(DeployError::LocalSetup(format!(
                "git ls-tree failed for {commit}: {}",
                out.stderr.trim()
            )));
        }

        let mut entries = Vec::new();
        for record in out.stdout.split(|b| *b == 0) {
            if record.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(record);
            // `<mode> <type> <oid>\t<path>`
            let (meta, path) = text
                .split_once('\t')
                .ok_or_else(|| DeployError::LocalSetup(format!("malformed ls-tree record: {text}")))?;
            let mut fields = meta.split_whitespace();
            let mode = fields.next().unwrap_or_default().to_string();
            let _objtype = fields.next();
            let oid = fields.next().unwrap_or_default().to_string();
            entries.push(TreeEntry {
                mode,
                oid,
                path: path.to_string(),
            });
        }
        Ok(entries)
    }

    /// Read a blob's raw bytes.
    pub fn read_blob(&self, oid: &str) -> Result<Vec<u8>, DeployError> {
        let out = self.git(&["cat-file", "blob", oid])?;
        if !out.success() {
            return Err(DeployError::LocalSetup(format!(
                "git cat-file failed for {oid}: {}",
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    /// Paths touched by a commit, renames tracked as delete + create.
    pub fn changed_paths(&self, commit: &str) -> Result<Vec<Change>, DeployError> {
        let out = self.git(&[
            "diff-tree",
            "-r",
            "-z",
            "--no-commit-id",
            "--name-status",
            "-M",
            "--root",
            commit,
        ])?;
        if !out.success() {
            return Err(DeployError::LocalSetup(format!(
                "git diff-tree failed for {commit}: {}",
                out.stderr.trim()
            )));
        }

        let mut changes = Vec::new();
        let mut fields = out
            .stdout
            .split(|b| *b == 0)
            .map(|f| String::from_utf8_lossy(f).to_string());
        while let Some(status) = fields.next() {
            if status.is_empty() {
                continue;
            }
            match status.chars().next() {
                Some('A') => {
                    let path = next_field(&mut fields, &status)?;
                    changes.push(Change {
                        kind: ChangeKind::Added,
                        path,
                    });
                }
                Some('M') | Some('T') => {
                    let path = next_field(&mut fields, &status)?;
                    changes.push(Change {
                        kind: ChangeKind::Modified,
                        path,
                    });
                }
                Some('D') => {
                    let path = next_field(&mut fields, &status)?;
                    changes.push(Change {
                        kind: ChangeKind::Deleted,
                        path,
                    });
                }
                Some('R') | Some('C') => {
                    let from = next_field(&mut fields, &status)?;
                    let to = next_field(&mut fields, &status)?;
                    if status.starts_with('R') {
                        changes.push(Change {
                            kind: ChangeKind::Deleted,
                            path: from,
                        });
                    }
                    changes.push(Change {
                        kind: ChangeKind::Added,
                        path: to,
                    });
                }
                _ => {
                    return Err(DeployError::LocalSetup(format!(
                        "unrecognized diff-tree status {status:?}"
                    )));
                }
            }
        }
        Ok(changes)
    }

    /// Undo the most recent commit, but only when it is the one this
    /// process authored: the caller passes the commit id it created and
    /// the rollback refuses to touch anything else.
    pub fn rollback_commit(&self, authored_commit: &str) -> Result<(), DeployError> {
        let head = self.resolve_commit("HEAD")?;
        if head != authored_commit {
            return Err(DeployError::LocalSetup(format!(
                "refusing rollback: HEAD {head} is not the authored commit {authored_commit}"
            )));
        }
        let out = self.git(&["reset", "--hard", "HEAD~1"])?;
        if !out.success() {
            return Err(DeployError::LocalSetup(format!(
                "rollback failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    fn git(&self, args: &[&str]) -> Result<ExecOutput, DeployError> {
        let mut full = vec!["-C", self.root.to_str().unwrap_or(".")];
        full.extend_from_slice(args);
        run_with_timeout("git", &full, None, Some(GIT_TIMEOUT))
            .map_err(|e| DeployError::LocalSetup(format!("{e:#}")))
    }
}

fn next_field(
    fields: &mut impl Iterator<Item = String>,
    status: &str,
) -> Result<String, DeployError> {
    fields.next().filter(|f| !f.is_empty()).ok_or_else(|| {
        DeployError::LocalSetup(format!("diff-tree record for status {status:?} is truncated"))
    })
}

/// Which top-level directories the reader accepts and which it ignores.
#[derive(Debug, Clone, Default)]
pub struct ReaderConfig {
    /// Host names, the universal directory, and universal-group dirs.
    pub valid_top_dirs: BTreeSet<String>,
    /// Directories whose contents are never artifacts.
    pub ignore_dirs: BTreeSet<String>,
}

/// The artifacts of one commit snapshot, keyed by repo path, with payload
/// buffers shared across identical content.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    pub commit_id: String,
    pub artifacts: BTreeMap<String, Artifact>,
    /// content hash -> payload; identical payloads share one buffer.
    pub payloads: BTreeMap<String, Arc<Vec<u8>>>,
}

impl ArtifactSet {
    pub fn payload_for(&self, artifact: &Artifact) -> Option<Arc<Vec<u8>>> {
        self.payloads.get(&artifact.content_hash).cloned()
    }
}

/// Read a commit snapshot into an [`ArtifactSet`].
///
/// Tree entries that are not regular files, live in the repository root,
/// or sit under an unconfigured or ignored top-level directory are
/// silently dropped. Malformed metadata is fatal.
pub fn read_snapshot(
    repo: &Repository,
    commit: &str,
    config: &ReaderConfig,
) -> Result<ArtifactSet, DeployError> {
    let mut set = ArtifactSet {
        commit_id: commit.to_string(),
        ..ArtifactSet::default()
    };

    for entry in repo.list_tree(commit)? {
        if !is_regular_mode(&entry.mode) {
            continue;
        }
        let Some(top_dir) = top_dir_of(&entry.path) else {
            continue;
        };
        if config.ignore_dirs.contains(top_dir) || !config.valid_top_dirs.contains(top_dir) {
            continue;
        }

        let blob = repo.read_blob(&entry.oid)?;
        let artifact = build_artifact(repo, &entry.path, &blob, &mut set)?;
        set.artifacts.insert(entry.path.clone(), artifact);
    }

    Ok(set)
}

/// Construct the artifact for a deleted path (no blob to consult).
pub fn deletion_artifact(repo_path: &str) -> Artifact {
    Artifact {
        repo_path: repo_path.to_string(),
        action: ActionKind::Delete,
        content_hash: String::new(),
        target_path: target_path_of(repo_path),
        owner_group: String::new(),
        permissions: 0,
        file_size: 0,
        link_target: None,
        dependencies: Vec::new(),
        install: Vec::new(),
        checks: Vec::new(),
        reload: Vec::new(),
        reload_group: None,
        predeploy: Vec::new(),
    }
}

fn build_artifact(
    repo: &Repository,
    repo_path: &str,
    blob: &[u8],
    set: &mut ArtifactSet,
) -> Result<Artifact, DeployError> {
    let split = split_content(repo_path, blob)?;
    let header = split.header;

    let is_pointer = repo_path.ends_with(ARTIFACT_POINTER_SUFFIX);
    let is_dir_metadata = file_name_of(repo_path) == DIRECTORY_METADATA_NAME;

    // Pointer files keep their on-disk payload even when the header names
    // an external location.
    let payload: Vec<u8> = if !is_pointer {
        if let Some(location) = &header.external_content_location {
            let path = repo.root().join(location);
            std::fs::read(&path).map_err(|e| DeployError::BadMetadata {
                path: repo_path.to_string(),
                reason: format!("external content {location} unreadable: {e}"),
            })?
        } else {
            split.payload.to_vec()
        }
    } else {
        split.payload.to_vec()
    };

    let action = if is_dir_metadata {
        ActionKind::DirCreate
    } else if header.symbolic_link_target.is_some() {
        ActionKind::Symlink
    } else {
        ActionKind::Create
    };

    if let Some(target) = &header.symbolic_link_target {
        validate_link_target(repo_path, target)?;
    }

    let target_path = if is_dir_metadata {
        parent_target_of(repo_path)
    } else {
        target_path_of(repo_path)
    };

    let content_hash = sha256_hex(&payload);
    let file_size = payload.len() as u64;
    set.payloads
        .entry(content_hash.clone())
        .or_insert_with(|| Arc::new(payload));

    Ok(Artifact {
        repo_path: repo_path.to_string(),
        action,
        content_hash,
        target_path,
        owner_group: header
            .file_owner_group
            .clone()
            .unwrap_or_else(|| "root:root".to_string()),
        permissions: header.file_permissions.unwrap_or(if is_dir_metadata {
            755
        } else {
            644
        }),
        file_size,
        link_target: header.symbolic_link_target.clone(),
        dependencies: header.dependencies.clone(),
        install: header.install.clone(),
        checks: header.checks.clone(),
        reload: header.reload.clone(),
        reload_group: header.reload_group.clone(),
        predeploy: header.predeploy.clone(),
    })
}

/// Regular-file tree modes. Directories, submodules, tree symlinks, and
/// the deprecated group-writable mode are all dropped.
fn is_regular_mode(mode: &str) -> bool {
    mode == "100644" || mode == "100755"
}

/// Top-level directory of a repo path; `None` for root-level paths, which
/// are never artifacts.
pub fn top_dir_of(repo_path: &str) -> Option<&str> {
    let (top, rest) = repo_path.split_once('/')?;
    if rest.is_empty() { None } else { Some(top) }
}

/// The remote target path: `/` + the repo path without its top-level
/// directory, minus any artifact-pointer suffix.
pub fn target_path_of(repo_path: &str) -> String {
    let without_top = repo_path
        .split_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or(repo_path);
    let without_suffix = without_top
        .strip_suffix(ARTIFACT_POINTER_SUFFIX)
        .unwrap_or(without_top);
    format!("/{without_suffix}")
}

fn file_name_of(repo_path: &str) -> &str {
    repo_path.rsplit('/').next().unwrap_or(repo_path)
}

/// Target for directory-metadata markers: the parent directory.
fn parent_target_of(repo_path: &str) -> String {
    let target = target_path_of(repo_path);
    match target.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => target[..idx].to_string(),
        None => "/".to_string(),
    }
}

/// A relative symlink target must resolve inside the same top-level
/// directory; absolute targets refer to the deploying host by
/// construction.
fn validate_link_target(repo_path: &str, link_target: &str) -> Result<(), DeployError> {
    if link_target.starts_with('/') {
        return Ok(());
    }
    let top = top_dir_of(repo_path).unwrap_or_default();

    let mut components: Vec<&str> = repo_path.split('/').collect();
    components.pop(); // the link itself
    for part in link_target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() {
                    return Err(link_escape(repo_path, link_target));
                }
            }
            other => components.push(other),
        }
    }

    if components.first() != Some(&top) {
        return Err(link_escape(repo_path, link_target));
    }
    Ok(())
}

fn link_escape(repo_path: &str, link_target: &str) -> DeployError {
    DeployError::BadMetadata {
        path: repo_path.to_string(),
        reason: format!("symbolic link target {link_target} escapes its top-level directory"),
    }
}
