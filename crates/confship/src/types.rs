use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// What a single artifact does to the remote filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Write (or overwrite) a regular file.
    Create,
    /// Remove the target and prune empty parent directories.
    Delete,
    /// Create or replace a symbolic link.
    Symlink,
    /// Create a directory and set its metadata.
    DirCreate,
    /// Adjust metadata of an existing directory.
    DirModify,
}

impl ActionKind {
    /// Stable lowercase name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Delete => "delete",
            ActionKind::Symlink => "symlink",
            ActionKind::DirCreate => "dir_create",
            ActionKind::DirModify => "dir_modify",
        }
    }
}

/// The JSON block fenced by `#|^^^|#` at the top of a repository file.
///
/// Key names are fixed by the on-disk format; absent keys fall back to
/// inventory-level defaults when the artifact is assembled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaHeader {
    #[serde(rename = "FileOwnerGroup", skip_serializing_if = "Option::is_none")]
    pub file_owner_group: Option<String>,
    #[serde(rename = "FilePermissions", skip_serializing_if = "Option::is_none")]
    pub file_permissions: Option<u32>,
    #[serde(
        rename = "ExternalContentLocation",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_content_location: Option<String>,
    #[serde(rename = "SymbolicLinkTarget", skip_serializing_if = "Option::is_none")]
    pub symbolic_link_target: Option<String>,
    #[serde(rename = "Dependencies", default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(rename = "Install", default, skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<String>,
    #[serde(rename = "Checks", default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<String>,
    #[serde(rename = "Reload", default, skip_serializing_if = "Vec::is_empty")]
    pub reload: Vec<String>,
    #[serde(rename = "ReloadGroup", skip_serializing_if = "Option::is_none")]
    pub reload_group: Option<String>,
    #[serde(rename = "PreDeploy", default, skip_serializing_if = "Vec::is_empty")]
    pub predeploy: Vec<String>,
}

/// One unit of deployment, keyed by its repository path.
///
/// Immutable once planning starts; the repo path is the only key used to
/// join artifact data, payloads, and outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub repo_path: String,
    pub action: ActionKind,
    /// SHA-256 hex of the effective payload.
    pub content_hash: String,
    /// Absolute path on the remote host.
    pub target_path: String,
    /// `"user:group"`.
    pub owner_group: String,
    /// Numeric permissions, decimal digits with octal meaning (644, 755, ...).
    pub permissions: u32,
    pub file_size: u64,
    pub link_target: Option<String>,
    /// Repo paths that must succeed before this artifact applies.
    pub dependencies: Vec<String>,
    pub install: Vec<String>,
    pub checks: Vec<String>,
    pub reload: Vec<String>,
    pub reload_group: Option<String>,
    /// Commands run locally before the payload ships.
    pub predeploy: Vec<String>,
}

impl Artifact {
    /// Owner and group halves of `owner_group`, if well formed.
    pub fn owner_and_group(&self) -> Option<(&str, &str)> {
        self.owner_group.split_once(':')
    }
}

/// Remote filesystem entry type, as classified from stat output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFsType {
    Regular,
    Directory,
    Symlink,
    Other(String),
}

/// Observed state of one remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub name: String,
    pub fs_type: RemoteFsType,
    pub owner: String,
    pub group: String,
    pub permissions: u32,
    pub size: u64,
    pub link_target: Option<String>,
    /// SHA-256 hex, captured for regular files only.
    pub hash: Option<String>,
    pub exists: bool,
}

impl RemoteFileInfo {
    /// The sentinel for a path that does not exist.
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fs_type: RemoteFsType::Other(String::new()),
            owner: String::new(),
            group: String::new(),
            permissions: 0,
            size: 0,
            link_target: None,
            hash: None,
            exists: false,
        }
    }
}

/// Whether a host participates in deployments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    #[default]
    Online,
    Offline,
    Other(String),
}

/// One target host from the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub login_user: String,
    pub identity_file: Option<PathBuf>,
    /// Path of the vault file holding this host's password; the entry
    /// key inside the vault is the host name.
    pub password_vault: Option<String>,
    pub password_required: bool,
    /// Jump host name, dialed first when set.
    pub proxy: Option<String>,
    pub deployment_state: DeploymentState,
    /// Universal-group directories whose artifacts apply to this host.
    pub universal_groups: BTreeSet<String>,
    /// Remote directory holding pre-mutation backups for one deployment.
    pub remote_backup_dir: String,
    /// Remote scratch path used to stage payloads before the atomic rename.
    pub remote_transfer_buffer: String,
}

/// The ordered work list the planner emits for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentList {
    /// Artifact repo paths in apply order.
    pub files: Vec<String>,
    /// file -> reload group id.
    pub reload_id_by_file: BTreeMap<String, String>,
    /// reload group id -> member files.
    pub files_by_reload_id: BTreeMap<String, Vec<String>>,
    /// reload group id -> reload command sequence.
    pub commands_by_reload_id: BTreeMap<String, Vec<String>>,
    /// reload group id -> member count.
    pub total_by_reload_id: BTreeMap<String, usize>,
}

impl DeploymentList {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Which artifact set a deployment covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    /// Only files touched by the commit being deployed.
    #[default]
    Changes,
    /// The full repository tree.
    All,
    /// The (host, file) pairs recorded in the retry file.
    Failures,
}

/// Per-call timeout budget for remote work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Ordinary remote commands.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_command_timeout"
    )]
    pub command: Duration,
    /// SSH connection establishment.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_connect_timeout"
    )]
    pub connect: Duration,
    /// Content hashing and permission changes on large files.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_hash_timeout"
    )]
    pub hash: Duration,
    /// Install hooks.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_install_timeout"
    )]
    pub install: Duration,
    /// The `uname` OS probe.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_os_probe_timeout"
    )]
    pub os_probe: Duration,
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_hash_timeout() -> Duration {
    Duration::from_secs(90)
}
fn default_install_timeout() -> Duration {
    Duration::from_secs(180)
}
fn default_os_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: default_command_timeout(),
            connect: default_connect_timeout(),
            hash: default_hash_timeout(),
            install: default_install_timeout(),
            os_probe: default_os_probe_timeout(),
        }
    }
}

/// All runtime knobs for one deployment run.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub mode: DeployMode,
    /// CSV of host names (or group names) restricting the run, empty = all.
    pub host_override: String,
    /// CSV of repo paths restricting the run, empty = all.
    pub file_override: String,
    /// Treat override tokens as anchored regexes.
    pub regex_overrides: bool,
    /// Deploy to hosts marked offline as well.
    pub allow_offline: bool,
    /// Probe and diff, but suppress every mutating remote call.
    pub wet_run: bool,
    /// Treat every artifact as differing in content and metadata.
    pub force: bool,
    /// Run `Install` hooks from metadata.
    pub run_install_hooks: bool,
    /// Never run reload commands.
    pub disable_reloads: bool,
    /// Run remote commands without sudo.
    pub disable_sudo: bool,
    /// Bound on concurrently deploying hosts; 1 disables concurrency.
    pub ssh_concurrency: usize,
    pub timeouts: Timeouts,
    /// Environment variable naming the vault passphrase.
    pub vault_passphrase_env: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            mode: DeployMode::Changes,
            host_override: String::new(),
            file_override: String::new(),
            regex_overrides: false,
            allow_offline: false,
            wet_run: false,
            force: false,
            run_install_hooks: false,
            disable_reloads: false,
            disable_sudo: false,
            ssh_concurrency: 10,
            timeouts: Timeouts::default(),
            vault_passphrase_env: "CONFSHIP_VAULT_PASSPHRASE".to_string(),
        }
    }
}

/// The error taxonomy for a deployment run.
///
/// Anything raised before workers launch is fatal; inside a worker every
/// variant is recovered, recorded against the host or file, and the worker
/// continues with its remaining list.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("local setup failed: {0}")]
    LocalSetup(String),
    #[error("invalid configuration: {0}")]
    BadConfig(String),
    #[error("invalid metadata in {path}: {reason}")]
    BadMetadata { path: String, reason: String },
    #[error("dependency error: {0}")]
    BadDependency(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote command failed (exit {exit_code}): {command}: {stderr}")]
    RemoteExec {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("remote command timed out after {timeout:?}: {command}")]
    Timeout {
        command: String,
        timeout: Duration,
    },
    #[error("content hash mismatch for {path}: expected {expected}, found {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("restore from backup failed: {0}")]
    RestoreFailed(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("skipped: {0}")]
    Skipped(String),
}

impl DeployError {
    /// Stable name of the failure kind, used in per-file error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::LocalSetup(_) => "local_setup",
            DeployError::BadConfig(_) => "bad_config",
            DeployError::BadMetadata { .. } => "bad_metadata",
            DeployError::BadDependency(_) => "bad_dependency",
            DeployError::Auth(_) => "auth",
            DeployError::Transport(_) => "transport",
            DeployError::RemoteExec { .. } => "remote_exec",
            DeployError::Timeout { .. } => "timeout",
            DeployError::HashMismatch { .. } => "hash_mismatch",
            DeployError::RestoreFailed(_) => "restore_failed",
            DeployError::Conflict(_) => "conflict",
            DeployError::Skipped(_) => "skipped",
        }
    }
}
