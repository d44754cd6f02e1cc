//! The artifact applicator: one state machine per (host, artifact) pair.
//!
//! Each artifact runs probe → backup → diff → mutate → verify, with a
//! restore from backup on any mutation failure. After a successful step
//! the reload sub-machine fires: once every member of a reload group has
//! applied (and at least one actually changed), the group's commands run
//! exactly once; a member or reload failure rolls the whole group back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

use crate::engine::Reporter;
use crate::metrics::Metrics;
use crate::process::run_shell;
use crate::remote::{self, RemoteErrorKind, classify_stderr};
use crate::session::{Session, remote_exec_error};
use crate::types::{
    ActionKind, Artifact, DeployError, DeploymentList, RemoteFileInfo, RemoteFsType,
    RuntimeOptions,
};

/// Deepest directory chain pruned after a delete.
const MAX_PRUNE_DEPTH: usize = 200;

/// Pre-mutation copy of a remote file.
#[derive(Debug, Clone)]
struct BackupInfo {
    backup_path: String,
    pre: RemoteFileInfo,
}

/// Result of one successful artifact step.
#[derive(Debug, Default)]
struct StepResult {
    modified: bool,
    bytes: u64,
    backup: Option<BackupInfo>,
    /// The mutation created the target fresh (restore means delete).
    created: bool,
}

/// A reload-group member that already applied on this host.
#[derive(Debug)]
struct GroupMember {
    file: String,
    target: String,
    backup: Option<BackupInfo>,
    created: bool,
}

#[derive(Debug, Default)]
struct ReloadState {
    deployed: usize,
    ready: bool,
    applied: Vec<GroupMember>,
}

/// Drives one host's ordered deployment list over its session.
pub struct Applicator<'a> {
    session: &'a mut Session,
    list: &'a DeploymentList,
    artifacts: &'a BTreeMap<String, Artifact>,
    payloads: &'a BTreeMap<String, Arc<Vec<u8>>>,
    metrics: &'a Metrics,
    opts: &'a RuntimeOptions,
    reporter: &'a mut dyn Reporter,
    host: String,
    reload: BTreeMap<String, ReloadState>,
    poisoned: BTreeSet<String>,
}

impl<'a> Applicator<'a> {
    pub fn new(
        session: &'a mut Session,
        list: &'a DeploymentList,
        artifacts: &'a BTreeMap<String, Artifact>,
        payloads: &'a BTreeMap<String, Arc<Vec<u8>>>,
        metrics: &'a Metrics,
        opts: &'a RuntimeOptions,
        reporter: &'a mut dyn Reporter,
    ) -> Self {
        let host = session.endpoint().name.clone();
        Self {
            session,
            list,
            artifacts,
            payloads,
            metrics,
            opts,
            reporter,
            host,
            reload: BTreeMap::new(),
            poisoned: BTreeSet::new(),
        }
    }

    /// Apply the whole list in order.
    ///
    /// Per-artifact failures are recorded and the loop continues; only a
    /// lost transport aborts the host, and the caller marks whatever
    /// remains.
    pub fn run(&mut self) -> Result<(), DeployError> {
        let list = self.list;
        for (idx, file) in list.files.iter().enumerate() {
            let artifacts = self.artifacts;
            let Some(artifact) = artifacts.get(file) else {
                continue;
            };

            match self.apply_one(artifact) {
                Ok(step) => {
                    self.metrics
                        .record_success(&self.host, file, artifact.action, step.modified);
                    if step.bytes > 0 {
                        self.metrics.add_bytes(&self.host, step.bytes);
                    }
                    self.after_success(artifact, step)?;
                }
                Err(DeployError::Skipped(reason)) => {
                    self.metrics
                        .record_skipped(&self.host, file, artifact.action, &reason);
                }
                Err(err @ DeployError::Transport(_)) => {
                    self.metrics
                        .record_failure(&self.host, file, artifact.action, &err);
                    self.mark_rest_unreachable(&list.files[idx + 1..]);
                    return Err(err);
                }
                Err(err) => {
                    self.metrics
                        .record_failure(&self.host, file, artifact.action, &err);
                    self.abort_group_of(artifact, &err);
                }
            }
        }
        Ok(())
    }

    fn apply_one(&mut self, artifact: &Artifact) -> Result<StepResult, DeployError> {
        for dep in &artifact.dependencies {
            if self.metrics.file_failed(&self.host, dep) {
                return Err(DeployError::Skipped(format!("dependency {dep} failed")));
            }
        }
        if let Some(id) = self.list.reload_id_by_file.get(&artifact.repo_path) {
            if self.poisoned.contains(id) {
                return Err(DeployError::Skipped(
                    "another member of its reload group failed".to_string(),
                ));
            }
        }

        self.run_check_commands(artifact)?;
        self.run_install_commands(artifact)?;
        self.run_predeploy_commands(artifact)?;

        match artifact.action {
            ActionKind::Delete => self.apply_delete(artifact),
            ActionKind::Symlink => self.apply_symlink(artifact),
            ActionKind::DirCreate | ActionKind::DirModify => self.apply_directory(artifact),
            ActionKind::Create => self.apply_create(artifact),
        }
    }

    fn run_check_commands(&mut self, artifact: &Artifact) -> Result<(), DeployError> {
        let timeout = self.session.timeouts().command;
        for command in &artifact.checks {
            let out = self.session.exec(command, None, timeout)?;
            if !out.success() {
                return Err(remote_exec_error(command, &out));
            }
        }
        Ok(())
    }

    fn run_install_commands(&mut self, artifact: &Artifact) -> Result<(), DeployError> {
        if !self.opts.run_install_hooks || self.opts.wet_run {
            return Ok(());
        }
        let timeout = self.session.timeouts().install;
        for command in &artifact.install {
            let out = self.session.exec(command, None, timeout)?;
            if !out.success() {
                return Err(remote_exec_error(command, &out));
            }
        }
        Ok(())
    }

    /// Predeploy hooks run on the controller before anything ships.
    fn run_predeploy_commands(&mut self, artifact: &Artifact) -> Result<(), DeployError> {
        let timeout = self.session.timeouts().command;
        for command in &artifact.predeploy {
            let out = run_shell(command, Some(timeout))
                .map_err(|e| DeployError::LocalSetup(format!("{e:#}")))?;
            if !out.success() {
                return Err(DeployError::LocalSetup(format!(
                    "predeploy command failed (exit {}): {command}: {}",
                    out.exit_code,
                    out.stderr.trim()
                )));
            }
        }
        Ok(())
    }

    fn apply_create(&mut self, artifact: &Artifact) -> Result<StepResult, DeployError> {
        let target = artifact.target_path.as_str();

        let mut pre = self.probe(target)?;
        if pre.exists {
            match pre.fs_type {
                RemoteFsType::Regular => {
                    pre.hash = Some(self.hash_remote(target)?);
                }
                ref other => {
                    return Err(DeployError::Conflict(format!(
                        "refusing to deploy a regular file over {} at {target}",
                        fs_type_name(other)
                    )));
                }
            }
        }

        let backup = if pre.exists && !self.opts.wet_run {
            Some(self.backup(target, &pre)?)
        } else {
            None
        };

        let (content_diff, metadata_diff) = if self.opts.force {
            (true, true)
        } else {
            diff_create(&pre, artifact)
        };
        if !content_diff && !metadata_diff {
            return Ok(StepResult {
                backup,
                ..StepResult::default()
            });
        }
        if self.opts.wet_run {
            return Ok(StepResult {
                modified: true,
                created: !pre.exists,
                ..StepResult::default()
            });
        }

        let created = !pre.exists;
        let mut bytes = 0u64;

        if content_diff {
            let payload = self
                .payloads
                .get(&artifact.content_hash)
                .cloned()
                .ok_or_else(|| {
                    DeployError::Conflict(format!(
                        "no payload buffer for {} ({})",
                        artifact.repo_path, artifact.content_hash
                    ))
                })?;

            if let Err(err) = self.stage_and_move(artifact, &payload) {
                self.restore(target, &backup, created);
                return Err(err);
            }
            bytes = payload.len() as u64;

            let actual = match self.hash_remote(target) {
                Ok(actual) => actual,
                Err(err) => {
                    self.restore(target, &backup, created);
                    return Err(err);
                }
            };
            if actual != artifact.content_hash {
                self.restore(target, &backup, created);
                return Err(DeployError::HashMismatch {
                    path: target.to_string(),
                    expected: artifact.content_hash.clone(),
                    actual,
                });
            }
        } else if metadata_diff {
            if let Err(err) = self.apply_metadata(artifact, target) {
                self.restore(target, &backup, created);
                return Err(err);
            }
        }

        Ok(StepResult {
            modified: true,
            bytes,
            backup,
            created,
        })
    }

    /// Stage the payload to the transfer buffer, set its metadata, and
    /// rename it into place atomically.
    fn stage_and_move(
        &mut self,
        artifact: &Artifact,
        payload: &Arc<Vec<u8>>,
    ) -> Result<(), DeployError> {
        let buffer = self.session.endpoint().remote_transfer_buffer.clone();
        let hash_timeout = self.session.timeouts().hash;
        let command_timeout = self.session.timeouts().command;

        let receive = remote::receive_command(&buffer);
        let out = self
            .session
            .exec(&receive, Some(payload.as_slice()), hash_timeout)?;
        if !out.success() {
            return Err(remote_exec_error(&receive, &out));
        }

        for command in [
            remote::chmod_command(artifact.permissions, &buffer),
            remote::chown_command(&artifact.owner_group, &buffer),
        ] {
            let out = self.session.exec(&command, None, hash_timeout)?;
            if !out.success() {
                return Err(remote_exec_error(&command, &out));
            }
        }

        let mv = remote::move_command(&buffer, &artifact.target_path);
        let out = self.session.exec(&mv, None, command_timeout)?;
        if !out.success() {
            return Err(remote_exec_error(&mv, &out));
        }
        Ok(())
    }

    fn apply_metadata(&mut self, artifact: &Artifact, target: &str) -> Result<(), DeployError> {
        let timeout = self.session.timeouts().hash;
        for command in [
            remote::chmod_command(artifact.permissions, target),
            remote::chown_command(&artifact.owner_group, target),
        ] {
            let out = self.session.exec(&command, None, timeout)?;
            if !out.success() {
                return Err(remote_exec_error(&command, &out));
            }
        }
        Ok(())
    }

    fn apply_delete(&mut self, artifact: &Artifact) -> Result<StepResult, DeployError> {
        let target = artifact.target_path.as_str();

        if self.opts.wet_run {
            let pre = self.probe(target)?;
            return Ok(StepResult {
                modified: pre.exists,
                ..StepResult::default()
            });
        }

        let command = remote::remove_command(target);
        let timeout = self.session.timeouts().command;
        let out = self.session.exec(&command, None, timeout)?;
        let modified = if out.success() {
            true
        } else {
            match classify_stderr(&out.stderr) {
                // A target that is already gone is a successful delete.
                RemoteErrorKind::NotFound => false,
                _ => return Err(remote_exec_error(&command, &out)),
            }
        };

        if modified {
            self.prune_empty_parents(target)?;
        }
        Ok(StepResult {
            modified,
            ..StepResult::default()
        })
    }

    /// Remove now-empty parent directories, bottom up.
    fn prune_empty_parents(&mut self, target: &str) -> Result<(), DeployError> {
        let timeout = self.session.timeouts().command;
        let mut path = target.to_string();
        for _ in 0..MAX_PRUNE_DEPTH {
            let Some(idx) = path.rfind('/') else { break };
            path.truncate(idx);
            if path.is_empty() {
                break;
            }
            let command = remote::remove_empty_dir_command(&path);
            let out = self.session.exec(&command, None, timeout)?;
            if !out.success() {
                // Not empty (or not removable): the chain ends here.
                break;
            }
        }
        Ok(())
    }

    fn apply_symlink(&mut self, artifact: &Artifact) -> Result<StepResult, DeployError> {
        let target = artifact.target_path.as_str();
        let link_target = artifact.link_target.as_deref().ok_or_else(|| {
            DeployError::Conflict(format!("{} has no symbolic link target", artifact.repo_path))
        })?;

        let pre = self.probe(target)?;
        if pre.exists {
            match pre.fs_type {
                RemoteFsType::Symlink => {
                    if pre.link_target.as_deref() == Some(link_target) {
                        return Ok(StepResult::default());
                    }
                }
                ref other => {
                    return Err(DeployError::Conflict(format!(
                        "{target} exists and is {} rather than a symbolic link",
                        fs_type_name(other)
                    )));
                }
            }
        }

        if self.opts.wet_run {
            return Ok(StepResult {
                modified: true,
                ..StepResult::default()
            });
        }

        let command = remote::symlink_command(link_target, target);
        let timeout = self.session.timeouts().command;
        let out = self.session.exec(&command, None, timeout)?;
        if !out.success() {
            return Err(remote_exec_error(&command, &out));
        }
        Ok(StepResult {
            modified: true,
            created: !pre.exists,
            ..StepResult::default()
        })
    }

    fn apply_directory(&mut self, artifact: &Artifact) -> Result<StepResult, DeployError> {
        let target = artifact.target_path.as_str();
        let pre = self.probe(target)?;

        if pre.exists && pre.fs_type != RemoteFsType::Directory {
            return Err(DeployError::Conflict(format!(
                "{target} exists and is {} rather than a directory",
                fs_type_name(&pre.fs_type)
            )));
        }

        if !pre.exists {
            if self.opts.wet_run {
                return Ok(StepResult {
                    modified: true,
                    ..StepResult::default()
                });
            }
            let timeout = self.session.timeouts().command;
            let mkdir = remote::mkdir_parents_command(target);
            let out = self.session.exec(&mkdir, None, timeout)?;
            if !out.success() && classify_stderr(&out.stderr) != RemoteErrorKind::AlreadyExists {
                return Err(remote_exec_error(&mkdir, &out));
            }
            self.apply_metadata(artifact, target)?;
            return Ok(StepResult {
                modified: true,
                created: true,
                ..StepResult::default()
            });
        }

        let metadata_diff = self.opts.force || metadata_differs(&pre, artifact);
        if !metadata_diff {
            return Ok(StepResult::default());
        }
        if self.opts.wet_run {
            return Ok(StepResult {
                modified: true,
                ..StepResult::default()
            });
        }
        self.apply_metadata(artifact, target)?;
        Ok(StepResult {
            modified: true,
            ..StepResult::default()
        })
    }

    /// The reload sub-machine, fired after each successful artifact.
    fn after_success(&mut self, artifact: &Artifact, step: StepResult) -> Result<(), DeployError> {
        let list = self.list;
        let Some(id) = list.reload_id_by_file.get(&artifact.repo_path) else {
            return Ok(());
        };

        {
            let state = self.reload.entry(id.clone()).or_default();
            state.deployed += 1;
            if step.modified || self.opts.force {
                state.ready = true;
            }
            state.applied.push(GroupMember {
                file: artifact.repo_path.clone(),
                target: artifact.target_path.clone(),
                backup: step.backup,
                created: step.created && step.modified,
            });
        }

        let total = list.total_by_reload_id.get(id).copied().unwrap_or(0);
        let state_ready = self.reload.get(id).map(|s| (s.deployed, s.ready));
        let Some((deployed, ready)) = state_ready else {
            return Ok(());
        };
        let reloads_allowed = !self.opts.disable_reloads || self.opts.force;
        if deployed == total && ready && reloads_allowed {
            self.fire_reload(id.clone())?;
        }
        Ok(())
    }

    /// Run a group's reload commands, at most once per deployment.
    fn fire_reload(&mut self, id: String) -> Result<(), DeployError> {
        let commands = self
            .list
            .commands_by_reload_id
            .get(&id)
            .cloned()
            .unwrap_or_default();
        let timeout = self.session.timeouts().command;

        for (idx, command) in commands.iter().enumerate() {
            if self.opts.wet_run {
                continue;
            }
            // A lost transport stays host-fatal; anything else (timeout,
            // non-zero exit) is a group failure.
            let out = match self.session.exec(command, None, timeout) {
                Ok(out) => out,
                Err(err @ DeployError::Transport(_)) => return Err(err),
                Err(err) => {
                    self.abort_group(&id, &err);
                    return Ok(());
                }
            };
            if !out.success() {
                if idx > 0 {
                    self.reporter.warn(&format!(
                        "reload command {} of group failed after earlier commands succeeded on {}; the service may be in an inconsistent state",
                        idx + 1,
                        self.host
                    ));
                }
                let cause = remote_exec_error(command, &out);
                self.abort_group(&id, &cause);
                return Ok(());
            }
        }

        self.reload.remove(&id);
        Ok(())
    }

    /// A member of `artifact`'s reload group failed: roll the applied
    /// members back and poison the group.
    fn abort_group_of(&mut self, artifact: &Artifact, cause: &DeployError) {
        let Some(id) = self.list.reload_id_by_file.get(&artifact.repo_path).cloned() else {
            return;
        };
        self.abort_group(&id, cause);
    }

    fn abort_group(&mut self, id: &str, cause: &DeployError) {
        self.poisoned.insert(id.to_string());
        let Some(state) = self.reload.remove(id) else {
            return;
        };

        for member in state.applied {
            self.restore(&member.target, &member.backup, member.created);
            self.metrics.mark_failed(
                &self.host,
                &member.file,
                &DeployError::Conflict(format!("rolled back with its reload group: {cause}")),
            );
        }
    }

    fn probe(&mut self, target: &str) -> Result<RemoteFileInfo, DeployError> {
        let command = remote::stat_command(self.session.os(), target);
        let timeout = self.session.timeouts().command;
        let out = self.session.exec(&command, None, timeout)?;
        if !out.success() {
            return match classify_stderr(&out.stderr) {
                RemoteErrorKind::NotFound => Ok(RemoteFileInfo::absent(target)),
                _ => Err(remote_exec_error(&command, &out)),
            };
        }
        remote::parse_stat_output(&out.stdout)
    }

    fn hash_remote(&mut self, target: &str) -> Result<String, DeployError> {
        let command = remote::hash_command(self.session.os(), target);
        let timeout = self.session.timeouts().hash;
        let out = self.session.exec(&command, None, timeout)?;
        if !out.success() {
            return Err(remote_exec_error(&command, &out));
        }
        remote::find_sha256(&out.stdout).ok_or_else(|| {
            DeployError::Conflict(format!("no digest in hash output for {target}"))
        })
    }

    /// Copy the pre-mutation file into the backup directory, keyed by the
    /// encoded target path.
    fn backup(&mut self, target: &str, pre: &RemoteFileInfo) -> Result<BackupInfo, DeployError> {
        let key = URL_SAFE_NO_PAD.encode(target);
        let backup_path = format!(
            "{}/{}",
            self.session.endpoint().remote_backup_dir.trim_end_matches('/'),
            key
        );
        let command = remote::copy_command(target, &backup_path);
        let timeout = self.session.timeouts().hash;
        let out = self.session.exec(&command, None, timeout)?;
        if !out.success() {
            return Err(remote_exec_error(&command, &out));
        }
        Ok(BackupInfo {
            backup_path,
            pre: pre.clone(),
        })
    }

    /// Put the pre-mutation state back. A failed restore is a warning;
    /// the original mutation failure stays the root cause.
    fn restore(&mut self, target: &str, backup: &Option<BackupInfo>, created: bool) {
        if self.opts.wet_run {
            return;
        }
        if let Err(err) = self.try_restore(target, backup, created) {
            self.reporter.warn(&format!("{err}"));
        }
    }

    fn try_restore(
        &mut self,
        target: &str,
        backup: &Option<BackupInfo>,
        created: bool,
    ) -> Result<(), DeployError> {
        let command_timeout = self.session.timeouts().command;
        let hash_timeout = self.session.timeouts().hash;

        let Some(backup) = backup else {
            if created {
                let command = remote::remove_command(target);
                let out = self.session.exec(&command, None, command_timeout)?;
                if !out.success() && classify_stderr(&out.stderr) != RemoteErrorKind::NotFound {
                    return Err(DeployError::RestoreFailed(format!(
                        "could not remove partially created {target}: {}",
                        out.stderr.trim()
                    )));
                }
            }
            return Ok(());
        };

        let mv = remote::move_command(&backup.backup_path, target);
        let out = self.session.exec(&mv, None, command_timeout)?;
        if !out.success() {
            return Err(DeployError::RestoreFailed(format!(
                "could not move backup into place for {target}: {}",
                out.stderr.trim()
            )));
        }

        for command in [
            remote::chmod_command(backup.pre.permissions, target),
            remote::chown_command(&format!("{}:{}", backup.pre.owner, backup.pre.group), target),
        ] {
            let out = self.session.exec(&command, None, hash_timeout)?;
            if !out.success() {
                return Err(DeployError::RestoreFailed(format!(
                    "could not restore metadata of {target}: {}",
                    out.stderr.trim()
                )));
            }
        }

        if let Some(expected) = &backup.pre.hash {
            let actual = self.hash_remote(target).map_err(|e| {
                DeployError::RestoreFailed(format!("could not verify restored {target}: {e}"))
            })?;
            if actual != *expected {
                return Err(DeployError::RestoreFailed(format!(
                    "restored {target} hashes to {actual}, expected {expected}"
                )));
            }
        }
        Ok(())
    }

    /// The transport is gone: everything not yet attempted fails as a
    /// host-level casualty.
    fn mark_rest_unreachable(&mut self, remaining: &[String]) {
        let artifacts = self.artifacts;
        for file in remaining {
            let action = artifacts
                .get(file)
                .map(|a| a.action)
                .unwrap_or(ActionKind::Create);
            self.metrics.record_failure(
                &self.host,
                file,
                action,
                &DeployError::Transport("host session lost before this artifact".to_string()),
            );
        }
    }
}

fn diff_create(pre: &RemoteFileInfo, artifact: &Artifact) -> (bool, bool) {
    if !pre.exists {
        return (true, true);
    }
    let content_diff = pre.hash.as_deref() != Some(artifact.content_hash.as_str());
    let metadata_diff = metadata_differs(pre, artifact);
    (content_diff, metadata_diff)
}

fn metadata_differs(pre: &RemoteFileInfo, artifact: &Artifact) -> bool {
    let owner_group = format!("{}:{}", pre.owner, pre.group);
    pre.permissions != artifact.permissions || owner_group != artifact.owner_group
}

fn fs_type_name(fs_type: &RemoteFsType) -> &str {
    match fs_type {
        RemoteFsType::Regular => "a regular file",
        RemoteFsType::Directory => "a directory",
        RemoteFsType::Symlink => "a symbolic link",
        RemoteFsType::Other(_) => "an unsupported filesystem object",
    }
}
