//! The remote execution seam.
//!
//! Everything a deployment does to a host goes through the [`Transport`]
//! trait: one string command in, exit code and captured output back. The
//! production implementation drives the system `ssh` binary with
//! ControlMaster multiplexing, so a host gets exactly one SSH session no
//! matter how many commands a deployment runs. [`LocalTransport`] runs
//! the same commands in a local shell and backs the test suite and
//! rehearsals against a scratch directory.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::process::{self, run_with_timeout};
use crate::types::Endpoint;

/// Output of one remote command.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

impl From<process::ExecOutput> for RemoteOutput {
    fn from(out: process::ExecOutput) -> Self {
        Self {
            exit_code: out.exit_code,
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: out.stderr,
            timed_out: out.timed_out,
        }
    }
}

/// One host's command channel.
pub trait Transport: Send {
    /// Run a shell command on the host, optionally feeding stdin, bounded
    /// by the timeout.
    fn execute(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RemoteOutput>;

    /// Tear the channel down. Idempotent; also invoked on drop paths.
    fn close(&mut self);
}

/// Serializes known-hosts appends across concurrent host workers.
static KNOWN_HOSTS_LOCK: Mutex<()> = Mutex::new(());

/// Append-on-first-sight known-hosts handling.
///
/// The file is only ever appended, under a process-wide lock, and only
/// when the address is not yet present.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The user's default known_hosts file.
    pub fn default_path() -> PathBuf {
        std::env::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh")
            .join("known_hosts")
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Scan and append the host key when the address is not yet known.
    pub fn ensure(&self, address: &str, port: u16) -> Result<()> {
        let _guard = KNOWN_HOSTS_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        let needle = if port == 22 {
            address.to_string()
        } else {
            format!("[{address}]:{port}")
        };
        if existing.lines().any(|l| line_names_host(l, &needle)) {
            return Ok(());
        }

        let port_arg = port.to_string();
        let out = run_with_timeout(
            "ssh-keyscan",
            &["-p", &port_arg, address],
            None,
            Some(Duration::from_secs(10)),
        )
        .context("ssh-keyscan failed to run")?;
        let keys = out.stdout_trimmed();
        if !out.success() || keys.is_empty() {
            anyhow::bail!("ssh-keyscan produced no keys for {address}: {}", out.stderr.trim());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&keys);
        content.push('\n');
        std::fs::write(&self.path, content)
            .with_context(|| format!("cannot write {}", self.path.display()))?;
        Ok(())
    }
}

fn line_names_host(line: &str, needle: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|hosts| hosts.split(',').any(|h| h == needle))
}

/// SSH transport over the system `ssh` binary.
///
/// A ControlMaster connection is established once per host; every later
/// command reuses the multiplexed session through the control socket.
pub struct SshTransport {
    destination: String,
    port: u16,
    identity_file: Option<PathBuf>,
    proxy_jump: Option<String>,
    control_path: PathBuf,
    connect_timeout: Duration,
    connected: bool,
    // Keeps the socket directory alive for the session's lifetime.
    _control_dir: tempfile::TempDir,
}

impl SshTransport {
    /// Prepare a transport for an endpoint; no connection is made yet.
    pub fn new(
        endpoint: &Endpoint,
        proxy: Option<&Endpoint>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let control_dir = tempfile::Builder::new()
            .prefix("confship-ssh-")
            .tempdir()
            .context("cannot create control socket directory")?;
        let control_path = control_dir.path().join("control");

        Ok(Self {
            destination: format!("{}@{}", endpoint.login_user, endpoint.address),
            port: endpoint.port,
            identity_file: endpoint.identity_file.clone(),
            proxy_jump: proxy.map(|p| format!("{}@{}:{}", p.login_user, p.address, p.port)),
            control_path,
            connect_timeout,
            connected: false,
            _control_dir: control_dir,
        })
    }

    /// Open the master connection.
    pub fn connect(&mut self, known_hosts: &KnownHosts) -> Result<()> {
        let address = self
            .destination
            .split_once('@')
            .map(|(_, a)| a)
            .unwrap_or(&self.destination);
        known_hosts.ensure(address, self.port)?;

        let args = self.base_args(&[
            "-o",
            "ControlMaster=yes",
            "-o",
            "ControlPersist=10m",
            "--",
            &self.destination,
            "true",
        ]);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = run_with_timeout("ssh", &arg_refs, None, Some(self.connect_timeout))
            .context("ssh failed to spawn")?;
        if out.timed_out {
            anyhow::bail!(
                "connection to {} timed out after {}",
                self.destination,
                humantime::format_duration(self.connect_timeout)
            );
        }
        if !out.success() {
            anyhow::bail!("connection to {} failed: {}", self.destination, out.stderr.trim());
        }
        self.connected = true;
        Ok(())
    }

    fn base_args(&self, tail: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".into(),
            self.port.to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".into());
            args.push(identity.display().to_string());
        }
        if let Some(jump) = &self.proxy_jump {
            args.push("-J".into());
            args.push(jump.clone());
        }
        args.extend(tail.iter().map(|s| s.to_string()));
        args
    }
}

impl Transport for SshTransport {
    fn execute(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RemoteOutput> {
        anyhow::ensure!(self.connected, "transport is not connected");
        let args = self.base_args(&["--", &self.destination, command]);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = run_with_timeout("ssh", &arg_refs, stdin, Some(timeout))
            .context("ssh failed to spawn")?;
        Ok(out.into())
    }

    fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        let args = self.base_args(&["-O", "exit", "--", &self.destination]);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let _ = run_with_timeout("ssh", &arg_refs, None, Some(Duration::from_secs(5)));
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs commands in a local shell instead of over SSH.
///
/// Backs the test suite and `--wet-run` rehearsals against a scratch
/// directory; the command dialect is identical to the SSH path.
#[derive(Debug, Default)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn execute(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RemoteOutput> {
        let out = run_with_timeout("sh", &["-c", command], stdin, Some(timeout))?;
        Ok(out.into())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::*;

    /// One scripted exchange: the command must contain `expect`, and the
    /// transport answers with the canned output.
    pub(crate) struct Step {
        pub expect: &'static str,
        pub exit_code: i32,
        pub stdout: String,
        pub stderr: String,
        pub timed_out: bool,
    }

    impl Step {
        pub(crate) fn ok(expect: &'static str, stdout: &str) -> Self {
            Self {
                expect,
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
                timed_out: false,
            }
        }

        pub(crate) fn fail(expect: &'static str, exit_code: i32, stderr: &str) -> Self {
            Self {
                expect,
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
                timed_out: false,
            }
        }
    }

    /// Transport that replays a script and records every command it saw.
    pub(crate) struct ScriptedTransport {
        pub steps: VecDeque<Step>,
        pub commands: Vec<String>,
        pub closed: bool,
    }

    impl ScriptedTransport {
        pub(crate) fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                commands: Vec::new(),
                closed: false,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn execute(
            &mut self,
            command: &str,
            _stdin: Option<&[u8]>,
            _timeout: Duration,
        ) -> Result<RemoteOutput> {
            self.commands.push(command.to_string());
            let step = self
                .steps
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected command: {command}"));
            assert!(
                command.contains(step.expect),
                "expected command containing {:?}, got {command:?}",
                step.expect
            );
            Ok(RemoteOutput {
                exit_code: step.exit_code,
                stdout: step.stdout,
                stderr: step.stderr,
                timed_out: step.timed_out,
            })
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }
}
