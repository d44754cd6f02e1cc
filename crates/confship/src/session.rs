//! One host's deployment session.
//!
//! A session owns the transport for exactly one host: it resolves
//! credentials, opens the SSH channel (through a jump host when
//! configured), probes the OS family, provisions the backup directory,
//! and exposes the single `exec` primitive every later step uses.
//! Cleanup deletes the scratch paths and closes the channel on every
//! exit path.

use std::time::Duration;

use confship_vault::Vault;

use crate::remote::{self, OsFamily, RemoteErrorKind, classify_stderr, shell_quote};
use crate::transport::{KnownHosts, RemoteOutput, SshTransport, Transport};
use crate::types::{DeployError, Endpoint, RuntimeOptions, Timeouts};

/// Resolve the sudo password for a host, if it needs one.
///
/// The vault file named by the inventory is decrypted with the
/// passphrase from the configured environment variable; the core only
/// ever sees the resolved password.
pub fn resolve_sudo_password(
    endpoint: &Endpoint,
    opts: &RuntimeOptions,
) -> Result<Option<String>, DeployError> {
    if !endpoint.password_required {
        return Ok(None);
    }
    let vault_path = endpoint.password_vault.as_deref().ok_or_else(|| {
        DeployError::Auth(format!("host {} has no vault configured", endpoint.name))
    })?;
    let passphrase = std::env::var(&opts.vault_passphrase_env).map_err(|_| {
        DeployError::Auth(format!(
            "vault passphrase environment variable {} is not set",
            opts.vault_passphrase_env
        ))
    })?;
    let vault = Vault::open(std::path::Path::new(vault_path), &passphrase)
        .map_err(|e| DeployError::Auth(format!("{e:#}")))?;
    let password = vault.lookup(&endpoint.name).ok_or_else(|| {
        DeployError::Auth(format!(
            "vault {vault_path} has no entry for {}",
            endpoint.name
        ))
    })?;
    Ok(Some(password.to_string()))
}

/// A live session against one host.
pub struct Session {
    endpoint: Endpoint,
    transport: Box<dyn Transport>,
    os: OsFamily,
    sudo_password: Option<String>,
    disable_sudo: bool,
    timeouts: Timeouts,
    cleaned_up: bool,
}

impl Session {
    /// Wrap an already-open transport. The OS is probed in
    /// [`Session::initialize`].
    pub fn new(
        transport: Box<dyn Transport>,
        endpoint: Endpoint,
        sudo_password: Option<String>,
        opts: &RuntimeOptions,
    ) -> Self {
        Self {
            endpoint,
            transport,
            os: OsFamily::Unknown,
            sudo_password,
            disable_sudo: opts.disable_sudo,
            timeouts: opts.timeouts.clone(),
            cleaned_up: false,
        }
    }

    /// Open an SSH session for an endpoint, dialing the proxy first when
    /// one is configured.
    pub fn open_ssh(
        endpoint: &Endpoint,
        proxy: Option<&Endpoint>,
        opts: &RuntimeOptions,
        known_hosts: &KnownHosts,
    ) -> Result<Self, DeployError> {
        let sudo_password = resolve_sudo_password(endpoint, opts)?;

        let mut transport = SshTransport::new(endpoint, proxy, opts.timeouts.connect)
            .map_err(|e| DeployError::Transport(format!("{e:#}")))?;
        transport
            .connect(known_hosts)
            .map_err(|e| DeployError::Transport(format!("{e:#}")))?;

        let mut session = Self::new(Box::new(transport), endpoint.clone(), sudo_password, opts);
        session.initialize(opts.wet_run)?;
        Ok(session)
    }

    /// Probe the OS family and provision the backup directory.
    pub fn initialize(&mut self, wet_run: bool) -> Result<(), DeployError> {
        let probe = self.exec_raw(&remote::uname_command(), None, self.timeouts.os_probe)?;
        if !probe.success() {
            return Err(DeployError::RemoteExec {
                command: remote::uname_command(),
                exit_code: probe.exit_code,
                stderr: probe.stderr.trim().to_string(),
            });
        }
        self.os = OsFamily::classify(&probe.stdout);
        if self.os == OsFamily::Unknown {
            return Err(DeployError::Conflict(format!(
                "unsupported remote OS {:?} on {}",
                probe.stdout.trim(),
                self.endpoint.name
            )));
        }

        if !wet_run {
            let mkdir = remote::mkdir_command(&self.endpoint.remote_backup_dir);
            let out = self.exec(&mkdir, None, self.timeouts.command)?;
            if !out.success() && classify_stderr(&out.stderr) != RemoteErrorKind::AlreadyExists {
                return Err(remote_exec_error(&mkdir, &out));
            }
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn os(&self) -> OsFamily {
        self.os
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Run a command with privilege elevation.
    ///
    /// Unless sudo is disabled or the login user is already root, the
    /// command is wrapped in `sudo -S` with the vault password fed on
    /// stdin ahead of any payload; the password never appears in the
    /// command line.
    pub fn exec(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RemoteOutput, DeployError> {
        if self.disable_sudo || self.endpoint.login_user == "root" {
            return self.exec_raw(command, stdin, timeout);
        }

        let wrapped = match &self.sudo_password {
            Some(_) => format!("sudo -S -p '' -- sh -c {}", shell_quote(command)),
            None => format!("sudo -n -- sh -c {}", shell_quote(command)),
        };

        let owned;
        let stdin = match (&self.sudo_password, stdin) {
            (Some(password), Some(payload)) => {
                let mut bytes = Vec::with_capacity(password.len() + 1 + payload.len());
                bytes.extend_from_slice(password.as_bytes());
                bytes.push(b'\n');
                bytes.extend_from_slice(payload);
                owned = bytes;
                Some(owned.as_slice())
            }
            (Some(password), None) => {
                owned = format!("{password}\n").into_bytes();
                Some(owned.as_slice())
            }
            (None, payload) => payload,
        };

        self.exec_raw(&wrapped, stdin, timeout)
    }

    /// Run a command without privilege elevation.
    pub fn exec_raw(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RemoteOutput, DeployError> {
        let out = self
            .transport
            .execute(command, stdin, timeout)
            .map_err(|e| DeployError::Transport(format!("{e:#}")))?;
        if out.timed_out {
            return Err(DeployError::Timeout {
                command: command.to_string(),
                timeout,
            });
        }
        Ok(out)
    }

    /// Delete the scratch paths and close the channel. Best-effort:
    /// failures surface as warnings, never as errors.
    pub fn cleanup(&mut self) -> Vec<String> {
        if self.cleaned_up {
            return Vec::new();
        }
        self.cleaned_up = true;

        let mut warnings = Vec::new();
        for path in [
            self.endpoint.remote_transfer_buffer.clone(),
            self.endpoint.remote_backup_dir.clone(),
        ] {
            let command = remote::remove_tree_command(&path);
            let timeout = self.timeouts.command;
            match self.exec(&command, None, timeout) {
                Ok(out) if out.success() => {}
                Ok(out) => warnings.push(format!(
                    "cleanup of {path} on {} failed: {}",
                    self.endpoint.name,
                    out.stderr.trim()
                )),
                Err(e) => warnings.push(format!(
                    "cleanup of {path} on {} failed: {e}",
                    self.endpoint.name
                )),
            }
        }
        self.transport.close();
        warnings
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Cleanup normally ran already; this covers panic unwinds.
        self.transport.close();
    }
}

/// Convert a failed command into the taxonomy.
pub fn remote_exec_error(command: &str, out: &RemoteOutput) -> DeployError {
    DeployError::RemoteExec {
        command: command.to_string(),
        exit_code: out.exit_code,
        stderr: out.stderr.trim().to_string(),
    }
}
