//! Local process execution with timeout support.
//!
//! Everything the controller runs locally — git, ssh, predeploy hooks —
//! goes through [`run_with_timeout`]. Standard output is captured as raw
//! bytes because git blobs are not guaranteed to be UTF-8.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Result of a command execution with timeout bookkeeping.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Exit code (or -1 when not available)
    pub exit_code: i32,
    /// Captured stdout, byte-safe.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: String,
    /// Whether execution exceeded the timeout.
    pub timed_out: bool,
    /// Total wall-clock duration.
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stdout as text, lossily decoded and trimmed.
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Run a command, optionally feeding stdin, killing it at the deadline.
///
/// Stdin is written from a separate thread so a large payload cannot
/// deadlock against a filling output pipe.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<ExecOutput> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {program}"))?;

    let writer = stdin.map(|bytes| {
        let mut pipe = child.stdin.take().expect("stdin was requested");
        let bytes = bytes.to_vec();
        thread::spawn(move || {
            let _ = pipe.write_all(&bytes);
            // Dropping the pipe closes the child's stdin.
        })
    });

    // Drain output on threads as well; waiting for exit before reading
    // deadlocks once a pipe buffer fills.
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = timeout.map(|t| Instant::now() + t);
    let (exit_code, timed_out) = loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll command: {program}"))?
        {
            Some(status) => break (status.code().unwrap_or(-1), false),
            None => {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        break (-1, true);
                    }
                }
                thread::sleep(Duration::from_millis(20));
            }
        }
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }
    let stdout = stdout_reader.map(join_reader).unwrap_or_default();
    let mut stderr = String::from_utf8_lossy(&stderr_reader.map(join_reader).unwrap_or_default())
        .to_string();

    if timed_out {
        if let Some(t) = timeout {
            stderr.push_str(&format!(
                "\n{} timed out after {}",
                program,
                humantime::format_duration(t)
            ));
        }
    }

    Ok(ExecOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Run a shell fragment locally (predeploy hooks).
pub fn run_shell(fragment: &str, timeout: Option<Duration>) -> Result<ExecOutput> {
    run_with_timeout("sh", &["-c", fragment], None, timeout)
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        buffer
    })
}

fn join_reader(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}
