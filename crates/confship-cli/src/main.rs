use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

use confship::config::ConfigFile;
use confship::engine::{self, DeploySpec};
use confship::types::{DeployMode, RuntimeOptions};

mod progress;

use progress::ConsoleReporter;

#[derive(Parser, Debug)]
#[command(name = "confship", version)]
#[command(about = "Atomic SSH deployment of configuration files from a git repository")]
struct Cli {
    /// Path to the configuration repository.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Path to the host inventory (default: <repo>/inventory).
    #[arg(long)]
    inventory: Option<PathBuf>,

    /// Commit to deploy (default: HEAD). Failure replays ignore this and
    /// pin the retry file's commit.
    #[arg(long)]
    commit: Option<String>,

    /// Restrict the run to these hosts or group names (comma-separated).
    #[arg(long, default_value = "")]
    hosts: String,

    /// Restrict the run to these repository files (comma-separated).
    #[arg(long, default_value = "")]
    files: String,

    /// Treat --hosts/--files tokens as anchored regular expressions.
    #[arg(long)]
    regex: bool,

    /// Deploy to hosts marked offline as well.
    #[arg(long)]
    offline: bool,

    /// Probe and diff, but make no change on any host.
    #[arg(long)]
    wet_run: bool,

    /// Treat every artifact as differing; still backup and verify.
    #[arg(long)]
    force: bool,

    /// Run Install hooks from artifact metadata.
    #[arg(long)]
    install_hooks: bool,

    /// Never run reload commands. Note that reload-group membership
    /// depends on command order: rearranged Reload arrays form distinct
    /// groups.
    #[arg(long)]
    no_reloads: bool,

    /// Run remote commands without sudo.
    #[arg(long)]
    no_sudo: bool,

    /// Bound on concurrently deploying hosts; 1 is serial and fail-fast.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Timeout for ordinary remote commands (e.g. 10s, 500ms).
    #[arg(long)]
    command_timeout: Option<String>,

    /// Timeout for SSH connection establishment (e.g. 30s).
    #[arg(long)]
    connect_timeout: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a deployment (commit delta by default).
    Deploy {
        /// Deploy the full tree instead of the commit delta.
        #[arg(long, conflicts_with = "failures")]
        all: bool,
        /// Replay the failures recorded by the previous run, at the
        /// commit that run deployed.
        #[arg(long)]
        failures: bool,
    },
    /// Print the per-host deployment lists without connecting anywhere.
    Plan {
        /// Plan the full tree instead of the commit delta.
        #[arg(long, conflicts_with = "failures")]
        all: bool,
        /// Plan the recorded failure subset.
        #[arg(long)]
        failures: bool,
    },
    /// Generate shell completions.
    Completion {
        shell: clap_complete::Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("deployment failed:");
            eprintln!("{}", render_error_cascade(&err));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mode = |all: bool, failures: bool| {
        if failures {
            DeployMode::Failures
        } else if all {
            DeployMode::All
        } else {
            DeployMode::Changes
        }
    };

    match &cli.cmd {
        Commands::Completion { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(*shell, &mut command, name, &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan { all, failures } => {
            let opts = build_options(&cli, mode(*all, *failures))?;
            let spec = build_spec(&cli);
            let (_, plan) = engine::plan_deployment(&spec, &opts)?;

            for warning in &plan.warnings {
                eprintln!("[warn] {warning}");
            }
            println!("commit {}", plan.commit_id);
            for host in &plan.hosts {
                println!("{} ({} items)", host.endpoint.name, host.list.files.len());
                for file in &host.list.files {
                    let action = plan
                        .artifact(file)
                        .map(|a| a.action.as_str())
                        .unwrap_or("create");
                    println!("  {action:<10} {file}");
                }
            }
            if plan.hosts.is_empty() {
                println!("nothing to deploy");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Deploy { all, failures } => {
            let opts = build_options(&cli, mode(*all, *failures))?;
            let spec = build_spec(&cli);

            let reporter: Mutex<ConsoleReporter> = Mutex::new(ConsoleReporter::new());
            let outcome = engine::run_deploy(&spec, &opts, &reporter)?;
            reporter
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .finish();

            println!(
                "{}",
                serde_json::to_string_pretty(&outcome.summary)
                    .context("failed to render the summary report")?
            );
            if let Some(path) = &outcome.retry_file {
                eprintln!("[warn] failures recorded in {}", path.display());
            }

            Ok(if outcome.summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn build_spec(cli: &Cli) -> DeploySpec {
    DeploySpec {
        repo_root: cli.repo.clone(),
        inventory_path: cli
            .inventory
            .clone()
            .unwrap_or_else(|| cli.repo.join("inventory")),
        commit: cli.commit.clone(),
        authored_commit: None,
    }
}

/// Defaults, then `.confship.toml`, then CLI flags.
fn build_options(cli: &Cli, mode: DeployMode) -> Result<RuntimeOptions> {
    let mut opts = RuntimeOptions::default();
    if let Some(config) = ConfigFile::load(&cli.repo)? {
        config.apply_to(&mut opts);
    }

    opts.mode = mode;
    opts.host_override = cli.hosts.clone();
    opts.file_override = cli.files.clone();
    opts.regex_overrides |= cli.regex;
    opts.allow_offline |= cli.offline;
    opts.wet_run |= cli.wet_run;
    opts.force |= cli.force;
    opts.run_install_hooks |= cli.install_hooks;
    opts.disable_reloads |= cli.no_reloads;
    opts.disable_sudo |= cli.no_sudo;
    if let Some(concurrency) = cli.concurrency {
        anyhow::ensure!(concurrency >= 1, "--concurrency must be at least 1");
        opts.ssh_concurrency = concurrency;
    }
    if let Some(raw) = &cli.command_timeout {
        opts.timeouts.command = parse_duration(raw)?;
    }
    if let Some(raw) = &cli.connect_timeout {
        opts.timeouts.connect = parse_duration(raw)?;
    }
    Ok(opts)
}

fn parse_duration(raw: &str) -> Result<std::time::Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid duration {raw:?}"))
}

/// Render the error chain colon-separated layers indented one per line,
/// deepest layer last, so the root cause stays visible.
fn render_error_cascade(err: &anyhow::Error) -> String {
    let mut depth = 0;
    let mut out = Vec::new();
    for cause in err.chain() {
        for layer in cause.to_string().split(": ") {
            depth += 1;
            out.push(format!("{}{layer}", "  ".repeat(depth)));
        }
    }
    out.join("\n")
}
