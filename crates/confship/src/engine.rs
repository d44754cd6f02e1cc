//! The deployment engine: read, plan, fan out, collect, report.
//!
//! Hosts deploy independently on worker threads bounded by the SSH
//! concurrency limit; within a host, artifacts run strictly in planner
//! order. Worker panics are caught and recorded as host failures, never
//! unwound across the join. With concurrency 1 the engine is serial and
//! fail-fast: a host-level failure halts further dispatch.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use confship_retry::RetryFile;

use crate::apply::Applicator;
use crate::inventory::Inventory;
use crate::metrics::{Metrics, Summary};
use crate::plan::{DeploymentPlan, HostPlan, build_plan};
use crate::repository::{Repository, read_snapshot};
use crate::session::Session;
use crate::transport::KnownHosts;
use crate::types::{DeployError, DeployMode, Endpoint, RuntimeOptions};

/// Sink for engine progress and warnings.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that stores everything it is told. Used by tests and by
/// embedders that render output themselves.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    pub infos: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Reporter for CollectingReporter {
    fn info(&mut self, msg: &str) {
        self.infos.push(msg.to_string());
    }

    fn warn(&mut self, msg: &str) {
        self.warnings.push(msg.to_string());
    }

    fn error(&mut self, msg: &str) {
        self.errors.push(msg.to_string());
    }
}

/// Per-worker handle on the shared reporter; locks per call so workers
/// interleave lines instead of blocking each other for a whole host.
struct SharedReporter<'a> {
    inner: &'a Mutex<dyn Reporter + Send>,
}

impl Reporter for SharedReporter<'_> {
    fn info(&mut self, msg: &str) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).info(msg);
    }

    fn warn(&mut self, msg: &str) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).warn(msg);
    }

    fn error(&mut self, msg: &str) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).error(msg);
    }
}

/// What to deploy and from where.
#[derive(Debug, Clone)]
pub struct DeploySpec {
    pub repo_root: PathBuf,
    pub inventory_path: PathBuf,
    /// Ref to deploy; `HEAD` when unset. Ignored by failure replays,
    /// which pin the retry file's commit.
    pub commit: Option<String>,
    /// Commit authored by this invocation. Eligible for rollback when
    /// the run dies before any remote side-effect.
    pub authored_commit: Option<String>,
}

/// Result of a deployment run.
#[derive(Debug)]
pub struct DeployOutcome {
    pub summary: Summary,
    /// Where the retry file was written, when any failure occurred.
    pub retry_file: Option<PathBuf>,
}

/// Opens the session for one host. The default implementation dials SSH;
/// tests substitute local transports.
pub type SessionFactory =
    dyn Fn(&Endpoint, Option<&Endpoint>, &RuntimeOptions) -> Result<Session, DeployError>
        + Send
        + Sync;

/// Compute the deployment plan without touching any host.
pub fn plan_deployment(
    spec: &DeploySpec,
    opts: &RuntimeOptions,
) -> Result<(Inventory, DeploymentPlan), DeployError> {
    let inventory = Inventory::load(&spec.inventory_path)?;
    let repo = Repository::open(&spec.repo_root)?;

    let retry = match opts.mode {
        DeployMode::Failures => {
            let path = inventory.retry_file_path();
            Some(RetryFile::load(&path).map_err(|e| {
                DeployError::LocalSetup(format!("cannot replay failures: {e}"))
            })?)
        }
        _ => None,
    };

    let commit = match &retry {
        Some(retry) => retry.commit_id.clone(),
        None => repo.resolve_commit(spec.commit.as_deref().unwrap_or("HEAD"))?,
    };

    let set = read_snapshot(&repo, &commit, &inventory.reader_config())?;
    let changes = match opts.mode {
        DeployMode::Changes => Some(repo.changed_paths(&commit)?),
        _ => None,
    };

    let plan = build_plan(&set, changes.as_deref(), retry.as_ref(), &inventory, opts)?;
    Ok((inventory, plan))
}

/// Run a full deployment over SSH.
pub fn run_deploy(
    spec: &DeploySpec,
    opts: &RuntimeOptions,
    reporter: &Mutex<dyn Reporter + Send>,
) -> Result<DeployOutcome, DeployError> {
    let known_hosts = KnownHosts::new(KnownHosts::default_path());
    let factory = move |endpoint: &Endpoint,
                        proxy: Option<&Endpoint>,
                        opts: &RuntimeOptions|
          -> Result<Session, DeployError> {
        Session::open_ssh(endpoint, proxy, opts, &known_hosts)
    };
    run_deploy_with(spec, opts, reporter, &factory)
}

/// Run a deployment with a custom session factory.
pub fn run_deploy_with(
    spec: &DeploySpec,
    opts: &RuntimeOptions,
    reporter: &Mutex<dyn Reporter + Send>,
    factory: &SessionFactory,
) -> Result<DeployOutcome, DeployError> {
    // Anything that fails in here happened before any remote side-effect,
    // so a commit this invocation authored can be withdrawn.
    let (inventory, plan) = match plan_deployment(spec, opts) {
        Ok(planned) => planned,
        Err(err) => {
            maybe_rollback(spec, reporter);
            return Err(err);
        }
    };

    {
        let mut rep = SharedReporter { inner: reporter };
        for warning in &plan.warnings {
            rep.warn(warning);
        }
        rep.info(&format!(
            "deploying commit {} to {} host(s), {} item(s)",
            &plan.commit_id[..12.min(plan.commit_id.len())],
            plan.hosts.len(),
            plan.total_items()
        ));
    }

    let metrics = Metrics::new();
    let proxies = proxy_map(&inventory, &plan)?;

    dispatch(&plan, &proxies, opts, &metrics, reporter, factory);

    metrics.finish();
    let summary = metrics.summary(&plan.commit_id);

    let retry_file = match metrics.build_retry_file(&plan.commit_id) {
        Some(retry) => {
            let path = inventory.retry_file_path();
            retry
                .write(&path)
                .map_err(|e| DeployError::LocalSetup(format!("cannot write retry file: {e}")))?;
            Some(path)
        }
        None => None,
    };

    Ok(DeployOutcome {
        summary,
        retry_file,
    })
}

/// Resolve each planned host's jump host up front; a dangling proxy name
/// is a configuration error, not a runtime surprise.
fn proxy_map(
    inventory: &Inventory,
    plan: &DeploymentPlan,
) -> Result<BTreeMap<String, Endpoint>, DeployError> {
    let mut proxies = BTreeMap::new();
    for host in &plan.hosts {
        if let Some(proxy_name) = &host.endpoint.proxy {
            let proxy = inventory.endpoint(proxy_name).ok_or_else(|| {
                DeployError::BadConfig(format!(
                    "host {} names unknown proxy {proxy_name}",
                    host.endpoint.name
                ))
            })?;
            proxies.insert(host.endpoint.name.clone(), proxy.clone());
        }
    }
    Ok(proxies)
}

fn dispatch(
    plan: &DeploymentPlan,
    proxies: &BTreeMap<String, Endpoint>,
    opts: &RuntimeOptions,
    metrics: &Metrics,
    reporter: &Mutex<dyn Reporter + Send>,
    factory: &SessionFactory,
) {
    let concurrency = opts.ssh_concurrency.max(1);

    if concurrency == 1 {
        // Serial mode is fail-fast: a host-level failure halts dispatch.
        for host_plan in &plan.hosts {
            let failed = run_worker(host_plan, plan, proxies, opts, metrics, reporter, factory)
                .is_err();
            if failed {
                SharedReporter { inner: reporter }.warn(&format!(
                    "halting dispatch after host-level failure on {}",
                    host_plan.endpoint.name
                ));
                break;
            }
        }
        return;
    }

    for batch in plan.hosts.chunks(concurrency) {
        thread::scope(|scope| {
            for host_plan in batch {
                scope.spawn(move || {
                    let _ = run_worker(host_plan, plan, proxies, opts, metrics, reporter, factory);
                });
            }
        });
    }
}

/// One host worker. Panics are caught and recorded; the return value only
/// signals host-level failure to the serial fail-fast path.
fn run_worker(
    host_plan: &HostPlan,
    plan: &DeploymentPlan,
    proxies: &BTreeMap<String, Endpoint>,
    opts: &RuntimeOptions,
    metrics: &Metrics,
    reporter: &Mutex<dyn Reporter + Send>,
    factory: &SessionFactory,
) -> Result<(), DeployError> {
    let host = host_plan.endpoint.name.clone();
    let result = catch_unwind(AssertUnwindSafe(|| {
        deploy_host(host_plan, plan, proxies, opts, metrics, reporter, factory)
    }));

    match result {
        Ok(outcome) => outcome,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| panic.downcast_ref::<&str>().copied())
                .unwrap_or("unknown panic");
            let err = DeployError::LocalSetup(format!("worker for {host} panicked: {detail}"));
            metrics.record_host_failure(&host, &format!("{err}"));
            Err(err)
        }
    }
}

fn deploy_host(
    host_plan: &HostPlan,
    plan: &DeploymentPlan,
    proxies: &BTreeMap<String, Endpoint>,
    opts: &RuntimeOptions,
    metrics: &Metrics,
    reporter: &Mutex<dyn Reporter + Send>,
    factory: &SessionFactory,
) -> Result<(), DeployError> {
    let endpoint = &host_plan.endpoint;
    let mut rep = SharedReporter { inner: reporter };

    let mut session = match factory(endpoint, proxies.get(&endpoint.name), opts) {
        Ok(session) => session,
        Err(err) => {
            // Session setup failed: every artifact of this host fails.
            metrics.record_host_failure(&endpoint.name, &format!("{err}"));
            for file in &host_plan.list.files {
                let action = plan
                    .artifacts
                    .get(file)
                    .map(|a| a.action)
                    .unwrap_or(crate::types::ActionKind::Create);
                metrics.record_failure(
                    &endpoint.name,
                    file,
                    action,
                    &DeployError::Skipped(format!("host setup failed: {err}")),
                );
            }
            rep.error(&format!("{}: session setup failed: {err}", endpoint.name));
            return Err(err);
        }
    };

    rep.info(&format!(
        "{}: deploying {} item(s)",
        endpoint.name,
        host_plan.list.files.len()
    ));

    let run_result = {
        let mut applicator = Applicator::new(
            &mut session,
            &host_plan.list,
            &plan.artifacts,
            &plan.payloads,
            metrics,
            opts,
            &mut rep,
        );
        applicator.run()
    };

    for warning in session.cleanup() {
        rep.warn(&warning);
    }

    match run_result {
        Ok(()) => Ok(()),
        Err(err) => {
            metrics.record_host_failure(&endpoint.name, &format!("{err}"));
            rep.error(&format!("{}: {err}", endpoint.name));
            Err(err)
        }
    }
}

/// Withdraw a commit this invocation authored, if any. Only called when
/// the run failed before any remote side-effect.
fn maybe_rollback(spec: &DeploySpec, reporter: &Mutex<dyn Reporter + Send>) {
    let Some(authored) = &spec.authored_commit else {
        return;
    };
    let mut rep = SharedReporter { inner: reporter };
    match Repository::open(&spec.repo_root).and_then(|repo| repo.rollback_commit(authored)) {
        Ok(()) => rep.warn(&format!("rolled back authored commit {authored}")),
        Err(err) => rep.warn(&format!("could not roll back commit {authored}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::process::Command;

    use tempfile::TempDir;

    use super::*;
    use crate::header::DELIMITER;
    use crate::metrics::Status;
    use crate::repository::sha256_hex;
    use crate::transport::LocalTransport;

    // End-to-end fixtures run against a scratch directory under /tmp:
    // repo paths are `web01/<scratch>/...`, so target paths land inside
    // the scratch directory, and the session rides a LocalTransport.
    struct World {
        repo_dir: TempDir,
        target_dir: TempDir,
        inventory_path: PathBuf,
        owner_group: String,
    }

    fn git(root: &Path, args: &[&str]) {
        let out = Command::new("git")
            .arg("-C")
            .arg(root)
            .args(args)
            .output()
            .expect("git runs");
        assert!(
            out.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn shell(cmd: &str) -> String {
        let out = Command::new("sh").args(["-c", cmd]).output().expect("shell");
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    impl World {
        fn new() -> Self {
            let repo_dir = TempDir::new().expect("repo dir");
            let target_dir = tempfile::Builder::new()
                .prefix("confship-e2e-")
                .tempdir_in("/tmp")
                .expect("target dir");

            git(repo_dir.path(), &["init", "-q", "-b", "main"]);
            git(repo_dir.path(), &["config", "user.email", "ops@example.invalid"]);
            git(repo_dir.path(), &["config", "user.name", "ops"]);

            let scratch = target_dir.path().display().to_string();
            let inventory_path = repo_dir.path().join("inventory");
            fs::write(
                &inventory_path,
                format!(
                    "Host web01\n    HostName 127.0.0.1\n    User root\n    RemoteBackupDir {scratch}/.backups\n    RemoteTransferBuffer {scratch}/.buffer\n"
                ),
            )
            .expect("write inventory");

            // Create targets do not create parent directories, so the
            // fixture provisions /etc inside the scratch root up front.
            fs::create_dir_all(target_dir.path().join("etc")).expect("etc dir");

            let user = shell("id -un");
            let group = shell("id -gn");

            Self {
                repo_dir,
                target_dir,
                inventory_path,
                owner_group: format!("{user}:{group}"),
            }
        }

        /// Repo path that lands inside the scratch directory.
        fn repo_path(&self, rel: &str) -> String {
            format!(
                "web01{}/{rel}",
                self.target_dir.path().display()
            )
        }

        /// Write an artifact owned by the current user so chown works
        /// without privileges. `extra` is additional header fields, e.g.
        /// `"Checks":["false"]`.
        fn write_artifact(&self, rel: &str, extra: &str, payload: &str) {
            let mut header = format!(r#"{{"FileOwnerGroup":"{}""#, self.owner_group);
            if !extra.is_empty() {
                header.push(',');
                header.push_str(extra);
            }
            header.push('}');

            let repo_rel = self.repo_path(rel);
            let path = self.repo_dir.path().join(&repo_rel);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(
                path,
                format!("{DELIMITER}\n{header}\n{DELIMITER}\n{payload}"),
            )
            .expect("write artifact");
        }

        fn commit(&self, message: &str) {
            git(self.repo_dir.path(), &["add", "-A"]);
            git(self.repo_dir.path(), &["commit", "-q", "-m", message]);
        }

        fn spec(&self) -> DeploySpec {
            DeploySpec {
                repo_root: self.repo_dir.path().to_path_buf(),
                inventory_path: self.inventory_path.clone(),
                commit: None,
                authored_commit: None,
            }
        }

        fn target(&self, rel: &str) -> PathBuf {
            self.target_dir.path().join(rel)
        }
    }

    fn local_factory(
        endpoint: &Endpoint,
        _proxy: Option<&Endpoint>,
        opts: &RuntimeOptions,
    ) -> Result<Session, DeployError> {
        let mut session = Session::new(
            Box::new(LocalTransport),
            endpoint.clone(),
            None,
            opts,
        );
        session.initialize(opts.wet_run)?;
        Ok(session)
    }

    fn deploy(world: &World, opts: &RuntimeOptions) -> DeployOutcome {
        let reporter: Mutex<CollectingReporter> = Mutex::new(CollectingReporter::default());
        run_deploy_with(&world.spec(), opts, &reporter, &local_factory).expect("deploy")
    }

    fn opts(mode: DeployMode) -> RuntimeOptions {
        RuntimeOptions {
            mode,
            // The local session runs commands as the current user.
            disable_sudo: true,
            ..RuntimeOptions::default()
        }
    }

    #[test]
    fn plain_create_deploys_and_verifies() {
        let world = World::new();
        world.write_artifact(
            "etc/hello.conf",
            r#""FilePermissions":644"#,
            "hi\n",
        );
        world.commit("add hello.conf");

        let outcome = deploy(&world, &opts(DeployMode::All));
        assert_eq!(outcome.summary.status, Status::Deployed);
        assert_eq!(outcome.summary.counters.hosts, 1);
        assert_eq!(outcome.summary.counters.items, 1);
        assert_eq!(outcome.summary.counters.items_completed, 1);
        assert!(outcome.retry_file.is_none());

        let deployed = fs::read(world.target("etc/hello.conf")).expect("deployed file");
        assert_eq!(deployed, b"hi\n");
        assert_eq!(sha256_hex(&deployed), sha256_hex(b"hi\n"));
    }

    #[test]
    fn second_run_is_idempotent() {
        let world = World::new();
        world.write_artifact("etc/hello.conf", r#""FilePermissions":644"#, "hi\n");
        world.commit("add hello.conf");

        let first = deploy(&world, &opts(DeployMode::All));
        assert_eq!(first.summary.status, Status::Deployed);

        let second = deploy(&world, &opts(DeployMode::All));
        assert_eq!(second.summary.status, Status::UpToDate);
        assert_eq!(second.summary.transferred_size, "0 Bytes");
    }

    #[test]
    fn changes_mode_deploys_only_the_commit_delta() {
        let world = World::new();
        world.write_artifact("etc/a.conf", "", "a\n");
        world.commit("add a");
        world.write_artifact("etc/b.conf", "", "b\n");
        world.commit("add b");

        let outcome = deploy(&world, &opts(DeployMode::Changes));
        assert_eq!(outcome.summary.counters.items, 1);
        assert!(world.target("etc/b.conf").exists());
        assert!(!world.target("etc/a.conf").exists());
    }

    #[test]
    fn failures_replay_reads_the_retry_file() {
        let world = World::new();
        world.write_artifact("etc/a.conf", "", "a\n");
        world.write_artifact("etc/b.conf", r#""Checks":["false"]"#, "b\n");
        world.commit("seed");
        let failing_commit = shell(&format!(
            "git -C '{}' rev-parse HEAD",
            world.repo_dir.path().display()
        ));

        let first = deploy(&world, &opts(DeployMode::All));
        assert_eq!(first.summary.status, Status::Partial);
        let retry_path = first.retry_file.expect("retry file written");
        let retry = RetryFile::load(&retry_path).expect("load retry");
        assert_eq!(retry.commit_id, failing_commit);
        assert_eq!(retry.failed_pairs().len(), 1);
        assert_eq!(retry.failed_pairs()[0].1, world.repo_path("etc/b.conf"));

        // A later commit repairs b, but the replay pins the recorded
        // commit, so the failing check is still in force: the replay
        // re-attempts exactly {(web01, b)} and fails again.
        world.write_artifact("etc/b.conf", "", "b\n");
        world.commit("repair b");

        let second = deploy(&world, &opts(DeployMode::Failures));
        assert_eq!(second.summary.counters.items, 1);
        assert_eq!(second.summary.status, Status::Failed);
    }

    #[test]
    fn wet_run_reports_without_touching_the_host() {
        let world = World::new();
        world.write_artifact("etc/hello.conf", "", "hi\n");
        world.commit("seed");

        let mut options = opts(DeployMode::All);
        options.wet_run = true;
        let outcome = deploy(&world, &options);

        assert_eq!(outcome.summary.status, Status::Deployed);
        assert!(!world.target("etc/hello.conf").exists());
        assert_eq!(outcome.summary.transferred_size, "0 Bytes");
    }

    #[test]
    fn dependency_failure_skips_dependents() {
        let world = World::new();
        world.write_artifact("etc/base.conf", r#""Checks":["false"]"#, "base\n");
        let dep = world.repo_path("etc/base.conf");
        world.write_artifact(
            "etc/app.conf",
            &format!(r#""Dependencies":["{dep}"]"#),
            "app\n",
        );
        world.commit("seed");

        let outcome = deploy(&world, &opts(DeployMode::All));
        assert_eq!(outcome.summary.status, Status::Failed);
        assert_eq!(outcome.summary.counters.items_failed, 2);
        assert!(!world.target("etc/app.conf").exists());
    }

    #[test]
    fn dependency_cycle_fails_before_any_worker() {
        let world = World::new();
        let a = world.repo_path("etc/a.conf");
        let b = world.repo_path("etc/b.conf");
        world.write_artifact("etc/a.conf", &format!(r#""Dependencies":["{b}"]"#), "a\n");
        world.write_artifact("etc/b.conf", &format!(r#""Dependencies":["{a}"]"#), "b\n");
        world.commit("seed");

        let reporter: Mutex<CollectingReporter> = Mutex::new(CollectingReporter::default());
        let err = run_deploy_with(
            &world.spec(),
            &opts(DeployMode::All),
            &reporter,
            &local_factory,
        )
        .expect_err("cycle must be fatal");
        assert!(matches!(err, DeployError::BadDependency(_)));
        assert!(!world.target("etc/a.conf").exists());
    }

    #[test]
    fn session_setup_failure_marks_every_item() {
        let world = World::new();
        world.write_artifact("etc/a.conf", "", "a\n");
        world.write_artifact("etc/b.conf", "", "b\n");
        world.commit("seed");

        let failing_factory = |_: &Endpoint,
                               _: Option<&Endpoint>,
                               _: &RuntimeOptions|
         -> Result<Session, DeployError> {
            Err(DeployError::Auth("key rejected".to_string()))
        };

        let reporter: Mutex<CollectingReporter> = Mutex::new(CollectingReporter::default());
        let outcome = run_deploy_with(
            &world.spec(),
            &opts(DeployMode::All),
            &reporter,
            &failing_factory,
        )
        .expect("deploy outcome");

        assert_eq!(outcome.summary.status, Status::Failed);
        assert_eq!(outcome.summary.counters.items_failed, 2);
        let retry = RetryFile::load(&outcome.retry_file.expect("retry")).expect("load");
        assert_eq!(retry.failed_pairs().len(), 2);
    }

    #[test]
    fn worker_panics_are_caught_and_recorded() {
        let world = World::new();
        world.write_artifact("etc/a.conf", "", "a\n");
        world.commit("seed");

        let panicking_factory = |_: &Endpoint,
                                 _: Option<&Endpoint>,
                                 _: &RuntimeOptions|
         -> Result<Session, DeployError> {
            panic!("factory exploded")
        };

        let reporter: Mutex<CollectingReporter> = Mutex::new(CollectingReporter::default());
        let outcome = run_deploy_with(
            &world.spec(),
            &opts(DeployMode::All),
            &reporter,
            &panicking_factory,
        )
        .expect("deploy outcome");

        assert_eq!(outcome.summary.status, Status::Failed);
        let host = &outcome.summary.hosts[0];
        assert!(
            host.error_message.as_deref().unwrap_or_default().contains("panicked"),
            "{:?}",
            host.error_message
        );
    }

    #[test]
    fn reload_group_runs_once_per_deployment() {
        let world = World::new();
        let marker = world.target("reload-count");
        let reload_cmd = format!("echo x >> '{}'", marker.display());
        world.write_artifact(
            "etc/a.conf",
            &format!(r#""Reload":["{reload_cmd}"]"#),
            "a\n",
        );
        world.write_artifact(
            "etc/b.conf",
            &format!(r#""Reload":["{reload_cmd}"]"#),
            "b\n",
        );
        world.commit("seed");

        let outcome = deploy(&world, &opts(DeployMode::All));
        assert_eq!(outcome.summary.status, Status::Deployed);
        let count = fs::read_to_string(&marker).expect("marker");
        assert_eq!(count.lines().count(), 1, "reload ran more than once");
    }
}
