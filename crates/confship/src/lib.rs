//! # Confship
//!
//! A deployment layer that ships configuration artifacts — file contents,
//! directory metadata, and symbolic links — from a versioned git
//! repository to remote Unix-like hosts over SSH, atomically per file,
//! with automatic rollback and coordinated service reloads.
//!
//! ## Features
//!
//! - **Deterministic planning** — universal, group, and host-specific
//!   overlays resolve the same way every run; per-file dependencies order
//!   each host's list with a stable topological sort.
//! - **Atomic application** — payloads stage to a scratch buffer and
//!   rename into place; every write is verified by SHA-256 and restored
//!   from a pre-mutation backup on failure.
//! - **Coordinated reloads** — artifacts sharing a reload group trigger
//!   their service commands exactly once, only after every member landed.
//! - **Failure tracking** — every failed (host, file) pair is persisted
//!   so a later run can re-attempt exactly the failed subset at the same
//!   commit.
//! - **Bounded fan-out** — hosts deploy concurrently under an SSH
//!   concurrency limit; within a host, artifacts apply strictly in order.
//!
//! ## Pipeline
//!
//! The core flow is **read → plan → deploy → report**:
//!
//! 1. [`repository::read_snapshot`] enumerates a commit's tree, splits
//!    each file into its metadata header and payload, and hashes content.
//! 2. [`plan::build_plan`] resolves which artifacts apply to which hosts
//!    and emits one ordered [`types::DeploymentList`] per host.
//! 3. [`engine::run_deploy`] fans out one session per host and drives the
//!    per-artifact state machine in [`apply`].
//! 4. [`metrics::Metrics`] collects outcomes into the summary report and,
//!    on any failure, the retry file.
//!
//! ## Example
//!
//! ```ignore
//! use std::path::PathBuf;
//! use std::sync::Mutex;
//! use confship::{engine, types};
//!
//! let spec = engine::DeploySpec {
//!     repo_root: PathBuf::from("/srv/configs"),
//!     inventory_path: PathBuf::from("/srv/configs/inventory"),
//!     commit: None,
//!     authored_commit: None,
//! };
//! let opts = types::RuntimeOptions::default();
//! let reporter = Mutex::new(MyReporter);
//! let outcome = engine::run_deploy(&spec, &opts, &reporter)?;
//! ```
//!
//! ## Modules
//!
//! - [`repository`] — commit snapshots, blobs, and change sets
//! - [`header`] — metadata header extraction and the binary heuristic
//! - [`inventory`] — the SSH-config-style host inventory
//! - [`config`] — the optional `.confship.toml` runtime config
//! - [`plan`] — overlay resolution, ordering, and reload grouping
//! - [`transport`] — the remote execution seam (SSH or local)
//! - [`session`] — per-host session lifecycle and the exec primitive
//! - [`remote`] — per-OS command emission and stat parsing
//! - [`apply`] — the per-artifact state machine
//! - [`metrics`] — outcome accumulation, summary report, retry data
//! - [`engine`] — bounded-parallel dispatch and rollback policy
//! - [`types`] — domain types and the error taxonomy
//! - [`perms`] — symbolic/numeric permission conversions

/// The per-artifact state machine.
pub mod apply;

/// Configuration file (`.confship.toml`) loading and merging.
pub mod config;

/// Bounded-parallel deployment dispatch.
pub mod engine;

/// Metadata header extraction and the text-vs-binary heuristic.
pub mod header;

/// Host inventory parsing.
pub mod inventory;

/// Outcome accumulation, the summary report, and retry data.
pub mod metrics;

/// Symbolic/numeric permission conversions.
pub mod perms;

/// Host/artifact planning.
pub mod plan;

/// Local process execution with timeout support.
pub mod process;

/// Per-OS remote command emission and output parsing.
pub mod remote;

/// Commit snapshots, blobs, and change sets.
pub mod repository;

/// Per-host session lifecycle and the exec primitive.
pub mod session;

/// The remote execution seam.
pub mod transport;

/// Domain types and the error taxonomy.
pub mod types;

/// The persisted failure-tracking file.
/// Re-exported from the confship-retry microcrate.
pub use confship_retry as retry;
