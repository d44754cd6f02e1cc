//! Deployment planning: which artifacts apply to which hosts, in what
//! order, and which reload groups they form.
//!
//! The planner is pure and deterministic: the same artifact set,
//! inventory, and options always produce identical per-host deployment
//! lists. All remote work happens later, in the engine.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use regex::Regex;

use confship_retry::RetryFile;

use crate::repository::{ArtifactSet, Change, ChangeKind, deletion_artifact, top_dir_of};
use crate::header::DIRECTORY_METADATA_NAME;
use crate::inventory::Inventory;
use crate::types::{
    ActionKind, Artifact, DeployError, DeployMode, DeploymentList, DeploymentState, Endpoint,
    RuntimeOptions,
};

/// The plan for one host: its endpoint, ordered work list, and the
/// universal artifacts denied by host-specific overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlan {
    pub endpoint: Endpoint,
    pub list: DeploymentList,
    pub denied_universal: BTreeSet<String>,
}

/// The full deployment plan: shared artifact data plus one [`HostPlan`]
/// per participating host.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPlan {
    pub commit_id: String,
    pub artifacts: BTreeMap<String, Artifact>,
    pub payloads: BTreeMap<String, Arc<Vec<u8>>>,
    pub hosts: Vec<HostPlan>,
    /// Non-fatal findings (invalid override regexes, unknown retry paths).
    pub warnings: Vec<String>,
}

impl DeploymentPlan {
    pub fn total_items(&self) -> usize {
        self.hosts.iter().map(|h| h.list.files.len()).sum()
    }

    pub fn artifact(&self, repo_path: &str) -> Option<&Artifact> {
        self.artifacts.get(repo_path)
    }
}

/// Compute the deployment plan.
///
/// `changes` must be present for [`DeployMode::Changes`]; `retry` must be
/// present for [`DeployMode::Failures`].
pub fn build_plan(
    set: &ArtifactSet,
    changes: Option<&[Change]>,
    retry: Option<&RetryFile>,
    inventory: &Inventory,
    opts: &RuntimeOptions,
) -> Result<DeploymentPlan, DeployError> {
    let mut warnings = Vec::new();
    let host_matcher = OverrideMatcher::new(&opts.host_override, opts.regex_overrides, &mut warnings);
    let file_matcher = OverrideMatcher::new(&opts.file_override, opts.regex_overrides, &mut warnings);

    let (artifacts, candidate_paths) =
        expand_mode(set, changes, retry, opts.mode, &mut warnings)?;

    let mut hosts = Vec::new();
    for endpoint in &inventory.endpoints {
        if endpoint.deployment_state == DeploymentState::Offline && !opts.allow_offline {
            continue;
        }
        if !host_matcher.is_empty() && !host_matcher.matches_host(endpoint) {
            continue;
        }

        let plan = plan_host(
            endpoint,
            &artifacts,
            &candidate_paths,
            retry,
            inventory,
            opts,
            &file_matcher,
        )?;
        if !plan.list.is_empty() {
            hosts.push(plan);
        }
    }

    Ok(DeploymentPlan {
        commit_id: set.commit_id.clone(),
        artifacts,
        payloads: set.payloads.clone(),
        hosts,
        warnings,
    })
}

/// Expand the deploy mode into the candidate artifact map and path list.
fn expand_mode(
    set: &ArtifactSet,
    changes: Option<&[Change]>,
    retry: Option<&RetryFile>,
    mode: DeployMode,
    warnings: &mut Vec<String>,
) -> Result<(BTreeMap<String, Artifact>, Vec<String>), DeployError> {
    let mut artifacts = set.artifacts.clone();

    let candidates: Vec<String> = match mode {
        DeployMode::All => artifacts.keys().cloned().collect(),
        DeployMode::Changes => {
            let changes = changes.ok_or_else(|| {
                DeployError::LocalSetup("deploy-changes requires the commit change set".to_string())
            })?;
            let mut paths = Vec::new();
            for change in changes {
                match change.kind {
                    ChangeKind::Added => {
                        if artifacts.contains_key(&change.path) {
                            paths.push(change.path.clone());
                        }
                    }
                    ChangeKind::Modified => {
                        if let Some(artifact) = artifacts.get_mut(&change.path) {
                            if artifact.action == ActionKind::DirCreate {
                                artifact.action = ActionKind::DirModify;
                            }
                            paths.push(change.path.clone());
                        }
                    }
                    ChangeKind::Deleted => {
                        if !deletable(&change.path) {
                            continue;
                        }
                        artifacts
                            .entry(change.path.clone())
                            .or_insert_with(|| deletion_artifact(&change.path));
                        paths.push(change.path.clone());
                    }
                }
            }
            paths
        }
        DeployMode::Failures => {
            let retry = retry.ok_or_else(|| {
                DeployError::LocalSetup("deploy-failures requires a retry file".to_string())
            })?;
            let mut paths = Vec::new();
            let mut seen = BTreeSet::new();
            for (_, file) in retry.failed_pairs() {
                if !seen.insert(file.to_string()) {
                    continue;
                }
                if artifacts.contains_key(file) {
                    paths.push(file.to_string());
                } else {
                    warnings.push(format!(
                        "retry file names {file}, which is not in the snapshot; skipping"
                    ));
                }
            }
            paths
        }
    };

    Ok((artifacts, candidates))
}

/// Deleted paths become delete artifacts only when they would have been
/// artifacts themselves; removing a directory-metadata marker stops
/// managing the directory rather than deleting it.
fn deletable(repo_path: &str) -> bool {
    top_dir_of(repo_path).is_some()
        && !repo_path.ends_with(DIRECTORY_METADATA_NAME)
}

fn plan_host(
    endpoint: &Endpoint,
    artifacts: &BTreeMap<String, Artifact>,
    candidates: &[String],
    retry: Option<&RetryFile>,
    inventory: &Inventory,
    opts: &RuntimeOptions,
    file_matcher: &OverrideMatcher,
) -> Result<HostPlan, DeployError> {
    // Retry mode replays only this host's recorded failures.
    let retry_files: Option<BTreeSet<&str>> = match opts.mode {
        DeployMode::Failures => retry.map(|r| {
            r.failed_pairs()
                .into_iter()
                .filter(|(host, _)| *host == endpoint.name)
                .map(|(_, file)| file)
                .collect()
        }),
        _ => None,
    };

    let applies_to_host = |path: &str| -> bool {
        let Some(top) = top_dir_of(path) else {
            return false;
        };
        top == endpoint.name
            || top == inventory.universal_directory
            || endpoint.universal_groups.contains(top)
    };

    // Denied universal set: host-specific entries shadow universal and
    // group entries with the same target; group entries shadow the
    // universal directory. Computed over the full snapshot, so an
    // unchanged host-specific file still shadows a freshly changed
    // universal one.
    let mut targets_by_rank: BTreeMap<&str, u8> = BTreeMap::new();
    let mut denied_universal = BTreeSet::new();
    let rank = |top: &str| -> u8 {
        if top == endpoint.name {
            2
        } else if endpoint.universal_groups.contains(top) {
            1
        } else {
            0
        }
    };
    for (path, artifact) in artifacts {
        if !applies_to_host(path) {
            continue;
        }
        let top = top_dir_of(path).unwrap_or_default();
        let entry = targets_by_rank
            .entry(artifact.target_path.as_str())
            .or_insert(0);
        *entry = (*entry).max(rank(top));
    }
    let mut files = Vec::new();
    for path in candidates {
        if !applies_to_host(path) {
            continue;
        }
        let artifact = &artifacts[path];
        let top = top_dir_of(path).unwrap_or_default();
        let winner = targets_by_rank
            .get(artifact.target_path.as_str())
            .copied()
            .unwrap_or(0);
        if rank(top) < winner {
            denied_universal.insert(path.clone());
            continue;
        }
        if let Some(allowed) = &retry_files {
            if !allowed.contains(path.as_str()) {
                continue;
            }
        }
        if !file_matcher.is_empty() && !file_matcher.matches_file(path, endpoint) {
            continue;
        }
        files.push(path.clone());
    }

    let ordered = topo_sort(&endpoint.name, &files, artifacts)?;
    let list = build_deployment_list(ordered, artifacts);

    Ok(HostPlan {
        endpoint: endpoint.clone(),
        list,
        denied_universal,
    })
}

/// Stable topological sort over dependency edges: ties preserve the
/// candidate order, a cycle is fatal.
fn topo_sort(
    host: &str,
    files: &[String],
    artifacts: &BTreeMap<String, Artifact>,
) -> Result<Vec<String>, DeployError> {
    let index_of: BTreeMap<&str, usize> = files
        .iter()
        .enumerate()
        .map(|(i, p)| (p.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; files.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); files.len()];
    for (idx, path) in files.iter().enumerate() {
        for dep in &artifacts[path].dependencies {
            // Dependencies outside this host's list are already satisfied
            // (or never planned); only in-list edges order the run.
            if let Some(&dep_idx) = index_of.get(dep.as_str()) {
                indegree[idx] += 1;
                dependents[dep_idx].push(idx);
            }
        }
    }

    // Deterministic queue: candidate order.
    let mut ready: VecDeque<usize> = (0..files.len()).filter(|i| indegree[*i] == 0).collect();
    let mut out = Vec::with_capacity(files.len());
    let mut emitted = vec![false; files.len()];

    while let Some(idx) = ready.pop_front() {
        emitted[idx] = true;
        out.push(files[idx].clone());
        for &dep_idx in &dependents[idx] {
            indegree[dep_idx] -= 1;
            if indegree[dep_idx] == 0 {
                ready.push_back(dep_idx);
            }
        }
    }

    if out.len() != files.len() {
        let stuck: Vec<&str> = files
            .iter()
            .enumerate()
            .filter(|(i, _)| !emitted[*i])
            .map(|(_, p)| p.as_str())
            .collect();
        return Err(DeployError::BadDependency(format!(
            "dependency cycle for host {host} involving: {}",
            stuck.join(", ")
        )));
    }

    Ok(out)
}

fn build_deployment_list(
    ordered: Vec<String>,
    artifacts: &BTreeMap<String, Artifact>,
) -> DeploymentList {
    let mut list = DeploymentList {
        files: ordered,
        ..DeploymentList::default()
    };

    for path in &list.files {
        let artifact = &artifacts[path];
        let Some(id) = reload_group_id(artifact) else {
            continue;
        };

        list.reload_id_by_file.insert(path.clone(), id.clone());
        let members = list.files_by_reload_id.entry(id.clone()).or_default();
        members.push(path.clone());

        let commands = list.commands_by_reload_id.entry(id.clone()).or_default();
        for command in &artifact.reload {
            if !commands.contains(command) {
                commands.push(command.clone());
            }
        }
    }
    for (id, members) in &list.files_by_reload_id {
        list.total_by_reload_id.insert(id.clone(), members.len());
    }

    list
}

/// Two artifacts share a reload group iff they carry the same explicit
/// `ReloadGroup` tag, or identical `Reload` command sequences. Command
/// order matters: a rearrangement is a different group.
pub fn reload_group_id(artifact: &Artifact) -> Option<String> {
    if let Some(tag) = &artifact.reload_group {
        return Some(format!("group:{tag}"));
    }
    if artifact.reload.is_empty() {
        return None;
    }
    let canonical = artifact
        .reload
        .iter()
        .map(|c| c.trim())
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!("cmd:{}", URL_SAFE_NO_PAD.encode(canonical)))
}

#[cfg(test)]
pub(crate) fn tests_build_list(
    files: Vec<String>,
    artifacts: &BTreeMap<String, Artifact>,
) -> DeploymentList {
    build_deployment_list(files, artifacts)
}

/// Comma-separated override tokens matched against hosts or repo paths.
///
/// With regex overrides enabled each token is an anchored regex; a token
/// that fails to compile matches nothing and only produces a warning.
#[derive(Debug, Default)]
pub struct OverrideMatcher {
    tokens: Vec<String>,
    regexes: Vec<Option<Regex>>,
    regex_enabled: bool,
}

impl OverrideMatcher {
    pub fn new(csv: &str, regex_enabled: bool, warnings: &mut Vec<String>) -> Self {
        let tokens: Vec<String> = csv
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        let regexes = tokens
            .iter()
            .map(|token| {
                if !regex_enabled {
                    return None;
                }
                match Regex::new(&format!("^(?:{token})$")) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warnings.push(format!("override token {token:?} is not a valid regex: {e}"));
                        None
                    }
                }
            })
            .collect();

        Self {
            tokens,
            regexes,
            regex_enabled,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// A host matches a token literally, by anchored regex, or when the
    /// token names one of its universal groups.
    pub fn matches_host(&self, endpoint: &Endpoint) -> bool {
        self.tokens.iter().zip(&self.regexes).any(|(token, re)| {
            token == &endpoint.name
                || endpoint.universal_groups.contains(token)
                || self.regex_matches(re, &endpoint.name)
        })
    }

    /// A repo path matches a token literally, by anchored regex, or when
    /// the token names one of the host's universal groups and the path
    /// belongs to that group directory.
    pub fn matches_file(&self, repo_path: &str, endpoint: &Endpoint) -> bool {
        let top = top_dir_of(repo_path).unwrap_or_default();
        self.tokens.iter().zip(&self.regexes).any(|(token, re)| {
            token == repo_path
                || (endpoint.universal_groups.contains(token) && token == top)
                || self.regex_matches(re, repo_path)
        })
    }

    fn regex_matches(&self, re: &Option<Regex>, candidate: &str) -> bool {
        self.regex_enabled && re.as_ref().is_some_and(|re| re.is_match(candidate))
    }
}
