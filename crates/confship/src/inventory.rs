//! The host inventory: an SSH-config-style file with extended keys.
//!
//! The file stays consumable by OpenSSH itself (the extended keys are
//! declared via `IgnoreUnknown` there); this parser consumes both the
//! standard connection keys and the deployment extensions. Directives
//! before the first `Host` block, or inside a `Host *` block, apply
//! globally.
//!
//! ```text
//! UniversalDirectory UniversalConfs
//! GroupDirs WebServers,DbServers
//! IgnoreDirectories templates
//!
//! Host web01
//!     HostName 10.0.0.11
//!     User deploy
//!     IdentityFile ~/.ssh/deploy_ed25519
//!     GroupTags WebServers
//!     DeploymentState online
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::repository::ReaderConfig;
use crate::types::{DeployError, DeploymentState, Endpoint};

/// Default name of the universal directory.
pub const DEFAULT_UNIVERSAL_DIR: &str = "UniversalConfs";
/// Default per-host backup directory.
pub const DEFAULT_BACKUP_DIR: &str = "/tmp/.confship-backups";
/// Default per-host transfer buffer path.
pub const DEFAULT_TRANSFER_BUFFER: &str = "/tmp/.confship-buffer";
/// Name of the retry file, written alongside the inventory.
pub const RETRY_FILE_NAME: &str = ".confship-failures";

/// Parsed inventory: global settings plus one [`Endpoint`] per host, in
/// file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    pub path: PathBuf,
    pub universal_directory: String,
    pub group_dirs: BTreeSet<String>,
    pub ignore_dirs: BTreeSet<String>,
    /// Hosts in declaration order; names are unique.
    pub endpoints: Vec<Endpoint>,
}

impl Inventory {
    /// Load and parse an inventory file.
    pub fn load(path: &Path) -> Result<Self, DeployError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::BadConfig(format!("cannot read inventory {}: {e}", path.display()))
        })?;
        Self::parse(path, &content)
    }

    /// Parse inventory content; `path` anchors relative paths and the
    /// retry file location.
    pub fn parse(path: &Path, content: &str) -> Result<Self, DeployError> {
        let mut globals: BTreeMap<String, String> = BTreeMap::new();
        let mut hosts: Vec<(String, BTreeMap<String, String>)> = Vec::new();
        let mut current: Option<usize> = None;

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = split_directive(line).ok_or_else(|| {
                DeployError::BadConfig(format!(
                    "inventory line {}: malformed directive {raw:?}",
                    lineno + 1
                ))
            })?;
            let key_lower = key.to_ascii_lowercase();

            if key_lower == "host" {
                if value == "*" {
                    current = None;
                } else {
                    if hosts.iter().any(|(name, _)| name == &value) {
                        return Err(DeployError::BadConfig(format!(
                            "inventory line {}: duplicate host {value}",
                            lineno + 1
                        )));
                    }
                    hosts.push((value, BTreeMap::new()));
                    current = Some(hosts.len() - 1);
                }
                continue;
            }

            match current {
                Some(idx) => {
                    hosts[idx].1.insert(key_lower, value);
                }
                None => {
                    globals.insert(key_lower, value);
                }
            }
        }

        let universal_directory = globals
            .get("universaldirectory")
            .cloned()
            .unwrap_or_else(|| DEFAULT_UNIVERSAL_DIR.to_string());
        let group_dirs: BTreeSet<String> = globals
            .get("groupdirs")
            .map(|v| split_csv(v))
            .unwrap_or_default();
        let ignore_dirs: BTreeSet<String> = globals
            .get("ignoredirectories")
            .map(|v| split_csv(v))
            .unwrap_or_default();

        let mut endpoints = Vec::with_capacity(hosts.len());
        for (name, keys) in hosts {
            endpoints.push(build_endpoint(path, &name, &keys, &globals, &group_dirs)?);
        }

        Ok(Self {
            path: path.to_path_buf(),
            universal_directory,
            group_dirs,
            ignore_dirs,
            endpoints,
        })
    }

    /// Host names in declaration order.
    pub fn host_names(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// Top-level directories the repository reader accepts.
    pub fn reader_config(&self) -> ReaderConfig {
        let mut valid: BTreeSet<String> =
            self.endpoints.iter().map(|e| e.name.clone()).collect();
        valid.insert(self.universal_directory.clone());
        valid.extend(self.group_dirs.iter().cloned());
        ReaderConfig {
            valid_top_dirs: valid,
            ignore_dirs: self.ignore_dirs.clone(),
        }
    }

    /// Where the failure-tracking file lives: alongside the inventory.
    pub fn retry_file_path(&self) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(RETRY_FILE_NAME)
    }
}

fn build_endpoint(
    inventory_path: &Path,
    name: &str,
    keys: &BTreeMap<String, String>,
    globals: &BTreeMap<String, String>,
    group_dirs: &BTreeSet<String>,
) -> Result<Endpoint, DeployError> {
    let get = |key: &str| keys.get(key).or_else(|| globals.get(key));

    let universal_groups: BTreeSet<String> = get("grouptags")
        .map(|v| split_csv(v))
        .unwrap_or_default();
    for group in &universal_groups {
        if !group_dirs.contains(group) {
            return Err(DeployError::BadConfig(format!(
                "host {name}: GroupTags names {group}, which is not in GroupDirs"
            )));
        }
    }

    let deployment_state = match get("deploymentstate").map(String::as_str) {
        None => DeploymentState::Online,
        Some(s) if s.eq_ignore_ascii_case("online") => DeploymentState::Online,
        Some(s) if s.eq_ignore_ascii_case("offline") => DeploymentState::Offline,
        Some(other) => DeploymentState::Other(other.to_string()),
    };

    let port = match get("port") {
        None => 22,
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            DeployError::BadConfig(format!("host {name}: invalid Port {raw:?}"))
        })?,
    };

    let password_required = match get("passwordrequired").map(String::as_str) {
        None => false,
        Some(s) if s.eq_ignore_ascii_case("yes") || s.eq_ignore_ascii_case("true") => true,
        Some(s) if s.eq_ignore_ascii_case("no") || s.eq_ignore_ascii_case("false") => false,
        Some(other) => {
            return Err(DeployError::BadConfig(format!(
                "host {name}: PasswordRequired must be yes or no, got {other:?}"
            )));
        }
    };

    let password_vault = get("passwordvault").map(|raw| {
        let candidate = Path::new(raw);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            inventory_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(candidate)
        }
        .display()
        .to_string()
    });

    if password_required && password_vault.is_none() {
        return Err(DeployError::BadConfig(format!(
            "host {name}: PasswordRequired is set but no PasswordVault is configured"
        )));
    }

    Ok(Endpoint {
        name: name.to_string(),
        address: get("hostname").cloned().unwrap_or_else(|| name.to_string()),
        port,
        login_user: get("user").cloned().unwrap_or_else(|| "root".to_string()),
        identity_file: get("identityfile").map(PathBuf::from),
        password_vault,
        password_required,
        proxy: get("proxyjump").cloned(),
        deployment_state,
        universal_groups,
        remote_backup_dir: get("remotebackupdir")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BACKUP_DIR.to_string()),
        remote_transfer_buffer: get("remotetransferbuffer")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TRANSFER_BUFFER.to_string()),
    })
}

/// Split `Key value` or `Key=value`, unquoting a double-quoted value.
fn split_directive(line: &str) -> Option<(String, String)> {
    let (key, rest) = match line.split_once(['=', ' ', '\t']) {
        Some((k, r)) => (k.trim(), r.trim()),
        None => return None,
    };
    if key.is_empty() || rest.is_empty() {
        return None;
    }
    let value = rest
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(rest);
    Some((key.to_string(), value.to_string()))
}

fn split_csv(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# deployment inventory
UniversalDirectory UniversalConfs
GroupDirs WebServers,DbServers
IgnoreDirectories templates,docs

Host web01
    HostName 10.0.0.11
    User deploy
    Port 2222
    IdentityFile ~/.ssh/deploy_ed25519
    GroupTags WebServers
    DeploymentState online
    RemoteBackupDir /var/tmp/backups

Host db01
    HostName 10.0.0.21
    ProxyJump web01
    PasswordRequired yes
    PasswordVault creds.vault
    DeploymentState offline
"#;

    fn parse_sample() -> Inventory {
        Inventory::parse(Path::new("/etc/confship/inventory"), SAMPLE).expect("parse")
    }

    #[test]
    fn globals_and_hosts_parse() {
        let inv = parse_sample();
        assert_eq!(inv.universal_directory, "UniversalConfs");
        assert_eq!(
            inv.group_dirs,
            ["WebServers", "DbServers"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(inv.host_names(), vec!["web01", "db01"]);
    }

    #[test]
    fn per_host_keys_override_defaults() {
        let inv = parse_sample();
        let web = inv.endpoint("web01").expect("web01");
        assert_eq!(web.address, "10.0.0.11");
        assert_eq!(web.port, 2222);
        assert_eq!(web.login_user, "deploy");
        assert_eq!(web.remote_backup_dir, "/var/tmp/backups");
        assert_eq!(web.remote_transfer_buffer, DEFAULT_TRANSFER_BUFFER);
        assert!(web.universal_groups.contains("WebServers"));
        assert_eq!(web.deployment_state, DeploymentState::Online);
    }

    #[test]
    fn proxy_vault_and_offline_state() {
        let inv = parse_sample();
        let db = inv.endpoint("db01").expect("db01");
        assert_eq!(db.proxy.as_deref(), Some("web01"));
        assert!(db.password_required);
        assert_eq!(
            db.password_vault.as_deref(),
            Some("/etc/confship/creds.vault")
        );
        assert_eq!(db.deployment_state, DeploymentState::Offline);
        // No explicit User falls back to root.
        assert_eq!(db.login_user, "root");
    }

    #[test]
    fn reader_config_includes_hosts_universal_and_groups() {
        let inv = parse_sample();
        let cfg = inv.reader_config();
        for dir in ["web01", "db01", "UniversalConfs", "WebServers", "DbServers"] {
            assert!(cfg.valid_top_dirs.contains(dir), "{dir}");
        }
        assert!(cfg.ignore_dirs.contains("templates"));
    }

    #[test]
    fn retry_file_sits_alongside_the_inventory() {
        let inv = parse_sample();
        assert_eq!(
            inv.retry_file_path(),
            PathBuf::from("/etc/confship/.confship-failures")
        );
    }

    #[test]
    fn unknown_group_tag_is_rejected() {
        let content = "GroupDirs A\nHost h\nGroupTags B\n";
        let err = Inventory::parse(Path::new("inv"), content).expect_err("must fail");
        assert!(matches!(err, DeployError::BadConfig(_)));
    }

    #[test]
    fn duplicate_hosts_are_rejected() {
        let content = "Host a\nHost a\n";
        let err = Inventory::parse(Path::new("inv"), content).expect_err("must fail");
        assert!(format!("{err}").contains("duplicate host"));
    }

    #[test]
    fn password_required_needs_a_vault() {
        let content = "Host a\nPasswordRequired yes\n";
        let err = Inventory::parse(Path::new("inv"), content).expect_err("must fail");
        assert!(format!("{err}").contains("PasswordVault"));
    }

    #[test]
    fn host_star_contributes_global_defaults() {
        let content = "Host *\nUser ops\nHost a\nHost b\nUser other\n";
        let inv = Inventory::parse(Path::new("inv"), content).expect("parse");
        assert_eq!(inv.endpoint("a").expect("a").login_user, "ops");
        assert_eq!(inv.endpoint("b").expect("b").login_user, "other");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let content = "IgnoreUnknown PasswordVault\nHost a\nForwardAgent yes\n";
        let inv = Inventory::parse(Path::new("inv"), content).expect("parse");
        assert_eq!(inv.host_names(), vec!["a"]);
    }
}
