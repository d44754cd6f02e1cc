//! Configuration file support (`.confship.toml`).
//!
//! A repository can pin runtime defaults next to its inventory; CLI flags
//! always win over file values, which win over built-in defaults.
//!
//! ```toml
//! [deploy]
//! concurrency = 4
//! install_hooks = true
//!
//! [timeouts]
//! command = "15s"
//! install = "5m"
//!
//! [vault]
//! passphrase_env = "OPS_VAULT_PASSPHRASE"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{DeployError, RuntimeOptions, Timeouts};

/// File name looked up next to the inventory (or in the repo root).
pub const CONFIG_FILE_NAME: &str = ".confship.toml";

/// Deploy-section knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    /// Bound on concurrently deploying hosts; 1 disables concurrency.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub wet_run: bool,
    #[serde(default)]
    pub force: bool,
    /// Run `Install` hooks from metadata.
    #[serde(default)]
    pub install_hooks: bool,
    #[serde(default)]
    pub disable_reloads: bool,
    #[serde(default)]
    pub disable_sudo: bool,
    /// Treat override tokens as anchored regexes.
    #[serde(default)]
    pub regex_overrides: bool,
}

fn default_concurrency() -> usize {
    10
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            wet_run: false,
            force: false,
            install_hooks: false,
            disable_reloads: false,
            disable_sudo: false,
            regex_overrides: false,
        }
    }
}

/// Vault-section knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSection {
    /// Environment variable naming the vault passphrase.
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
}

fn default_passphrase_env() -> String {
    "CONFSHIP_VAULT_PASSPHRASE".to_string()
}

impl Default for VaultSection {
    fn default() -> Self {
        Self {
            passphrase_env: default_passphrase_env(),
        }
    }
}

/// The parsed configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub vault: VaultSection,
}

impl ConfigFile {
    /// Load `.confship.toml` from a directory; absent file means defaults.
    pub fn load(dir: &Path) -> Result<Option<Self>, DeployError> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_path(&path).map(Some)
    }

    pub fn load_path(path: &Path) -> Result<Self, DeployError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::BadConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            DeployError::BadConfig(format!("invalid {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DeployError> {
        if self.deploy.concurrency == 0 {
            return Err(DeployError::BadConfig(
                "deploy.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Fold file values into runtime options (file wins over defaults;
    /// the CLI applies its own overrides afterwards).
    pub fn apply_to(&self, opts: &mut RuntimeOptions) {
        opts.ssh_concurrency = self.deploy.concurrency;
        opts.wet_run = self.deploy.wet_run;
        opts.force = self.deploy.force;
        opts.run_install_hooks = self.deploy.install_hooks;
        opts.disable_reloads = self.deploy.disable_reloads;
        opts.disable_sudo = self.deploy.disable_sudo;
        opts.regex_overrides = self.deploy.regex_overrides;
        opts.timeouts = self.timeouts.clone();
        opts.vault_passphrase_env = self.vault.passphrase_env.clone();
    }

    /// Resolve the config path for diagnostics.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn defaults_match_builtin_options() {
        let config = ConfigFile::default();
        let mut opts = RuntimeOptions::default();
        let before = opts.clone();
        config.apply_to(&mut opts);
        assert_eq!(opts.ssh_concurrency, before.ssh_concurrency);
        assert_eq!(opts.timeouts, before.timeouts);
        assert_eq!(opts.vault_passphrase_env, before.vault_passphrase_env);
    }

    #[test]
    fn file_values_override_defaults() {
        let content = r#"
[deploy]
concurrency = 3
install_hooks = true

[timeouts]
command = "15s"

[vault]
passphrase_env = "OPS_SECRET"
"#;
        let config: ConfigFile = toml::from_str(content).expect("parse");
        let mut opts = RuntimeOptions::default();
        config.apply_to(&mut opts);

        assert_eq!(opts.ssh_concurrency, 3);
        assert!(opts.run_install_hooks);
        assert_eq!(opts.timeouts.command, Duration::from_secs(15));
        // Unset timeouts keep their defaults.
        assert_eq!(opts.timeouts.connect, Duration::from_secs(30));
        assert_eq!(opts.vault_passphrase_env, "OPS_SECRET");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[deploy]\nconcurrency = 0\n",
        )
        .expect("write");
        let err = ConfigFile::load(dir.path()).expect_err("must fail");
        assert!(matches!(err, DeployError::BadConfig(_)));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        assert!(ConfigFile::load(dir.path()).expect("load").is_none());
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[deploy\n").expect("write");
        assert!(ConfigFile::load(dir.path()).is_err());
    }
}
