//! Configuration model for coursehub.
//!
//! The whole hub is configured from a single TOML document. Every section has
//! defaults that match a conventional single-cluster deployment, so a minimal
//! file only needs the group ids and the notebook image.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CourseHubError, Result};

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    pub accounts: AccountSettings,
    pub workspace: WorkspaceSettings,
    pub orchestrator: OrchestratorSettings,
    pub roster: RosterSettings,
    pub directory: DirectorySettings,
    pub runtime: RuntimeSettings,
    pub logging: LoggingSettings,
}

/// Numeric identities and directory-record defaults.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AccountSettings {
    /// Owner used for shared directories and as the fallback owner when a
    /// subject's numeric id cannot be resolved.
    pub superuser_uid: u32,
    pub superuser_gid: u32,
    /// Group of every instructor ("teachers").
    pub instructor_gid: u32,
    /// Group of every learner ("students").
    pub learner_gid: u32,
    /// Added to the upstream platform subject id to avoid system accounts.
    pub uid_offset: u32,
    pub home_root: PathBuf,
    pub base_dn: String,
    pub email_domain: String,
    pub instructor_shell: String,
    pub learner_shell: String,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            superuser_uid: 0,
            superuser_gid: 0,
            instructor_gid: 0,
            learner_gid: 0,
            uid_offset: 20000,
            home_root: PathBuf::from("/jupyter"),
            base_dn: "ou=People,dc=example,dc=com".to_string(),
            email_domain: "example.com".to_string(),
            instructor_shell: "/bin/bash".to_string(),
            learner_shell: "/sbin/nologin".to_string(),
        }
    }
}

/// Host-side layout of course and exchange trees.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WorkspaceSettings {
    pub share_root: PathBuf,
    pub exchange_root: PathBuf,
    /// Where the course exchange is mounted inside the session container.
    pub exchange_mount_root: PathBuf,
    /// Directory-client configuration bound read-only into every session.
    pub directory_client_config: PathBuf,
    /// Name of the per-user directory holding course working trees.
    pub class_dir_name: String,
    pub volume_driver: Option<String>,
    pub volume_driver_options: BTreeMap<String, String>,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            share_root: PathBuf::from("/jupytershare"),
            exchange_root: PathBuf::from("/exchange/nbgrader/exchange"),
            exchange_mount_root: PathBuf::from("/jupytershare/nbgrader/exchange"),
            directory_client_config: PathBuf::from("/etc/nslcd.conf"),
            class_dir_name: "class".to_string(),
            volume_driver: None,
            volume_driver_options: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub image: String,
    pub service_prefix: String,
    pub networks: Vec<String>,
    pub placement_constraints: Vec<String>,
    pub args: Vec<String>,
    pub cpu_guarantee: Option<f64>,
    pub cpu_limit: Option<f64>,
    pub mem_guarantee: Option<String>,
    pub instructor_mem_limit: Option<String>,
    pub learner_mem_limit: Option<String>,
    pub timezone: String,
    /// Exported to the session as `GRANT_SUDO=yes|no`.
    pub grant_sudo: bool,
    /// Optional ceiling for a whole launch; unset means wait forever.
    pub launch_timeout_secs: Option<u64>,
    /// Length of one backoff time-unit in milliseconds.
    pub poll_unit_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            image: "jupyter/scipy-notebook:latest".to_string(),
            service_prefix: "coursehub".to_string(),
            networks: Vec::new(),
            placement_constraints: vec!["node.role == worker".to_string()],
            args: vec!["--allow-root".to_string()],
            cpu_guarantee: None,
            cpu_limit: None,
            mem_guarantee: None,
            instructor_mem_limit: None,
            learner_mem_limit: None,
            timezone: "Asia/Tokyo".to_string(),
            grant_sudo: true,
            launch_timeout_secs: Some(300),
            poll_unit_ms: 1000,
        }
    }
}

impl OrchestratorSettings {
    pub fn poll_unit(&self) -> Duration {
        Duration::from_millis(self.poll_unit_ms)
    }

    pub fn launch_timeout(&self) -> Option<Duration> {
        self.launch_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RosterSettings {
    pub base_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DirectorySettings {
    /// File backing the directory store. Resolved under the config directory
    /// when unset.
    pub store_path: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Size of the bounded pool running provisioning and identity work.
    pub provisioning_workers: usize,
    pub records_dir: Option<PathBuf>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            provisioning_workers: 8,
            records_dir: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub directory: Option<PathBuf>,
    pub filter: Option<String>,
}

impl HubConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HubConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that would provision unsafe or inconsistent
    /// workspaces. Called once at startup; a failure here must prevent every
    /// launch.
    pub fn validate(&self) -> Result<()> {
        let accounts = &self.accounts;
        if accounts.instructor_gid == 0 || accounts.learner_gid == 0 {
            return Err(CourseHubError::config(
                "accounts.instructor_gid and accounts.learner_gid must be set to non-root groups",
            ));
        }
        if accounts.instructor_gid == accounts.learner_gid {
            return Err(CourseHubError::config(
                "accounts.instructor_gid and accounts.learner_gid must differ",
            ));
        }

        let workspace = &self.workspace;
        for (name, path) in [
            ("accounts.home_root", &accounts.home_root),
            ("workspace.share_root", &workspace.share_root),
            ("workspace.exchange_root", &workspace.exchange_root),
            ("workspace.exchange_mount_root", &workspace.exchange_mount_root),
            ("workspace.directory_client_config", &workspace.directory_client_config),
        ] {
            require_absolute(name, path)?;
        }
        if workspace.exchange_root.starts_with(&accounts.home_root) {
            return Err(CourseHubError::config(
                "workspace.exchange_root must not live under accounts.home_root",
            ));
        }
        if workspace.class_dir_name.is_empty()
            || workspace.class_dir_name.contains('/')
            || workspace.class_dir_name.starts_with('.')
        {
            return Err(CourseHubError::config(format!(
                "workspace.class_dir_name '{}' must be a plain directory name",
                workspace.class_dir_name
            )));
        }

        let orchestrator = &self.orchestrator;
        if orchestrator.image.trim().is_empty() {
            return Err(CourseHubError::config("orchestrator.image must not be empty"));
        }
        if orchestrator.service_prefix.trim().is_empty() {
            return Err(CourseHubError::config(
                "orchestrator.service_prefix must not be empty",
            ));
        }
        for (name, value) in [
            ("orchestrator.cpu_guarantee", orchestrator.cpu_guarantee),
            ("orchestrator.cpu_limit", orchestrator.cpu_limit),
        ] {
            if let Some(cpu) = value
                && !(cpu.is_finite() && cpu >= 0.0)
            {
                return Err(CourseHubError::config(format!(
                    "{} must be a non-negative number, got {}",
                    name, cpu
                )));
            }
        }
        for (name, value) in [
            ("orchestrator.mem_guarantee", &orchestrator.mem_guarantee),
            ("orchestrator.instructor_mem_limit", &orchestrator.instructor_mem_limit),
            ("orchestrator.learner_mem_limit", &orchestrator.learner_mem_limit),
        ] {
            if let Some(raw) = value {
                parse_memory(raw).map_err(|e| {
                    CourseHubError::config(format!("{}: {}", name, e))
                })?;
            }
        }
        if orchestrator.poll_unit_ms == 0 {
            return Err(CourseHubError::config("orchestrator.poll_unit_ms must be positive"));
        }

        if self.runtime.provisioning_workers == 0 {
            return Err(CourseHubError::config(
                "runtime.provisioning_workers must be at least 1",
            ));
        }

        Ok(())
    }
}

fn require_absolute(name: &str, path: &Path) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(CourseHubError::config(format!(
            "{} must be an absolute path, got '{}'",
            name,
            path.display()
        )))
    }
}

/// Parses a memory size such as `"512M"`, `"2G"`, `"1.5G"` or a plain byte
/// count into bytes. Suffixes are binary (K = 1024).
pub fn parse_memory(raw: &str) -> std::result::Result<u64, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty memory size".to_string());
    }

    let (number, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                other => return Err(format!("unknown memory suffix '{}' in '{}'", other, raw)),
            };
            (&trimmed[..trimmed.len() - 1], multiplier)
        }
        _ => (trimmed, 1),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory size '{}'", raw))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid memory size '{}'", raw));
    }

    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> HubConfig {
        let mut config = HubConfig::default();
        config.accounts.instructor_gid = 2000;
        config.accounts.learner_gid = 3000;
        config
    }

    #[test]
    fn test_parse_memory_suffixes() {
        assert_eq!(parse_memory("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1.5k").unwrap(), 1536);
        assert_eq!(parse_memory("4096").unwrap(), 4096);
        assert!(parse_memory("12Q").is_err());
        assert!(parse_memory("").is_err());
        assert!(parse_memory("-1G").is_err());
    }

    #[test]
    fn test_defaults_need_group_ids() {
        let err = HubConfig::default().validate().unwrap_err();
        assert!(err.is_config());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_relative_paths_are_rejected() {
        let mut config = valid_config();
        config.workspace.share_root = PathBuf::from("jupytershare");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workspace.share_root"));
    }

    #[test]
    fn test_same_course_groups_are_rejected() {
        let mut config = valid_config();
        config.accounts.learner_gid = config.accounts.instructor_gid;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_memory_limit_is_rejected() {
        let mut config = valid_config();
        config.orchestrator.learner_mem_limit = Some("lots".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("learner_mem_limit"));
    }

    #[test]
    fn test_from_toml_str_fills_defaults() {
        let config = HubConfig::from_toml_str(
            r#"
[accounts]
instructor_gid = 2000
learner_gid = 3000

[orchestrator]
image = "registry.local/notebook:2024"
cpu_limit = 1.5
learner_mem_limit = "1G"
"#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.image, "registry.local/notebook:2024");
        assert_eq!(config.orchestrator.cpu_limit, Some(1.5));
        assert_eq!(config.workspace.class_dir_name, "class");
        assert_eq!(config.accounts.home_root, PathBuf::from("/jupyter"));
        assert_eq!(config.runtime.provisioning_workers, 8);
    }
}
