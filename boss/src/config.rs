//! Manager and service manifest configuration.
//!
//! The manifest is a single TOML document:
//!
//! ```toml
//! [manager]
//! allow_partial_failure = true
//! start_timeout = 30
//! health_check_interval = 30
//!
//! [services.database]
//! exec = "/usr/libexec/concierge/database"
//! priority = 10
//! required = true
//!
//! [services.llm]
//! kind = "endpoint"
//! address = "127.0.0.1:11434"
//! dependencies = ["database", "security"]
//! priority = 40
//! ```
//!
//! Durations are whole seconds.

use crate::error::{Error, Result};
use crate::service::DEFAULT_PRIORITY;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the manifest.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/concierge/concierge.toml";

/// Default path for the control socket.
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/concierge/control.sock";

/// Top-level configuration shared with every service factory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Manager behavior
    #[serde(default)]
    pub manager: ManagerSettings,
    /// Declared services by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSettings>,
}

/// Settings for the service manager itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Keep starting when a required service fails
    pub allow_partial_failure: bool,
    /// Default bound on a service's start
    #[serde(with = "duration_secs")]
    pub start_timeout: Duration,
    /// Default bound on a service's stop
    #[serde(with = "duration_secs")]
    pub stop_timeout: Duration,
    /// Bound on a single health probe
    #[serde(with = "duration_secs")]
    pub status_timeout: Duration,
    /// Serve cached statuses younger than this; zero always polls
    #[serde(with = "duration_secs")]
    pub status_poll_interval: Duration,
    /// Period of the health monitor; zero disables it
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
    /// Consecutive failed probes before an automatic restart
    pub max_health_failures: u32,
    /// Restart services that keep failing health checks
    pub auto_restart: bool,
    /// Control socket location
    pub control_socket: PathBuf,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            allow_partial_failure: true,
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(5),
            status_poll_interval: Duration::ZERO,
            health_check_interval: Duration::from_secs(30),
            max_health_failures: 3,
            auto_restart: true,
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
        }
    }
}

impl ManagerSettings {
    /// Cache lifetime for statuses, if caching is enabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (!self.status_poll_interval.is_zero()).then_some(self.status_poll_interval)
    }

    /// Health monitor period, if the monitor is enabled.
    pub fn monitor_interval(&self) -> Option<Duration> {
        (!self.health_check_interval.is_zero()).then_some(self.health_check_interval)
    }
}

/// Declaration of one service in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Collaborator kind: "process" or "endpoint"
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Services that must be running first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Startup tie-break, lower first
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Whether failing to start is fatal
    #[serde(default)]
    pub required: bool,
    /// Start timeout override
    #[serde(default, with = "option_duration_secs")]
    pub start_timeout: Option<Duration>,
    /// Stop timeout override
    #[serde(default, with = "option_duration_secs")]
    pub stop_timeout: Option<Duration>,
    /// Executable for process services, split on whitespace
    #[serde(default)]
    pub exec: Option<String>,
    /// Arguments for process services, passed through as is
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for process services
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for process services
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Time a process must stay alive before it counts as started
    #[serde(default, with = "option_duration_secs")]
    pub ready_delay: Option<Duration>,
    /// host:port for endpoint services
    #[serde(default)]
    pub address: Option<String>,
    /// How long an endpoint may take to accept a connection at start
    #[serde(default, with = "option_duration_secs")]
    pub connect_timeout: Option<Duration>,
    /// Version reported in status
    #[serde(default)]
    pub version: Option<String>,
}

fn default_kind() -> String {
    "process".to_string()
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl ServiceSettings {
    /// Settings for a process service running `exec`.
    pub fn process(exec: impl Into<String>) -> Self {
        Self {
            exec: Some(exec.into()),
            ..Self::with_kind("process")
        }
    }

    /// Settings for an endpoint service at `address`.
    pub fn endpoint(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::with_kind("endpoint")
        }
    }

    fn with_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            dependencies: Vec::new(),
            priority: DEFAULT_PRIORITY,
            required: false,
            start_timeout: None,
            stop_timeout: None,
            exec: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            working_directory: None,
            ready_delay: None,
            address: None,
            connect_timeout: None,
            version: None,
        }
    }
}

impl Config {
    /// Load the configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::Configuration(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-service consistency of the manifest.
    pub fn validate(&self) -> Result<()> {
        for (name, settings) in &self.services {
            if name.trim().is_empty() {
                return Err(Error::Configuration("service name must not be empty".to_string()));
            }
            match settings.kind.as_str() {
                "process" if settings.exec.as_deref().map_or(true, |e| e.trim().is_empty()) => {
                    return Err(Error::Configuration(format!(
                        "process service {} needs exec",
                        name
                    )));
                }
                "endpoint" if settings.address.is_none() => {
                    return Err(Error::Configuration(format!(
                        "endpoint service {} needs address",
                        name
                    )));
                }
                _ => {}
            }
            for dep in &settings.dependencies {
                if dep == name {
                    return Err(Error::Configuration(format!("service {} depends on itself", name)));
                }
                if !self.services.contains_key(dep) {
                    return Err(Error::Configuration(format!(
                        "service {} depends on undeclared service {}",
                        name, dep
                    )));
                }
            }
        }
        if self.manager.max_health_failures == 0 {
            return Err(Error::Configuration(
                "manager.max_health_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings of a declared service.
    pub fn service(&self, name: &str) -> Option<&ServiceSettings> {
        self.services.get(name)
    }
}

/// Durations stored as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
[manager]
allow_partial_failure = false
start_timeout = 10
status_poll_interval = 2
health_check_interval = 0

[services.database]
exec = "/usr/bin/true"
priority = 10
required = true

[services.security]
exec = "/usr/bin/true"
dependencies = ["database"]
priority = 20
required = true
stop_timeout = 3

[services.llm]
kind = "endpoint"
address = "127.0.0.1:11434"
dependencies = ["database", "security"]
priority = 40
"#;

    #[test]
    fn test_parse_manifest() {
        let config: Config = toml::from_str(MANIFEST).unwrap();
        config.validate().unwrap();

        assert!(!config.manager.allow_partial_failure);
        assert_eq!(config.manager.start_timeout, Duration::from_secs(10));
        assert_eq!(config.manager.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.manager.poll_interval(), Some(Duration::from_secs(2)));
        assert_eq!(config.manager.monitor_interval(), None);

        let llm = config.service("llm").unwrap();
        assert_eq!(llm.kind, "endpoint");
        assert_eq!(llm.dependencies, vec!["database", "security"]);
        assert!(!llm.required);

        let security = config.service("security").unwrap();
        assert_eq!(security.kind, "process");
        assert_eq!(security.stop_timeout, Some(Duration::from_secs(3)));
        assert_eq!(security.start_timeout, None);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("[services.tts]\nexec = \"piper\"\n").unwrap();
        assert!(config.manager.allow_partial_failure);
        assert_eq!(config.manager.max_health_failures, 3);
        assert_eq!(config.manager.monitor_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.services["tts"].priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_validate_rejects_undeclared_dependency() {
        let config: Config =
            toml::from_str("[services.stt]\nexec = \"whisper\"\ndependencies = [\"database\"]\n")
                .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("undeclared service database"));
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let config: Config =
            toml::from_str("[services.stt]\nexec = \"whisper\"\ndependencies = [\"stt\"]\n")
                .unwrap();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_requires_kind_fields() {
        let config: Config = toml::from_str("[services.tts]\npriority = 50\n").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("needs exec"));

        let config: Config = toml::from_str("[services.llm]\nkind = \"endpoint\"\n").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("needs address"));
    }

    #[test]
    fn test_file_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("etc").join("concierge.toml");

        let mut config = Config::default();
        let mut db = ServiceSettings::process("/usr/bin/sleep");
        db.args = vec!["60".to_string()];
        db.required = true;
        config.services.insert("database".to_string(), db);
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.services["database"].args, vec!["60"]);
        assert!(loaded.services["database"].required);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = Config::from_file(Path::new("/nonexistent/concierge.toml")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
