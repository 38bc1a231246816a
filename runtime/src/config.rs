//! Cluster configuration and the worker executable slot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::Deserialize;
use stratus_types::{FaultPolicy, NodeAddress};
use thiserror::Error;

use crate::error::RuntimeError;

const fn default_subscription_retries() -> u32 {
    3
}

const fn default_request_timeout_secs() -> u64 {
    30
}

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Settings for [`Cluster::init_local`](crate::Cluster::init_local).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Local worker processes to spawn at startup.
    pub worker_count: u32,
    /// Remote nodes to subscribe as workers at startup.
    pub workers: Vec<NodeAddress>,
    /// Address the driver node listens on. Port 0 picks a free port.
    pub listen: String,
    pub worker_executable: Option<PathBuf>,
    /// Retries for each remote subscription after the first attempt.
    pub subscription_retries: u32,
    pub request_timeout_secs: u64,
    pub default_fault_policy: FaultPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            workers: Vec::new(),
            listen: default_listen(),
            worker_executable: None,
            subscription_retries: default_subscription_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            default_fault_policy: FaultPolicy::default(),
        }
    }
}

impl ClusterConfig {
    /// Load the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(source) => {
                tracing::warn!(path = %path.display(), error = %source, "Failed to read cluster config");
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        toml::from_str(&content).map_err(|source| {
            tracing::warn!(path = %path.display(), error = %source, "Failed to parse cluster config");
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Load the config at the default location, if one exists.
    pub fn load_default() -> Result<Option<Self>, ConfigError> {
        let Some(path) = Self::path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }

    /// `~/.stratus/config.toml`
    #[must_use]
    pub fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".stratus").join("config.toml"))
    }
}

/// Set-once holder for the worker executable path.
///
/// The path is canonicalized when set. A second `set` with the same path is
/// accepted; a different path is rejected.
#[derive(Debug, Default)]
pub struct ExecutableSlot {
    path: OnceLock<PathBuf>,
}

impl ExecutableSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            path: OnceLock::new(),
        }
    }

    /// Process-wide slot used when no slot is injected.
    #[must_use]
    pub fn global() -> Arc<ExecutableSlot> {
        static GLOBAL: OnceLock<Arc<ExecutableSlot>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ExecutableSlot::new())))
    }

    pub fn set(&self, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
        let path = path.as_ref();
        let canonical = path
            .canonicalize()
            .map_err(|_| RuntimeError::NotFound(path.to_path_buf()))?;
        if !canonical.is_file() {
            return Err(RuntimeError::InvalidArgument(format!(
                "worker executable {} is not a file",
                canonical.display()
            )));
        }

        let stored = self.path.get_or_init(|| canonical.clone());
        if *stored == canonical {
            tracing::debug!(path = %canonical.display(), "Worker executable set");
            Ok(())
        } else {
            Err(RuntimeError::InvalidState(format!(
                "worker executable already set to {}",
                stored.display()
            )))
        }
    }

    /// The configured path; it must still exist on disk.
    pub fn get(&self) -> Result<&Path, RuntimeError> {
        let path = self.path.get().ok_or_else(|| {
            RuntimeError::InvalidState("worker executable has not been set".to_string())
        })?;
        if !path.exists() {
            return Err(RuntimeError::NotFound(path.clone()));
        }
        Ok(path)
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.path.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: ClusterConfig = toml::from_str("").unwrap();
        assert_eq!(config.worker_count, 0);
        assert_eq!(config.listen, "127.0.0.1:0");
        assert_eq!(config.subscription_retries, 3);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.default_fault_policy, FaultPolicy::default());
    }

    #[test]
    fn parses_full_config() {
        let config: ClusterConfig = toml::from_str(
            r#"
            worker_count = 2
            workers = ["node-a:7700", "node-b:7700"]
            listen = "0.0.0.0:7000"
            worker_executable = "/opt/stratus/stratus-worker"
            subscription_retries = 5

            [default_fault_policy]
            kind = "retry"
            max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[1].as_str(), "node-b:7700");
        assert_eq!(
            config.worker_executable.as_deref(),
            Some(Path::new("/opt/stratus/stratus-worker"))
        );
        assert!(matches!(
            config.default_fault_policy,
            FaultPolicy::Retry { max_retries: 2, .. }
        ));
    }

    #[test]
    fn rejects_malformed_worker_address() {
        assert!(toml::from_str::<ClusterConfig>(r#"workers = ["no-port"]"#).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ClusterConfig::load(Path::new("/nonexistent/stratus.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.path(), Path::new("/nonexistent/stratus.toml"));
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "worker_count = [").unwrap();
        assert!(matches!(
            ClusterConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn slot_starts_unset() {
        let slot = ExecutableSlot::new();
        assert!(!slot.is_set());
        assert!(matches!(slot.get(), Err(RuntimeError::InvalidState(_))));
    }

    #[test]
    fn slot_rejects_missing_path() {
        let slot = ExecutableSlot::new();
        let err = slot.set("/definitely/not/here").unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
        assert!(!slot.is_set());
    }

    #[test]
    fn slot_is_set_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("worker-a");
        let second = dir.path().join("worker-b");
        fs::write(&first, "").unwrap();
        fs::write(&second, "").unwrap();

        let slot = ExecutableSlot::new();
        slot.set(&first).unwrap();
        slot.set(&first).unwrap();
        assert!(matches!(
            slot.set(&second),
            Err(RuntimeError::InvalidState(_))
        ));
        assert_eq!(slot.get().unwrap(), first.canonicalize().unwrap());
    }

    #[test]
    fn slot_reports_deleted_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker");
        fs::write(&path, "").unwrap();
        let slot = ExecutableSlot::new();
        slot.set(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(matches!(slot.get(), Err(RuntimeError::NotFound(_))));
    }
}
