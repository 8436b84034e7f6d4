use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use vm_iac::{RegistryMirror, Secret, TerraformExecutor};
use vm_orchestrator::PipelineSettings;

#[derive(Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,

    #[serde(default = "default_terraform_bin")]
    pub terraform_bin: String,

    #[serde(default = "default_terragrunt_bin")]
    pub terragrunt_bin: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_sweeper_interval")]
    pub sweeper_interval_secs: u64,

    /// Zero disables the per-stage timeout.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    #[serde(default = "default_registry_url")]
    pub registry_url: Option<String>,

    #[serde(default = "default_registry_token")]
    pub registry_token: Option<String>,
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("PROVISIOND_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata)
            .join("provisiond")
            .join("provisiond.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".provisiond")
            .join("provisiond.db")
    }
}

fn default_work_root() -> PathBuf {
    std::env::var("PROVISIOND_WORK_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("provisiond"))
}

fn default_terraform_bin() -> String {
    std::env::var("PROVISIOND_TERRAFORM_BIN").unwrap_or_else(|_| "terraform".to_string())
}

fn default_terragrunt_bin() -> String {
    std::env::var("PROVISIOND_TERRAGRUNT_BIN").unwrap_or_else(|_| "terragrunt".to_string())
}

fn default_worker_concurrency() -> usize {
    std::env::var("PROVISIOND_WORKER_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(4)
}

fn default_queue_capacity() -> usize {
    std::env::var("PROVISIOND_QUEUE_CAPACITY")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(64)
}

fn default_sweeper_interval() -> u64 {
    std::env::var("PROVISIOND_SWEEPER_INTERVAL")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30) // 30 seconds
}

fn default_stage_timeout() -> u64 {
    std::env::var("PROVISIOND_STAGE_TIMEOUT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3600) // 1 hour
}

fn default_registry_url() -> Option<String> {
    std::env::var("PROVISIOND_REGISTRY_URL")
        .ok()
        .filter(|s| !s.trim().is_empty())
}

fn default_registry_token() -> Option<String> {
    std::env::var("PROVISIOND_REGISTRY_TOKEN")
        .ok()
        .filter(|s| !s.is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            work_root: default_work_root(),
            terraform_bin: default_terraform_bin(),
            terragrunt_bin: default_terragrunt_bin(),
            worker_concurrency: default_worker_concurrency(),
            queue_capacity: default_queue_capacity(),
            sweeper_interval_secs: default_sweeper_interval(),
            stage_timeout_secs: default_stage_timeout(),
            registry_url: default_registry_url(),
            registry_token: default_registry_token(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("db_path", &self.db_path)
            .field("work_root", &self.work_root)
            .field("terraform_bin", &self.terraform_bin)
            .field("terragrunt_bin", &self.terragrunt_bin)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("queue_capacity", &self.queue_capacity)
            .field("sweeper_interval_secs", &self.sweeper_interval_secs)
            .field("stage_timeout_secs", &self.stage_timeout_secs)
            .field("registry_url", &self.registry_url)
            .field(
                "registry_token",
                &self.registry_token.as_ref().map(|_| "[redacted]"),
            )
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_secs > 0).then(|| Duration::from_secs(self.stage_timeout_secs))
    }

    pub fn registry(&self) -> Option<RegistryMirror> {
        self.registry_url.as_ref().map(|url| RegistryMirror {
            url: url.clone(),
            token: self.registry_token.clone().map(Secret::new),
        })
    }

    pub fn executor(&self) -> TerraformExecutor {
        TerraformExecutor::new(&self.terraform_bin, &self.terragrunt_bin)
            .with_stage_timeout(self.stage_timeout())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            work_root: self.work_root.clone(),
            registry: self.registry(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 10] = [
        "PROVISIOND_DB_PATH",
        "PROVISIOND_WORK_ROOT",
        "PROVISIOND_TERRAFORM_BIN",
        "PROVISIOND_TERRAGRUNT_BIN",
        "PROVISIOND_WORKER_CONCURRENCY",
        "PROVISIOND_QUEUE_CAPACITY",
        "PROVISIOND_SWEEPER_INTERVAL",
        "PROVISIOND_STAGE_TIMEOUT",
        "PROVISIOND_REGISTRY_URL",
        "PROVISIOND_REGISTRY_TOKEN",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env();

        assert!(config.db_path.ends_with("provisiond.db"));
        assert_eq!(config.terraform_bin, "terraform");
        assert_eq!(config.terragrunt_bin, "terragrunt");
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.sweeper_interval_secs, 30);
        assert_eq!(config.stage_timeout(), Some(Duration::from_secs(3600)));
        assert!(config.registry().is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("PROVISIOND_DB_PATH", "/srv/provisiond/state.db");
        std::env::set_var("PROVISIOND_WORKER_CONCURRENCY", "0");
        std::env::set_var("PROVISIOND_QUEUE_CAPACITY", "8");
        std::env::set_var("PROVISIOND_STAGE_TIMEOUT", "0");
        std::env::set_var("PROVISIOND_REGISTRY_URL", "https://mirror.example.com/providers/");
        std::env::set_var("PROVISIOND_REGISTRY_TOKEN", "mirror-token");

        let config = Config::from_env();
        clear_env();

        assert_eq!(config.db_path, PathBuf::from("/srv/provisiond/state.db"));
        // Zero workers is not a usable setting.
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.stage_timeout(), None);

        let registry = config.registry().expect("registry configured");
        assert_eq!(registry.url, "https://mirror.example.com/providers/");
        assert!(registry.token.is_some());
    }

    #[test]
    #[serial]
    fn test_debug_redacts_registry_token() {
        clear_env();
        std::env::set_var("PROVISIOND_REGISTRY_URL", "https://mirror.example.com/");
        std::env::set_var("PROVISIOND_REGISTRY_TOKEN", "mirror-token");

        let config = Config::from_env();
        clear_env();

        let debug = format!("{config:?}");
        assert!(!debug.contains("mirror-token"));
        assert!(debug.contains("[redacted]"));
    }
}
