use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::IdeError;
use crate::models::container_models::IdeLanguage;

#[derive(Debug, Clone, Deserialize)]
pub struct Images {
    pub python3: String,
    pub cpp: String,
    pub java: String,
}

impl Images {
    pub fn for_language(&self, language: IdeLanguage) -> &str {
        match language {
            IdeLanguage::Python3 => &self.python3,
            IdeLanguage::Cpp => &self.cpp,
            IdeLanguage::Java => &self.java,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerSettings {
    /// Prefix of every container name managed by this service.
    pub container_prefix: String,
    pub cpus: f64,
    pub memory: String,
    pub memory_swap: String,
    /// Port the IDE listens on inside the container.
    pub internal_port: u16,
    /// Grace period after `docker run` before the IDE is reachable.
    pub settle_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsSettings {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperSettings {
    pub interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub teacher_ttl_secs: u64,
}

impl SweeperSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn teacher_ttl(&self) -> Duration {
        Duration::from_secs(self.teacher_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSettings {
    /// Base directory holding one workspace directory per (lab, student).
    pub workspace_base: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub images: Images,
    pub docker: DockerSettings,
    pub ports: PortsSettings,
    pub sweeper: SweeperSettings,
    pub paths: PathsSettings,
}

impl Settings {
    pub fn from_file(path: &str) -> Result<Self, IdeError> {
        let content = fs::read_to_string(path)
            .map_err(|err| IdeError::Internal(format!("read config {path:?} failed: {err}")))?;
        toml::from_str(&content)
            .map_err(|err| IdeError::Internal(format!("parse config {path:?} failed: {err}")))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            images: Images {
                python3: "theiaide/theia-python:latest".to_string(),
                cpp: "theiaide/theia-cpp:latest".to_string(),
                java: "theiaide/theia-java:latest".to_string(),
            },
            docker: DockerSettings {
                container_prefix: "mytheia".to_string(),
                cpus: 0.38,
                memory: "500m".to_string(),
                memory_swap: "900m".to_string(),
                internal_port: 10443,
                settle_delay_secs: 2,
            },
            ports: PortsSettings {
                min: 30000,
                max: 32000,
            },
            sweeper: SweeperSettings {
                interval_secs: 300,
                idle_timeout_secs: 64,
                teacher_ttl_secs: 64,
            },
            paths: PathsSettings {
                workspace_base: PathBuf::from("/srv/theia-warden/codespaces"),
            },
        }
    }
}
