//! Settings for peers, the cluster and the replay model.
//!
//! [`JasperConfig`] has three sections. `peer` sizes the local loops,
//! `cluster` holds the values every peer publishes to the log at boot, and
//! `replay` drives `jasper-sim`. See [`ConfigLoader`] for how files and
//! environment variables are layered.

use anyhow::Result;
use jasper_types::{ClusterChunk, JobScheduler, MessagingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{LOCAL_FILE, PROJECT_FILE, Paths};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JasperConfig {
    pub peer: PeerConfig,
    pub cluster: ClusterConfig,
    pub replay: ReplayConfig,
}

/// Per-process settings for the peer loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Capacity of the outbox queue. Senders wait when it is full.
    pub outbox_capacity: usize,
    /// Capacity of the control queue (external unstall requests).
    pub control_capacity: usize,
    /// How long `stop` waits for each loop before aborting it.
    pub stop_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 1024,
            control_capacity: 16,
            stop_timeout_ms: 5_000,
        }
    }
}

impl PeerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Cluster-wide settings. Every peer publishes these at boot and the first
/// write for each key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub job_scheduler: JobScheduler,
    pub messaging: MessagingConfig,
}

impl ClusterConfig {
    /// The chunks a peer writes before subscribing to the log.
    pub fn chunks(&self) -> Vec<ClusterChunk> {
        vec![
            ClusterChunk::JobScheduler(self.job_scheduler),
            ClusterChunk::Messaging(self.messaging.clone()),
        ]
    }
}

/// Settings for the deterministic replay model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Applied entries after which a run is reported as a liveness failure.
    pub ceiling: usize,
    /// Whether a started task immediately seals its output.
    pub auto_seal: bool,
    /// Number of seeds checked by default.
    pub seeds: u64,
    /// Maximum number of complete interleavings the explorer walks.
    pub explore_budget: usize,
    /// Where liveness-failure dumps are written.
    pub dump_dir: PathBuf,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ceiling: 1000,
            auto_seal: true,
            seeds: 32,
            explore_budget: 256,
            dump_dir: PathBuf::from(".jasper/dumps"),
        }
    }
}

impl JasperConfig {
    /// Layered load rooted at the working directory.
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Reads exactly one TOML file. Missing sections take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        let config: Self = match toml::from_str(&text) {
            Ok(config) => config,
            Err(source) => return Err(ConfigError::Parse { path, source }),
        };
        config.validate()?;
        Ok(config)
    }

    /// Small queues and a short stop timeout.
    pub fn testing() -> Self {
        Self {
            peer: PeerConfig {
                outbox_capacity: 64,
                control_capacity: 4,
                stop_timeout_ms: 1_000,
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("peer.outbox_capacity", self.peer.outbox_capacity),
            ("peer.control_capacity", self.peer.control_capacity),
            ("replay.ceiling", self.replay.ceiling),
        ];
        match counts.iter().find(|(_, value)| *value == 0) {
            Some(&(field, _)) => Err(ConfigError::Invalid {
                field,
                reason: "must be at least 1".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Anchors relative paths at `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        if self.replay.dump_dir.is_relative() {
            self.replay.dump_dir = base_dir.as_ref().join(&self.replay.dump_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jasper_types::Transport;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate() {
        let config = JasperConfig::default();
        assert_eq!(config.peer.outbox_capacity, 1024);
        assert_eq!(config.cluster.job_scheduler, JobScheduler::Balanced);
        assert_eq!(config.cluster.messaging.transport, Transport::InProcess);
        assert_eq!(config.replay.ceiling, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cluster_chunks_cover_every_key() {
        let chunks = ClusterConfig::default().chunks();
        let mut keys: Vec<_> = chunks.iter().map(ClusterChunk::key).collect();
        keys.dedup();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn empty_outbox_is_invalid() {
        let mut config = JasperConfig::testing();
        config.peer.outbox_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "peer.outbox_capacity",
                ..
            })
        ));
    }

    #[test]
    fn from_file_fills_missing_sections() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("replay.toml");
        std::fs::write(
            &path,
            r#"
[cluster]
job_scheduler = "greedy"

[replay]
ceiling = 250
auto_seal = false
"#,
        )
        .unwrap();

        let config = JasperConfig::from_file(&path).unwrap();
        assert_eq!(config.cluster.job_scheduler, JobScheduler::Greedy);
        assert_eq!(config.replay.ceiling, 250);
        assert!(!config.replay.auto_seal);
        assert_eq!(config.peer, PeerConfig::default());
    }

    #[test]
    fn from_file_reports_read_and_parse_errors() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("broken.toml");
        std::fs::write(&path, "[replay\nceiling = ").unwrap();

        assert!(matches!(
            JasperConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            JasperConfig::from_file(temp_dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn dump_dir_is_anchored_at_the_project() {
        let mut config = JasperConfig::default();
        config.resolve_paths("/home/user/project");

        assert_eq!(
            config.replay.dump_dir,
            PathBuf::from("/home/user/project/.jasper/dumps")
        );
    }
}
