//! Service and per-file configuration, passed explicitly into every client and server.

use crate::util::ConfigError;
use crate::wire::{FeatureFlags, OpenParams, Rank};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Outstanding modifications that trigger a cache dump.
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024;
/// Upper bound on members in one lock/release group.
pub const DEFAULT_MAX_GROUP_LEN: usize = 4096;
pub const DEFAULT_MAX_LOCKS_PER_FILE: usize = 65_536;
pub const DEFAULT_MAX_OPEN_FILES: usize = 1024;
pub const DEFAULT_META_BLOCK_SIZE: u64 = 2048;
pub const DEFAULT_SMALL_DATA_BLOCK_SIZE: u64 = 2048;

/// Shape of the participating process group and the server's limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Number of ranks in the group, server included.
    pub participants: u32,
    pub server_rank: Rank,
    /// Client that performs OPEN on behalf of the others.
    pub captain_rank: Rank,
    pub high_water_mark: usize,
    pub max_group_len: usize,
    pub max_locks_per_file: usize,
    pub max_open_files: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            participants: 2,
            server_rank: 0,
            captain_rank: 1,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            max_group_len: DEFAULT_MAX_GROUP_LEN,
            max_locks_per_file: DEFAULT_MAX_LOCKS_PER_FILE,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

impl ServiceConfig {
    /// Group of `participants` ranks with the server on the last rank and the captain on rank 0.
    pub fn with_participants(participants: u32) -> Self {
        Self {
            participants,
            server_rank: participants.saturating_sub(1),
            captain_rank: 0,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: ServiceConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.participants < 2 {
            return Err(ConfigError::Invalid(format!(
                "need at least one client besides the server (participants={})",
                self.participants
            )));
        }
        if self.server_rank >= self.participants {
            return Err(ConfigError::Invalid(format!(
                "server_rank {} outside group of {}",
                self.server_rank, self.participants
            )));
        }
        if self.captain_rank >= self.participants || self.captain_rank == self.server_rank {
            return Err(ConfigError::Invalid(format!(
                "captain_rank {} must be a client rank",
                self.captain_rank
            )));
        }
        if self.high_water_mark == 0 {
            return Err(ConfigError::Invalid("high_water_mark must be positive".into()));
        }
        if self.max_group_len == 0 || self.max_locks_per_file == 0 || self.max_open_files == 0 {
            return Err(ConfigError::Invalid(
                "group, lock and open-file limits must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Every rank except the server, in rank order. This is also the barrier group.
    pub fn clients(&self) -> Vec<Rank> {
        (0..self.participants)
            .filter(|rank| *rank != self.server_rank)
            .collect()
    }

    pub fn client_count(&self) -> u32 {
        self.participants.saturating_sub(1)
    }
}

/// An explicit handle on "who am I inside which service".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub config: ServiceConfig,
    pub rank: Rank,
}

impl Session {
    pub fn new(config: ServiceConfig, rank: Rank) -> Result<Self, ConfigError> {
        config.validate()?;
        if rank >= config.participants {
            return Err(ConfigError::Invalid(format!(
                "rank {rank} outside group of {}",
                config.participants
            )));
        }
        Ok(Self { config, rank })
    }

    pub fn is_server(&self) -> bool {
        self.rank == self.config.server_rank
    }

    pub fn is_captain(&self) -> bool {
        self.rank == self.config.captain_rank
    }

    pub fn server_rank(&self) -> Rank {
        self.config.server_rank
    }
}

/// How raw data moves to the real file. Carried through to the raw I/O layer untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    #[default]
    Independent,
    Collective,
}

/// Per-file access parameters supplied when opening a file through the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileAccessConfig {
    /// Highest address the allocator may hand out; 0 means unlimited.
    pub max_address: u64,
    pub feature_flags: FeatureFlags,
    pub meta_block_size: u64,
    pub small_data_block_size: u64,
    /// Requests of at least this many bytes are aligned.
    pub threshold: u64,
    pub alignment: u64,
    pub transfer: TransferMode,
}

impl Default for FileAccessConfig {
    fn default() -> Self {
        Self {
            max_address: u64::MAX,
            feature_flags: FeatureFlags::AGGREGATE_METADATA
                .union(FeatureFlags::AGGREGATE_SMALLDATA),
            meta_block_size: DEFAULT_META_BLOCK_SIZE,
            small_data_block_size: DEFAULT_SMALL_DATA_BLOCK_SIZE,
            threshold: 1,
            alignment: 1,
            transfer: TransferMode::Independent,
        }
    }
}

impl FileAccessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alignment == 0 {
            return Err(ConfigError::Invalid("alignment must be at least 1".into()));
        }
        Ok(())
    }

    pub fn open_params(&self) -> OpenParams {
        OpenParams {
            max_address: self.max_address,
            feature_flags: self.feature_flags,
            meta_block_size: self.meta_block_size,
            small_data_block_size: self.small_data_block_size,
            threshold: self.threshold,
            alignment: self.alignment,
        }
    }
}

/// Service shape plus the TCP mesh it runs on, as read by the `flexpar-sap` binary.
#[cfg(feature = "net")]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub service: ServiceConfig,
    pub mesh: crate::transport::MeshConfig,
}

#[cfg(feature = "net")]
impl DeploymentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: DeploymentConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.validate()?;
        self.mesh
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.mesh.size() != self.service.participants {
            return Err(ConfigError::Invalid(format!(
                "mesh lists {} ranks but the service has {} participants",
                self.mesh.size(),
                self.service.participants
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_group_places_server_last() {
        let config = ServiceConfig::with_participants(4);
        assert_eq!(config.server_rank, 3);
        assert_eq!(config.clients(), vec![0, 1, 2]);
        assert_eq!(config.client_count(), 3);
        config.validate().unwrap();
    }

    #[test]
    fn captain_cannot_be_the_server() {
        let config = ServiceConfig {
            participants: 3,
            server_rank: 1,
            captain_rank: 1,
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn yaml_config_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sap.yaml");
        std::fs::write(&path, "participants: 5\nserver_rank: 0\ncaptain_rank: 2\n").unwrap();
        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.participants, 5);
        assert_eq!(config.captain_rank, 2);
        assert_eq!(config.high_water_mark, DEFAULT_HIGH_WATER_MARK);
        assert_eq!(config.clients(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn session_rejects_rank_outside_group() {
        assert!(Session::new(ServiceConfig::with_participants(3), 3).is_err());
        let session = Session::new(ServiceConfig::with_participants(3), 2).unwrap();
        assert!(session.is_server());
        assert!(!session.is_captain());
    }

    #[test]
    fn access_config_maps_to_open_params() {
        let access = FileAccessConfig {
            alignment: 512,
            threshold: 4096,
            ..FileAccessConfig::default()
        };
        let params = access.open_params();
        assert_eq!(params.alignment, 512);
        assert_eq!(params.threshold, 4096);
        assert!(params
            .feature_flags
            .contains(FeatureFlags::AGGREGATE_METADATA));
        assert!(FileAccessConfig {
            alignment: 0,
            ..access
        }
        .validate()
        .is_err());
    }

    #[test]
    fn zero_max_address_means_unlimited() {
        let access = FileAccessConfig {
            max_address: 0,
            ..FileAccessConfig::default()
        };
        access.validate().unwrap();
        assert_eq!(access.open_params().max_address, 0);
    }

    #[cfg(feature = "net")]
    #[test]
    fn deployment_requires_mesh_to_match_participants() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deploy.yaml");
        let yaml = "service:\n  participants: 3\n  server_rank: 2\n  captain_rank: 0\nmesh:\n  peers:\n    - { rank: 0, addr: \"127.0.0.1:7100\" }\n    - { rank: 1, addr: \"127.0.0.1:7101\" }\n";
        std::fs::write(&path, yaml).unwrap();
        assert!(matches!(
            DeploymentConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        let full = format!("{yaml}    - {{ rank: 2, addr: \"127.0.0.1:7102\" }}\n");
        std::fs::write(&path, full).unwrap();
        let deployment = DeploymentConfig::load(&path).unwrap();
        assert_eq!(deployment.mesh.size(), 3);
        assert_eq!(deployment.service.server_rank, 2);
    }
}
