//! Configuration file support.
//!
//! Loads optional `trellis.toml` from the data directory. If no config file
//! exists, or it fails to parse, defaults are used.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::consensus::{RetreatOverrides, UnitId};
use crate::node::EngineConfig;
use crate::validation::UpgradeSchedule;

pub const CONFIG_FILE_NAME: &str = "trellis.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid retreat override unit id: {0}")]
    InvalidUnitId(String),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    pub storage: StorageConfig,
    pub consensus: ConsensusConfig,
    pub dependencies: DependenciesConfig,
    pub housekeeping: HousekeepingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("./trellis-data"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Hex unit ids forced as best tip whenever they are free
    pub retreat_overrides: Vec<String>,
    pub retreat_overrides_version: u32,
    pub upgrades: UpgradeSchedule,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DependenciesConfig {
    pub lost_unit_timeout_ms: u64,
    pub unhandled_ttl_ms: u64,
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        DependenciesConfig {
            lost_unit_timeout_ms: crate::constants::LOST_UNIT_TIMEOUT_MS,
            unhandled_ttl_ms: crate::constants::UNHANDLED_TTL_MS,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    pub archive_depth: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        HousekeepingConfig {
            archive_depth: crate::constants::ARCHIVE_DEPTH,
        }
    }
}

impl TrellisConfig {
    /// Load configuration from `trellis.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join(CONFIG_FILE_NAME);
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Parse the retreat override table.
    pub fn retreat_overrides(&self) -> Result<RetreatOverrides, ConfigError> {
        let units = self
            .consensus
            .retreat_overrides
            .iter()
            .map(|s| UnitId::from_hex(s).ok_or_else(|| ConfigError::InvalidUnitId(s.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RetreatOverrides::new(
            self.consensus.retreat_overrides_version,
            units,
        ))
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        Ok(EngineConfig {
            retreat_overrides: self.retreat_overrides()?,
            upgrades: self.consensus.upgrades,
            lost_unit_timeout_ms: self.dependencies.lost_unit_timeout_ms,
            unhandled_ttl_ms: self.dependencies.unhandled_ttl_ms,
            archive_depth: self.housekeeping.archive_depth,
            ..EngineConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = TrellisConfig::default();
        assert_eq!(
            config.dependencies.lost_unit_timeout_ms,
            crate::constants::LOST_UNIT_TIMEOUT_MS
        );
        assert_eq!(config.housekeeping.archive_depth, crate::constants::ARCHIVE_DEPTH);
        assert!(config.retreat_overrides().unwrap().is_empty());
        assert_eq!(config.consensus.upgrades, UpgradeSchedule::default());
    }

    #[test]
    fn parse_toml_config() {
        let id = UnitId([0xab; 32]);
        let toml_str = format!(
            r#"
[storage]
data_dir = "/var/lib/trellis"

[consensus]
retreat_overrides = ["{}"]
retreat_overrides_version = 2

[consensus.upgrades]
last_ball_stable_in_parents_mci = 1300000
witnessed_level_must_not_retreat_mci = 1400000

[dependencies]
lost_unit_timeout_ms = 5000

[housekeeping]
archive_depth = 10
"#,
            id.to_hex()
        );
        let config: TrellisConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/trellis"));
        assert_eq!(config.consensus.upgrades, UpgradeSchedule::legacy_mainnet());
        assert_eq!(config.dependencies.lost_unit_timeout_ms, 5000);
        assert_eq!(
            config.dependencies.unhandled_ttl_ms,
            crate::constants::UNHANDLED_TTL_MS
        );

        let engine = config.engine_config().unwrap();
        assert!(engine.retreat_overrides.contains(&id));
        assert_eq!(engine.retreat_overrides.version, 2);
        assert_eq!(engine.archive_depth, 10);
    }

    #[test]
    fn bad_override_id_is_an_error() {
        let mut config = TrellisConfig::default();
        config.consensus.retreat_overrides = vec!["not-hex".into()];
        assert!(matches!(
            config.engine_config(),
            Err(ConfigError::InvalidUnitId(_))
        ));
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrellisConfig::load(dir.path());
        assert_eq!(config.housekeeping.archive_depth, crate::constants::ARCHIVE_DEPTH);
    }

    #[test]
    fn unparsable_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[housekeeping\narchive_depth = ").unwrap();
        let config = TrellisConfig::load(dir.path());
        assert_eq!(config.housekeeping.archive_depth, crate::constants::ARCHIVE_DEPTH);
    }
}
