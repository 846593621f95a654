//! Instance configuration
//!
//! Loaded from a TOML file, then overridden by command-line flags. The
//! resulting [`InstanceConfig`] is immutable for the rest of the run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::codec::StreamCodec;
use crate::error::{ArchiveError, Result};
use crate::location::Location;
use crate::partial::{GrowthRule, StalePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressAlgorithm {
    #[default]
    None,
    Zlib,
    Pglz,
}

impl std::str::FromStr for CompressAlgorithm {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressAlgorithm::None),
            "zlib" => Ok(CompressAlgorithm::Zlib),
            "pglz" => Ok(CompressAlgorithm::Pglz),
            other => Err(ArchiveError::config(format!(
                "invalid compress algorithm value \"{}\"",
                other
            ))),
        }
    }
}

/// Which side of the transfer runs behind the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTarget {
    #[default]
    Backup,
    Db,
}

impl From<RemoteTarget> for Location {
    fn from(t: RemoteTarget) -> Self {
        match t {
            RemoteTarget::Backup => Location::BackupHost,
            RemoteTarget::Db => Location::DbHost,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Transport program, `ssh` when unset
    pub proto: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub ssh_config: Option<PathBuf>,
    /// Raw extra transport options, split with quoting rules
    pub ssh_options: Option<String>,
    /// Directory holding this binary on the remote host
    pub path: Option<String>,
    pub target: RemoteTarget,
}

impl RemoteConfig {
    pub fn is_enabled(&self) -> bool {
        self.host.is_some()
    }

    pub fn proto(&self) -> &str {
        self.proto.as_deref().unwrap_or("ssh")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StaleConfig {
    pub interval_ms: u64,
    pub rounds: u32,
    pub growth: GrowthRule,
}

impl Default for StaleConfig {
    fn default() -> Self {
        let p = StalePolicy::default();
        Self {
            interval_ms: p.interval.as_millis() as u64,
            rounds: p.rounds,
            growth: p.growth,
        }
    }
}

impl StaleConfig {
    pub fn policy(&self) -> StalePolicy {
        StalePolicy {
            interval: Duration::from_millis(self.interval_ms),
            rounds: self.rounds,
            growth: self.growth,
        }
    }
}

pub const DEFAULT_COMPRESS_LEVEL: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub name: String,
    pub archive_dir: Option<PathBuf>,
    pub system_identifier: Option<u64>,
    pub compress_algorithm: CompressAlgorithm,
    pub compress_level: u32,
    pub num_threads: u32,
    pub log_file: Option<PathBuf>,
    pub stale: StaleConfig,
    pub remote: RemoteConfig,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            archive_dir: None,
            system_identifier: None,
            compress_algorithm: CompressAlgorithm::None,
            compress_level: DEFAULT_COMPRESS_LEVEL,
            num_threads: 1,
            log_file: None,
            stale: StaleConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl InstanceConfig {
    pub fn from_toml(data: &str) -> Result<Self> {
        toml::from_str(data).map_err(|e| ArchiveError::config(format!("invalid config: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ArchiveError::io("read config file", path, e))?;
        Self::from_toml(&data)
    }

    /// Check the fields every command needs.
    pub fn validate(&self) -> Result<()> {
        if self.archive_dir.is_none() {
            return Err(ArchiveError::config("required parameter not specified: archive-dir"));
        }
        if self.compress_level > 9 {
            return Err(ArchiveError::config(format!(
                "compress-level must be in range 0..9, got {}",
                self.compress_level
            )));
        }
        self.stale_policy().check()
    }

    pub fn archive_dir(&self) -> Result<&Path> {
        self.archive_dir
            .as_deref()
            .ok_or_else(|| ArchiveError::config("required parameter not specified: archive-dir"))
    }

    pub fn system_identifier(&self) -> Result<u64> {
        self.system_identifier.ok_or_else(|| {
            ArchiveError::config("required parameter not specified: system-identifier")
        })
    }

    /// Codec to use when pushing `segment_name`.
    ///
    /// Only real segment files are compressed; pglz is refused.
    pub fn push_codec(&self, segment_name: &str) -> Result<StreamCodec> {
        match self.compress_algorithm {
            CompressAlgorithm::Pglz => Err(ArchiveError::config(
                "pglz compression is not supported",
            )),
            CompressAlgorithm::Zlib if crate::segment::is_xlog_file_name(segment_name) => {
                Ok(StreamCodec::Gzip {
                    level: self.compress_level,
                })
            }
            _ => Ok(StreamCodec::Identity),
        }
    }

    pub fn stale_policy(&self) -> StalePolicy {
        self.stale.policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "node1"
archive_dir = "/backup/wal/node1"
system_identifier = 7012345678901234567
compress_algorithm = "zlib"
compress_level = 3

[stale]
interval_ms = 250
rounds = 8
growth = "changed"

[remote]
host = "db1.example"
port = "2222"
ssh_options = "-o 'StrictHostKeyChecking=no'"
path = "/usr/local/bin"
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = InstanceConfig::from_toml(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.name, "node1");
        assert_eq!(cfg.system_identifier().unwrap(), 7012345678901234567);
        assert_eq!(cfg.compress_algorithm, CompressAlgorithm::Zlib);
        assert_eq!(cfg.remote.proto(), "ssh");
        assert!(cfg.remote.is_enabled());
        assert_eq!(cfg.remote.target, RemoteTarget::Backup);
        let p = cfg.stale_policy();
        assert_eq!(p.interval, Duration::from_millis(250));
        assert_eq!(p.rounds, 8);
        assert_eq!(p.growth, GrowthRule::Changed);
    }

    #[test]
    fn test_defaults() {
        let cfg = InstanceConfig::from_toml("archive_dir = \"/a\"").unwrap();
        assert_eq!(cfg.compress_level, DEFAULT_COMPRESS_LEVEL);
        assert_eq!(cfg.stale_policy(), StalePolicy::default());
        assert!(!cfg.remote.is_enabled());
        assert!(cfg.system_identifier().is_err());
    }

    #[test]
    fn test_missing_archive_dir() {
        let cfg = InstanceConfig::default();
        assert!(cfg.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_level_out_of_range() {
        let cfg = InstanceConfig::from_toml("archive_dir = \"/a\"\ncompress_level = 12").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_stale_window_rejected() {
        let zero_rounds =
            InstanceConfig::from_toml("archive_dir = \"/a\"\n[stale]\nrounds = 0").unwrap();
        assert!(zero_rounds.validate().unwrap_err().is_config());

        let zero_interval =
            InstanceConfig::from_toml("archive_dir = \"/a\"\n[stale]\ninterval_ms = 0").unwrap();
        assert!(zero_interval.validate().unwrap_err().is_config());

        let ok = InstanceConfig::from_toml("archive_dir = \"/a\"\n[stale]\nrounds = 1").unwrap();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_push_codec_selection() {
        let mut cfg = InstanceConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(
            cfg.push_codec("000000010000000000000001").unwrap(),
            StreamCodec::Gzip { level: 3 }
        );
        assert_eq!(
            cfg.push_codec("00000002.history").unwrap(),
            StreamCodec::Identity
        );

        cfg.compress_algorithm = CompressAlgorithm::Pglz;
        assert!(cfg.push_codec("000000010000000000000001").is_err());

        cfg.compress_algorithm = CompressAlgorithm::None;
        assert_eq!(
            cfg.push_codec("000000010000000000000001").unwrap(),
            StreamCodec::Identity
        );
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("ZLIB".parse::<CompressAlgorithm>().unwrap(), CompressAlgorithm::Zlib);
        assert!("lz4".parse::<CompressAlgorithm>().is_err());
    }

    #[test]
    fn test_unknown_field_type_is_config_error() {
        let err = InstanceConfig::from_toml("compress_level = \"high\"").unwrap_err();
        assert!(err.is_config());
    }
}
