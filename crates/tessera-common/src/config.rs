//! Target configuration
//!
//! Nested sections with serde defaults; the daemon loads a JSON file at
//! startup and keeps the value behind a shared handle so watermark changes
//! are picked up on the next capacity refresh.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Root configuration for a target
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Mountpath roots this target services
    #[serde(default)]
    pub fspaths: Vec<PathBuf>,
    #[serde(default)]
    pub space: SpaceConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub periodic: PeriodConfig,
    #[serde(default)]
    pub txn: TxnConfig,
    #[serde(default)]
    pub net: NetConfig,
    /// Policy for writing per-mountpath metadata (xattrs, VMD)
    #[serde(default)]
    pub md_write: MdWritePolicy,
    /// Testing mode: permits disk-less mountpaths and mountpaths sharing a
    /// filesystem (e.g. several tmpdirs on one fs)
    #[serde(default)]
    pub testing_env: bool,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let cfg = serde_json::from_slice(&data).map_err(|e| {
            crate::error::Error::invalid_path(
                path.as_ref().display().to_string(),
                format!("bad config: {e}"),
            )
        })?;
        Ok(cfg)
    }

    /// Configuration for unit tests: disk-less mountpaths allowed, shared
    /// fsids allowed, no xattr/VMD side writes unless the test opts in.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            testing_env: true,
            md_write: MdWritePolicy::Never,
            ..Self::default()
        }
    }
}

/// Capacity watermarks, in percent of used space
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Crossing this triggers a capacity error on the aggregate status
    pub high_wm: i64,
    /// Crossing this flags the target out-of-space
    pub oos_wm: i64,
    /// Below this the target is considered comfortably utilized
    pub low_wm: i64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            high_wm: 90,
            oos_wm: 95,
            low_wm: 75,
        }
    }
}

/// Per-disk utilization thresholds for the io-stat tracker
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Utilization (%) below which a mountpath counts as idle
    pub disk_util_low_wm: i64,
    /// Utilization (%) above which a mountpath counts as busy
    pub disk_util_high_wm: i64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            disk_util_low_wm: 20,
            disk_util_high_wm: 80,
        }
    }
}

/// Periodic intervals, milliseconds
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PeriodConfig {
    /// Stats ticker period; also the fastest capacity refresh cadence
    pub stats_time_ms: u64,
    /// Slowest capacity refresh cadence, used when utilization is low
    pub capacity_upd_time_ms: u64,
    /// Trash sweeper period
    pub trash_sweep_ms: u64,
}

impl PeriodConfig {
    #[must_use]
    pub const fn stats_time(&self) -> Duration {
        Duration::from_millis(self.stats_time_ms)
    }

    #[must_use]
    pub const fn capacity_upd_time(&self) -> Duration {
        Duration::from_millis(self.capacity_upd_time_ms)
    }

    #[must_use]
    pub const fn trash_sweep(&self) -> Duration {
        Duration::from_millis(self.trash_sweep_ms)
    }
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self {
            stats_time_ms: 10_000,
            capacity_upd_time_ms: 600_000,
            trash_sweep_ms: 60_000,
        }
    }
}

/// Transaction coordinator knobs
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Commit-phase timeout used when the proxy does not supply one
    pub default_timeout_ms: u64,
    /// Sweeper period for expiring abandoned transactions
    pub sweep_interval_ms: u64,
}

impl TxnConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            sweep_interval_ms: 10_000,
        }
    }
}

/// Listen addresses
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct NetConfig {
    /// Address for the intra-cluster control plane (txn endpoint)
    pub listen: SocketAddr,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8081)),
        }
    }
}

/// Policy for per-mountpath metadata writes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MdWritePolicy {
    /// Write xattrs and VMD on every membership change
    #[default]
    Always,
    /// Never write metadata (diskless deployments, tests)
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_watermarks() {
        let cfg = Config::default();
        assert_eq!(cfg.space.high_wm, 90);
        assert_eq!(cfg.space.oos_wm, 95);
        assert!(cfg.space.low_wm < cfg.space.high_wm);
        assert!(cfg.periodic.stats_time() < cfg.periodic.capacity_upd_time());
    }

    #[test]
    fn test_testing_config() {
        let cfg = Config::testing();
        assert!(cfg.testing_env);
        assert_eq!(cfg.md_write, MdWritePolicy::Never);
    }

    #[test]
    fn test_load_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"fspaths": ["/data/m1"], "space": {{"high_wm": 85, "oos_wm": 92, "low_wm": 60}}}}"#
        )
        .unwrap();
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.fspaths, vec![PathBuf::from("/data/m1")]);
        assert_eq!(cfg.space.high_wm, 85);
        // untouched sections fall back to defaults
        assert_eq!(cfg.txn.default_timeout_ms, 30_000);
    }
}
