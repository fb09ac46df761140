//! Per-mountpath io-stat tracking
//!
//! An external stats ticker samples utilization and per-disk IOPS and feeds
//! them here; the registry keeps membership in lock-step with the Available
//! set (a mountpath is tracked iff it is available).

use parking_lot::RwLock;
use std::collections::HashMap;

// Exponential moving-average weight for new samples.
const EWMA_ALPHA: f64 = 0.5;

#[derive(Debug, Default)]
struct MpathStats {
    disks: Vec<String>,
    util_avg: f64,
    iops: HashMap<String, f64>,
}

/// Tracker of per-mountpath utilization and per-disk IOPS moving averages
#[derive(Debug, Default)]
pub struct IostatTracker {
    mpaths: RwLock<HashMap<String, MpathStats>>,
}

impl IostatTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a mountpath and its owned disks
    pub fn add_mpath(&self, mpath: &str, disks: &[String]) {
        let mut m = self.mpaths.write();
        m.entry(mpath.to_string()).or_default().disks = disks.to_vec();
    }

    /// Stop tracking a mountpath
    pub fn remove_mpath(&self, mpath: &str) {
        self.mpaths.write().remove(mpath);
    }

    /// Whether the mountpath is currently tracked
    #[must_use]
    pub fn is_tracked(&self, mpath: &str) -> bool {
        self.mpaths.read().contains_key(mpath)
    }

    /// Feed one utilization sample (percent) for a mountpath
    pub fn record_util(&self, mpath: &str, util_pct: f64) {
        let mut m = self.mpaths.write();
        if let Some(st) = m.get_mut(mpath) {
            st.util_avg = EWMA_ALPHA * util_pct + (1.0 - EWMA_ALPHA) * st.util_avg;
        }
    }

    /// Feed one IOPS sample for a disk owned by a mountpath
    pub fn record_iops(&self, mpath: &str, disk: &str, iops: f64) {
        let mut m = self.mpaths.write();
        if let Some(st) = m.get_mut(mpath) {
            let cur = st.iops.entry(disk.to_string()).or_insert(0.0);
            *cur = EWMA_ALPHA * iops + (1.0 - EWMA_ALPHA) * *cur;
        }
    }

    /// Smoothed utilization (percent, rounded down); negative when the
    /// mountpath is not tracked, matching "no data" semantics.
    #[must_use]
    pub fn util(&self, mpath: &str) -> i64 {
        self.mpaths
            .read()
            .get(mpath)
            .map_or(-1, |st| st.util_avg as i64)
    }

    /// Smoothed IOPS for one disk, if tracked
    #[must_use]
    pub fn disk_iops(&self, mpath: &str, disk: &str) -> Option<f64> {
        self.mpaths.read().get(mpath)?.iops.get(disk).copied()
    }

    /// Number of tracked mountpaths
    #[must_use]
    pub fn len(&self) -> usize {
        self.mpaths.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mpaths.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let t = IostatTracker::new();
        assert!(!t.is_tracked("/m1"));
        t.add_mpath("/m1", &["sda".to_string()]);
        assert!(t.is_tracked("/m1"));
        assert_eq!(t.util("/m1"), 0);
        t.remove_mpath("/m1");
        assert!(!t.is_tracked("/m1"));
        assert_eq!(t.util("/m1"), -1);
    }

    #[test]
    fn test_util_moving_average() {
        let t = IostatTracker::new();
        t.add_mpath("/m1", &[]);
        t.record_util("/m1", 100.0);
        assert_eq!(t.util("/m1"), 50);
        t.record_util("/m1", 100.0);
        assert_eq!(t.util("/m1"), 75);
        // samples for untracked paths are dropped
        t.record_util("/m2", 100.0);
        assert_eq!(t.util("/m2"), -1);
    }

    #[test]
    fn test_disk_iops() {
        let t = IostatTracker::new();
        t.add_mpath("/m1", &["sda".to_string()]);
        assert_eq!(t.disk_iops("/m1", "sda"), None);
        t.record_iops("/m1", "sda", 200.0);
        assert_eq!(t.disk_iops("/m1", "sda"), Some(100.0));
    }
}
