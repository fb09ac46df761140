//! Capacity value types and watermark arithmetic
//!
//! Per-mountpath [`Capacity`] is sampled by statvfs and cached on the
//! mountpath; the registry aggregates the Available set into a [`CapStatus`]
//! and derives the next refresh interval from it.

use serde::Serialize;
use std::time::Duration;

use tessera_common::config::{Config, SpaceConfig};
use tessera_common::Error;

/// Used/available bytes and used percentage of one mountpath
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Capacity {
    /// Bytes used
    pub used: u64,
    /// Bytes available
    pub avail: u64,
    /// Percent used
    pub pct_used: i32,
}

/// Aggregate capacity status across all Available mountpaths
#[derive(Clone, Debug, Default, Serialize)]
pub struct CapStatus {
    pub total_used: u64,
    pub total_avail: u64,
    /// Average used percentage, floored
    pub pct_avg: i32,
    /// Maximum used percentage across mountpaths
    pub pct_max: i32,
    /// True when `pct_max` exceeds the out-of-space watermark
    pub oos: bool,
    // Watermarks in effect when this status was computed; kept so the
    // error accessors reproduce the exact refresh-time verdict.
    #[serde(skip)]
    high_wm: i64,
    #[serde(skip)]
    oos_wm: i64,
}

impl CapStatus {
    /// Aggregate per-mountpath capacities under the given watermarks
    #[must_use]
    pub fn aggregate<'a>(caps: impl Iterator<Item = &'a Capacity>, space: &SpaceConfig) -> Self {
        let mut cs = Self {
            high_wm: space.high_wm,
            oos_wm: space.oos_wm,
            ..Self::default()
        };
        let mut n: i64 = 0;
        let mut pct_sum: i64 = 0;
        for c in caps {
            cs.total_used += c.used;
            cs.total_avail += c.avail;
            cs.pct_max = cs.pct_max.max(c.pct_used);
            pct_sum += i64::from(c.pct_used);
            n += 1;
        }
        if n > 0 {
            cs.pct_avg = (pct_sum / n) as i32;
        }
        cs.oos = i64::from(cs.pct_max) > space.oos_wm;
        cs
    }

    /// Non-null when the high watermark has been crossed (out-of-space
    /// implies high). High watermark alone does not block writes; callers
    /// admitting PUTs consult [`CapStatus::check_oos`].
    #[must_use]
    pub fn err(&self) -> Option<Error> {
        if self.oos {
            return Some(Error::CapacityOos {
                pct_max: self.pct_max,
                oos_wm: self.oos_wm,
            });
        }
        if i64::from(self.pct_max) > self.high_wm {
            return Some(Error::CapacityHigh {
                pct_max: self.pct_max,
                high_wm: self.high_wm,
                total_used: self.total_used,
                total: self.total_used + self.total_avail,
            });
        }
        None
    }

    /// Fail only when the target is out of space
    pub fn check_oos(&self) -> Result<(), Error> {
        if self.oos {
            return Err(Error::CapacityOos {
                pct_max: self.pct_max,
                oos_wm: self.oos_wm,
            });
        }
        Ok(())
    }

    /// Fail when the high watermark (or worse) has been crossed
    pub fn check_high_wm(&self) -> Result<(), Error> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Next capacity-refresh interval: `capacity_upd_time` while utilization is
/// comfortable, `stats_time` at (or past) the out-of-space watermark, linear
/// in between. Thresholds come from the live config on every call.
#[must_use]
pub fn next_refresh(pct_avg: i32, config: &Config) -> Duration {
    let util = i64::from(pct_avg);
    let umin = (config.space.high_wm - 10).max(config.space.low_wm);
    let umax = config.space.oos_wm;
    let tmin = config.periodic.stats_time();
    let tmax = config.periodic.capacity_upd_time();
    if util <= umin || umin >= umax {
        return tmax;
    }
    if util >= umax {
        return tmin;
    }
    let ratio = ((util - umin) * 100 / (umax - umin)) as u32;
    tmin + (tmax - tmin) * (100 - ratio) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(pcts: &[i32]) -> Vec<Capacity> {
        pcts.iter()
            .map(|&p| Capacity {
                used: p as u64 * 10,
                avail: (100 - p) as u64 * 10,
                pct_used: p,
            })
            .collect()
    }

    #[test]
    fn test_aggregate_avg_floor_and_max() {
        let space = SpaceConfig::default();
        let v = caps(&[10, 21]);
        let cs = CapStatus::aggregate(v.iter(), &space);
        assert_eq!(cs.pct_avg, 15); // floor(31/2)
        assert_eq!(cs.pct_max, 21);
        assert!(!cs.oos);
        assert!(cs.err().is_none());
    }

    #[test]
    fn test_aggregate_over_watermarks() {
        // high=90, oos=95; utilization [92, 96]
        let space = SpaceConfig::default();
        let v = caps(&[92, 96]);
        let cs = CapStatus::aggregate(v.iter(), &space);
        assert_eq!(cs.pct_avg, 94);
        assert_eq!(cs.pct_max, 96);
        assert!(cs.oos);
        let err = cs.err().expect("above high watermark");
        assert_eq!(err.kind(), "ErrCapacityOOS");
        assert!(cs.check_oos().is_err());
    }

    #[test]
    fn test_aggregate_high_but_not_oos() {
        let space = SpaceConfig::default();
        let v = caps(&[91, 85]);
        let cs = CapStatus::aggregate(v.iter(), &space);
        assert!(!cs.oos);
        assert!(cs.check_oos().is_ok());
        let err = cs.err().expect("above high watermark");
        assert_eq!(err.kind(), "ErrCapacityHigh");
    }

    #[test]
    fn test_next_refresh_bounds() {
        let config = Config::default();
        let tmin = config.periodic.stats_time();
        let tmax = config.periodic.capacity_upd_time();

        assert_eq!(next_refresh(10, &config), tmax);
        assert_eq!(next_refresh(80, &config), tmax); // == high-10
        assert_eq!(next_refresh(95, &config), tmin);
        assert_eq!(next_refresh(99, &config), tmin);

        let mid = next_refresh(88, &config);
        assert!(mid > tmin && mid < tmax);
        // monotonically shrinking as utilization grows
        assert!(next_refresh(92, &config) < mid);
    }
}
