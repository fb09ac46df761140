//! Versioned cluster documents owned by the target
//!
//! The bucket metadata (BMD) and the cluster map (Smap) are replicated
//! cluster-wide; the target installs new versions as they arrive from the
//! proxies and exposes read-only accessors plus a bounded
//! wait-for-version primitive used by transaction commits.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use tessera_common::{Bck, BucketProps, Error, Result};

/// Bucket metadata: the cluster-wide list of buckets and their properties
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bmd {
    pub version: u64,
    pub buckets: HashMap<String, BucketProps>,
}

impl Bmd {
    // buckets are keyed by their canonical display form
    fn key(bck: &Bck) -> String {
        bck.to_string()
    }

    /// Look a bucket up
    #[must_use]
    pub fn get(&self, bck: &Bck) -> Option<&BucketProps> {
        self.buckets.get(&Self::key(bck))
    }

    /// Record a bucket (new BMD construction on the proxy side, tests)
    pub fn put(&mut self, bck: &Bck, props: BucketProps) {
        self.buckets.insert(Self::key(bck), props);
    }

    /// Drop a bucket
    pub fn delete(&mut self, bck: &Bck) {
        self.buckets.remove(&Self::key(bck));
    }
}

/// Owner of the locally installed BMD
///
/// Installs are monotonically non-decreasing in version; every install
/// wakes all waiters so they can re-check their predicate.
#[derive(Default)]
pub struct BmdOwner {
    cur: Mutex<Arc<Bmd>>,
    cond: Condvar,
}

impl BmdOwner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current BMD
    #[must_use]
    pub fn get(&self) -> Arc<Bmd> {
        Arc::clone(&self.cur.lock())
    }

    /// Installed version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.cur.lock().version
    }

    /// Install a newer BMD; an older version is rejected with a warning
    /// (gossip may deliver out of order), same-version reinstall is a no-op.
    pub fn install(&self, bmd: Bmd) -> Arc<Bmd> {
        let mut cur = self.cur.lock();
        if bmd.version < cur.version {
            warn!(
                installed = cur.version,
                arrived = bmd.version,
                "ignoring stale bucket metadata"
            );
            return Arc::clone(&cur);
        }
        debug!(from = cur.version, to = bmd.version, "installing bucket metadata");
        *cur = Arc::new(bmd);
        let latest = Arc::clone(&cur);
        drop(cur);
        self.cond.notify_all();
        latest
    }

    /// Block until the installed version is `>= version` or the deadline
    /// expires.
    pub fn wait_for_version(&self, version: u64, timeout: Duration) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        let mut cur = self.cur.lock();
        while cur.version < version {
            if self.cond.wait_until(&mut cur, deadline).timed_out() {
                if cur.version >= version {
                    break;
                }
                return Err(Error::Timeout);
            }
        }
        Ok(cur.version)
    }
}

/// Cluster map: the set of nodes as gossiped by the proxies. Only the
/// pieces the storage core consumes are modeled here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Smap {
    pub version: u64,
    /// Target daemon ids
    pub targets: Vec<String>,
    /// Proxy daemon ids
    pub proxies: Vec<String>,
}

/// Owner of the locally installed Smap
#[derive(Default)]
pub struct SmapOwner {
    cur: Mutex<Arc<Smap>>,
}

impl SmapOwner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cluster map
    #[must_use]
    pub fn get(&self) -> Arc<Smap> {
        Arc::clone(&self.cur.lock())
    }

    /// Installed version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.cur.lock().version
    }

    /// Install a newer cluster map
    pub fn install(&self, smap: Smap) -> Arc<Smap> {
        let mut cur = self.cur.lock();
        if smap.version >= cur.version {
            *cur = Arc::new(smap);
        }
        Arc::clone(&cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tessera_common::types::Provider;

    #[test]
    fn test_bmd_lookup() {
        let mut bmd = Bmd::default();
        let bck = Bck::new("b1", Provider::Ais);
        assert!(bmd.get(&bck).is_none());
        bmd.put(&bck, BucketProps::default());
        assert!(bmd.get(&bck).is_some());
        bmd.delete(&bck);
        assert!(bmd.get(&bck).is_none());
    }

    #[test]
    fn test_install_monotonic() {
        let owner = BmdOwner::new();
        owner.install(Bmd {
            version: 5,
            ..Bmd::default()
        });
        assert_eq!(owner.version(), 5);
        // stale install is ignored
        owner.install(Bmd {
            version: 3,
            ..Bmd::default()
        });
        assert_eq!(owner.version(), 5);
    }

    #[test]
    fn test_wait_already_satisfied() {
        let owner = BmdOwner::new();
        owner.install(Bmd {
            version: 7,
            ..Bmd::default()
        });
        let v = owner
            .wait_for_version(7, Duration::from_millis(10))
            .unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn test_wait_timeout() {
        let owner = BmdOwner::new();
        let err = owner
            .wait_for_version(1, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.kind(), "ErrTimeout");
    }

    #[test]
    fn test_wait_wakes_on_install() {
        let owner = Arc::new(BmdOwner::new());
        let waiter = {
            let owner = Arc::clone(&owner);
            thread::spawn(move || owner.wait_for_version(7, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        owner.install(Bmd {
            version: 7,
            ..Bmd::default()
        });
        let v = waiter.join().unwrap().unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn test_smap_owner() {
        let owner = SmapOwner::new();
        owner.install(Smap {
            version: 2,
            targets: vec!["T1".into()],
            proxies: vec!["P1".into()],
        });
        assert_eq!(owner.version(), 2);
        assert_eq!(owner.get().targets, vec!["T1".to_string()]);
    }
}
