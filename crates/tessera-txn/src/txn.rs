//! Transaction records and the UUID-keyed table
//!
//! A record is created at begin, removed at commit (after side effects) or
//! abort, and garbage-collected by the sweeper when the proxy disappears
//! mid-protocol.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use tessera_common::{Bck, BucketId, BucketProps, Error, Result};

use crate::cluster::BmdOwner;

// A pending record older than `timeout * EXPIRY_FACTOR` is presumed
// abandoned (proxy crashed between begin and commit).
const EXPIRY_FACTOR: u32 = 2;

/// Action-specific transaction payload
#[derive(Clone, Debug)]
pub enum TxnAction {
    CreateBucket,
    RenameBucket {
        from: Bck,
        to: Bck,
        from_bid: BucketId,
    },
    SetBucketProps {
        cur: BucketProps,
        next: BucketProps,
    },
    MakeNCopies {
        cur: u32,
        next: u32,
    },
}

impl TxnAction {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateBucket => "create-bucket",
            Self::RenameBucket { .. } => "rename-bucket",
            Self::SetBucketProps { .. } => "set-bucket-props",
            Self::MakeNCopies { .. } => "make-n-copies",
        }
    }
}

/// One server-side transaction
#[derive(Debug)]
pub struct Txn {
    pub uuid: String,
    pub bck: Bck,
    pub action: TxnAction,
    /// Cluster-map version observed at begin
    pub smap_ver: u64,
    /// BMD version observed at begin; commit waits for a strictly newer one
    pub bmd_ver: u64,
    /// Proxy that initiated the transaction
    pub caller: String,
    /// Commit-phase timeout supplied by the proxy
    pub timeout: Duration,
    started: Instant,
}

impl Txn {
    #[must_use]
    pub fn new(
        uuid: String,
        bck: Bck,
        action: TxnAction,
        smap_ver: u64,
        bmd_ver: u64,
        caller: String,
        timeout: Duration,
    ) -> Self {
        Self {
            uuid,
            bck,
            action,
            smap_ver,
            bmd_ver,
            caller,
            timeout,
            started: Instant::now(),
        }
    }

    /// Age of the record
    #[must_use]
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait until the BMD version that carries this transaction's change
    /// has been installed locally, bounded by `timeout`.
    pub fn wait_bmd(&self, bmd: &BmdOwner, timeout: Duration) -> Result<u64> {
        bmd.wait_for_version(self.bmd_ver + 1, timeout)
            .map_err(|_| Error::TxnBmdTimeout {
                uuid: self.uuid.clone(),
                bmd_ver: self.bmd_ver,
            })
    }
}

impl fmt::Display for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn[{} {} {}]", self.uuid, self.action.name(), self.bck)
    }
}

/// UUID-keyed transaction table
#[derive(Default)]
pub struct Transactions {
    m: Mutex<HashMap<String, Arc<Txn>>>,
}

impl Transactions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a begun transaction. A second begin with the same UUID
    /// collapses into the first and succeeds.
    pub fn begin(&self, txn: Txn) -> Result<()> {
        let mut m = self.m.lock();
        if m.contains_key(&txn.uuid) {
            return Ok(());
        }
        m.insert(txn.uuid.clone(), Arc::new(txn));
        Ok(())
    }

    /// Look a transaction up
    pub fn find(&self, uuid: &str) -> Result<Arc<Txn>> {
        self.m
            .lock()
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::TxnNotFound(uuid.to_string()))
    }

    /// Remove a transaction (commit applied, or abort); `None` when the
    /// UUID is unknown.
    pub fn remove(&self, uuid: &str) -> Option<Arc<Txn>> {
        self.m.lock().remove(uuid)
    }

    /// Number of live records
    #[must_use]
    pub fn len(&self) -> usize {
        self.m.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.m.lock().is_empty()
    }

    /// Drop records abandoned by their proxy; returns how many were
    /// removed.
    pub fn housekeep(&self) -> usize {
        let mut expired = Vec::new();
        {
            let mut m = self.m.lock();
            m.retain(|_, txn| {
                let keep = txn.age() <= txn.timeout * EXPIRY_FACTOR;
                if !keep {
                    expired.push(Arc::clone(txn));
                }
                keep
            });
        }
        for txn in &expired {
            warn!(%txn, age = ?txn.age(), "expiring abandoned transaction");
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Bmd;
    use std::thread;
    use tessera_common::types::Provider;

    fn mk_txn(uuid: &str, timeout: Duration) -> Txn {
        Txn::new(
            uuid.to_string(),
            Bck::new("b1", Provider::Ais),
            TxnAction::CreateBucket,
            1,
            4,
            "P1".to_string(),
            timeout,
        )
    }

    #[test]
    fn test_begin_find_remove() {
        let txns = Transactions::new();
        txns.begin(mk_txn("u1", Duration::from_secs(1))).unwrap();
        assert_eq!(txns.len(), 1);

        let txn = txns.find("u1").unwrap();
        assert_eq!(txn.uuid, "u1");
        assert_eq!(txn.bmd_ver, 4);

        assert!(txns.remove("u1").is_some());
        assert!(txns.remove("u1").is_none());
        let err = txns.find("u1").unwrap_err();
        assert_eq!(err.kind(), "ErrTxnNotFound");
    }

    #[test]
    fn test_begin_same_uuid_collapses() {
        let txns = Transactions::new();
        txns.begin(mk_txn("u1", Duration::from_secs(1))).unwrap();
        txns.begin(mk_txn("u1", Duration::from_secs(9))).unwrap();
        assert_eq!(txns.len(), 1);
        // the first record wins
        assert_eq!(txns.find("u1").unwrap().timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_wait_bmd_arrives() {
        let txns = Transactions::new();
        txns.begin(mk_txn("u1", Duration::from_secs(1))).unwrap();
        let txn = txns.find("u1").unwrap();

        let bmd = Arc::new(BmdOwner::new());
        bmd.install(Bmd {
            version: 4,
            ..Bmd::default()
        });
        let installer = {
            let bmd = Arc::clone(&bmd);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                bmd.install(Bmd {
                    version: 5,
                    ..Bmd::default()
                });
            })
        };
        let v = txn.wait_bmd(&bmd, Duration::from_secs(5)).unwrap();
        assert_eq!(v, 5);
        installer.join().unwrap();
    }

    #[test]
    fn test_wait_bmd_timeout() {
        let txns = Transactions::new();
        txns.begin(mk_txn("u1", Duration::from_secs(1))).unwrap();
        let txn = txns.find("u1").unwrap();
        let bmd = BmdOwner::new();

        let err = txn.wait_bmd(&bmd, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), "ErrTxnBmdTimeout");
    }

    #[test]
    fn test_housekeep_expires_abandoned() {
        let txns = Transactions::new();
        txns.begin(mk_txn("young", Duration::from_secs(60))).unwrap();
        txns.begin(mk_txn("old", Duration::from_millis(5))).unwrap();
        thread::sleep(Duration::from_millis(25));

        let removed = txns.housekeep();
        assert_eq!(removed, 1);
        assert!(txns.find("old").is_err());
        assert!(txns.find("young").is_ok());
    }
}
