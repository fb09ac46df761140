//! Per-action transaction coordination
//!
//! Every bucket-mutating RPC arrives in one of three phases sharing a UUID:
//!
//! ```text
//!          begin (validate)         commit (await BMD)          committed
//! (none) ────────────────────► Pending ──────────────────────► (removed)
//!         │                        │
//!         │                        └── abort ──► (removed)
//!         └── on validation error ─► fail
//! ```
//!
//! Begin validates and records; it never mutates bucket directories or
//! worker configuration. Commit blocks until the BMD carrying the change
//! has been installed locally, then applies the side effects. Abort drops
//! the record silently.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use tessera_common::{Bck, BucketId, BucketProps, Config, Error, Result};
use tessera_fs::{ContentType, Volume};

use crate::cluster::{BmdOwner, SmapOwner};
use crate::gfn::Gfn;
use crate::txn::{Transactions, Txn, TxnAction};
use crate::xaction::{XactArgs, XactKind, Xactions};

// Hard cap on n-way mirroring.
const MAX_COPIES: u32 = 16;

/// Transaction phase, from the RPC path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Begin,
    Commit,
    Abort,
}

impl Phase {
    /// Parse the phase segment of the RPC path
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "begin" => Some(Self::Begin),
            "commit" => Some(Self::Commit),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Abort => "abort",
        }
    }
}

/// Bucket-mutating actions the coordinator handles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    CreateBucket,
    RenameBucket,
    SetBucketProps,
    MakeNCopies,
}

/// Wire form of a transaction RPC body
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxnRequest {
    pub action: Action,
    pub txn_id: String,
    /// Action-specific payload: destination bucket for rename, proposed
    /// properties for set-props, copy count for make-n-copies
    #[serde(default)]
    pub value: serde_json::Value,
}

struct Ctx<'a> {
    uuid: &'a str,
    bck: &'a Bck,
    timeout: Duration,
    caller: &'a str,
    value: &'a serde_json::Value,
}

/// The target-side transaction coordinator
pub struct Coordinator {
    config: Arc<Config>,
    vol: Arc<Volume>,
    bmd: Arc<BmdOwner>,
    smap: Arc<SmapOwner>,
    txns: Transactions,
    gfn: Arc<Gfn>,
    xactions: Arc<dyn Xactions>,
    // true when the target booted without a local BMD (rejoin after
    // decommission): pre-existing bucket directories are then tolerated
    nil_bmd: bool,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        vol: Arc<Volume>,
        bmd: Arc<BmdOwner>,
        smap: Arc<SmapOwner>,
        xactions: Arc<dyn Xactions>,
    ) -> Self {
        let nil_bmd = bmd.version() == 0;
        Self {
            config,
            vol,
            bmd,
            smap,
            txns: Transactions::new(),
            gfn: Arc::new(Gfn::new()),
            xactions,
            nil_bmd,
        }
    }

    #[must_use]
    pub fn transactions(&self) -> &Transactions {
        &self.txns
    }

    #[must_use]
    pub fn gfn(&self) -> &Arc<Gfn> {
        &self.gfn
    }

    #[must_use]
    pub fn bmd(&self) -> &Arc<BmdOwner> {
        &self.bmd
    }

    #[must_use]
    pub fn smap(&self) -> &Arc<SmapOwner> {
        &self.smap
    }

    #[must_use]
    pub fn volume(&self) -> &Arc<Volume> {
        &self.vol
    }

    /// Entry point for one transaction RPC
    pub fn dispatch(
        &self,
        bck: &Bck,
        phase: Phase,
        req: &TxnRequest,
        timeout: Duration,
        caller: &str,
    ) -> Result<()> {
        if req.txn_id.is_empty() {
            return Err(Error::validation("missing transaction id"));
        }
        let c = Ctx {
            uuid: &req.txn_id,
            bck,
            timeout,
            caller,
            value: &req.value,
        };
        match req.action {
            Action::CreateBucket => self.create_bucket(&c, phase),
            Action::RenameBucket => self.rename_bucket(&c, phase),
            Action::SetBucketProps => self.set_bucket_props(&c, phase),
            Action::MakeNCopies => self.make_n_copies(&c, phase),
        }
    }

    fn begin_txn(&self, c: &Ctx<'_>, action: TxnAction) -> Result<()> {
        let txn = Txn::new(
            c.uuid.to_string(),
            c.bck.clone(),
            action,
            self.smap.version(),
            self.bmd.version(),
            c.caller.to_string(),
            c.timeout,
        );
        info!(%txn, caller = c.caller, "begin");
        self.txns.begin(txn)
    }

    fn abort_txn(&self, c: &Ctx<'_>) {
        if let Some(txn) = self.txns.remove(c.uuid) {
            info!(%txn, "aborted");
        }
    }

    // create-bucket

    fn create_bucket(&self, c: &Ctx<'_>, phase: Phase) -> Result<()> {
        match phase {
            Phase::Begin => {
                if self.bmd.get().get(c.bck).is_some() {
                    return Err(Error::BucketAlreadyExists(c.bck.to_string()));
                }
                self.check_bck_dirs_absent(c.bck)?;
                self.begin_txn(c, TxnAction::CreateBucket)
            }
            Phase::Abort => {
                self.abort_txn(c);
                Ok(())
            }
            Phase::Commit => {
                let txn = self.txns.find(c.uuid)?;
                txn.wait_bmd(&self.bmd, c.timeout)?;
                let bid = self
                    .bmd
                    .get()
                    .get(c.bck)
                    .map(|props| props.bid)
                    .ok_or_else(|| Error::BucketNotFound(c.bck.to_string()))?;
                if let Err(e) =
                    self.vol
                        .create_bucket_dirs(c.bck, bid, self.nil_bmd, &self.config)
                {
                    error!(uuid = c.uuid, step = "create-dirs", %e, "commit failed");
                    return Err(e);
                }
                self.txns.remove(c.uuid);
                info!(uuid = c.uuid, bucket = %c.bck, "bucket created");
                Ok(())
            }
        }
    }

    // rename-bucket

    fn rename_bucket(&self, c: &Ctx<'_>, phase: Phase) -> Result<()> {
        match phase {
            Phase::Begin => {
                let to = parse_bck(c.value)?;
                let bmd = self.bmd.get();
                let from_bid = bmd
                    .get(c.bck)
                    .map(|props| props.bid)
                    .ok_or_else(|| Error::BucketNotFound(c.bck.to_string()))?;
                if bmd.get(&to).is_some() {
                    return Err(Error::BucketAlreadyExists(to.to_string()));
                }
                let cs = self.vol.refresh_cap_status(&self.config, None)?;
                cs.check_oos()?;
                self.check_bck_dirs_absent(&to)?;
                self.begin_txn(
                    c,
                    TxnAction::RenameBucket {
                        from: c.bck.clone(),
                        to,
                        from_bid,
                    },
                )
            }
            Phase::Abort => {
                self.abort_txn(c);
                Ok(())
            }
            Phase::Commit => {
                let commit_started = Instant::now();
                let txn = self.txns.find(c.uuid)?;
                let TxnAction::RenameBucket {
                    ref from,
                    ref to,
                    from_bid,
                } = txn.action
                else {
                    return Err(Error::validation("transaction action mismatch"));
                };
                txn.wait_bmd(&self.bmd, c.timeout)?;

                // open the global-find window so in-flight GETs can still
                // locate objects under the old name
                self.gfn.activate();
                if let Err(e) = self
                    .vol
                    .rename_bucket_dirs(from_bid, from, to, &self.config)
                {
                    self.gfn.deactivate();
                    error!(uuid = c.uuid, step = "rename-dirs", %e, "commit failed");
                    return Err(e);
                }
                // runs to completion: stragglers are relocated before the
                // hand-off is declared done
                if let Err(e) = self.xactions.renew(
                    XactKind::FastRename,
                    to,
                    XactArgs::Rename {
                        from: from.clone(),
                        to: to.clone(),
                    },
                ) {
                    self.gfn.deactivate();
                    error!(uuid = c.uuid, step = "fast-rename", %e, "commit failed");
                    return Err(e);
                }
                // drain lookups still bound to the old name, within what is
                // left of the commit timeout (at least one stats tick)
                let remaining = c
                    .timeout
                    .saturating_sub(commit_started.elapsed())
                    .max(self.config.periodic.stats_time());
                if !self.gfn.quiesce(remaining) {
                    warn!(uuid = c.uuid, "lookups still in flight after rename");
                }
                self.gfn.deactivate();
                self.txns.remove(c.uuid);
                info!(uuid = c.uuid, %from, %to, "bucket renamed");
                Ok(())
            }
        }
    }

    // set-bucket-props

    fn set_bucket_props(&self, c: &Ctx<'_>, phase: Phase) -> Result<()> {
        match phase {
            Phase::Begin => {
                let cur = self
                    .bmd
                    .get()
                    .get(c.bck)
                    .cloned()
                    .ok_or_else(|| Error::BucketNotFound(c.bck.to_string()))?;
                let next = parse_props(c.value)?;
                self.validate_props(&cur, &next)?;
                self.begin_txn(c, TxnAction::SetBucketProps { cur, next })
            }
            Phase::Abort => {
                self.abort_txn(c);
                Ok(())
            }
            Phase::Commit => {
                let txn = self.txns.find(c.uuid)?;
                let TxnAction::SetBucketProps { ref cur, ref next } = txn.action else {
                    return Err(Error::validation("transaction action mismatch"));
                };
                txn.wait_bmd(&self.bmd, c.timeout)?;
                if remirror(cur, next) {
                    self.xactions.abort(XactKind::PutCopies, c.bck);
                    self.xactions.renew(
                        XactKind::MakeNCopies,
                        c.bck,
                        XactArgs::Copies(next.mirror.copies),
                    )?;
                }
                self.txns.remove(c.uuid);
                Ok(())
            }
        }
    }

    fn validate_props(&self, cur: &BucketProps, next: &BucketProps) -> Result<()> {
        if next.mirror.enabled {
            let mpaths = self.vol.num_available();
            if next.mirror.copies as usize > mpaths {
                return Err(Error::validation(format!(
                    "{mpaths} mountpath(s) is insufficient for a {}-way mirror",
                    next.mirror.copies
                )));
            }
            if next.mirror.copies > cur.mirror.copies {
                let cs = self.vol.refresh_cap_status(&self.config, None)?;
                cs.check_high_wm()?;
            }
        }
        if next.ec.enabled && !cur.ec.enabled {
            let cs = self.vol.refresh_cap_status(&self.config, None)?;
            cs.check_oos()?;
        }
        Ok(())
    }

    // make-n-copies

    fn make_n_copies(&self, c: &Ctx<'_>, phase: Phase) -> Result<()> {
        match phase {
            Phase::Begin => {
                let next = parse_copies(c.value)?;
                let cur = self
                    .bmd
                    .get()
                    .get(c.bck)
                    .map(|props| props.mirror.copies)
                    .ok_or_else(|| Error::BucketNotFound(c.bck.to_string()))?;
                self.validate_ncopies(next)?;
                if next > cur {
                    let cs = self.vol.refresh_cap_status(&self.config, None)?;
                    cs.check_high_wm()?;
                }
                self.begin_txn(c, TxnAction::MakeNCopies { cur, next })
            }
            Phase::Abort => {
                self.abort_txn(c);
                Ok(())
            }
            Phase::Commit => {
                let txn = self.txns.find(c.uuid)?;
                let TxnAction::MakeNCopies { next, .. } = txn.action else {
                    return Err(Error::validation("transaction action mismatch"));
                };
                if let Ok(requested) = parse_copies(c.value) {
                    if requested != next {
                        warn!(
                            uuid = c.uuid,
                            begun = next,
                            requested,
                            "commit payload disagrees with begin"
                        );
                    }
                }
                txn.wait_bmd(&self.bmd, c.timeout)?;
                self.xactions.abort(XactKind::PutCopies, c.bck);
                self.xactions
                    .renew(XactKind::MakeNCopies, c.bck, XactArgs::Copies(next))?;
                self.txns.remove(c.uuid);
                Ok(())
            }
        }
    }

    fn validate_ncopies(&self, copies: u32) -> Result<()> {
        if copies == 0 || copies > MAX_COPIES {
            return Err(Error::validation(format!(
                "invalid number of copies: {copies} (expected 1..={MAX_COPIES})"
            )));
        }
        let mpaths = self.vol.num_available();
        if copies as usize > mpaths {
            return Err(Error::validation(format!(
                "{mpaths} mountpath(s) is insufficient for {copies} copies"
            )));
        }
        Ok(())
    }

    // helpers

    // a bucket about to be created (or renamed into) must not own a
    // non-empty directory on any available mountpath
    fn check_bck_dirs_absent(&self, bck: &Bck) -> Result<()> {
        let (available, _) = self.vol.get();
        for mi in available.values() {
            let dir = mi.make_path_ct(bck, BucketId::NONE, ContentType::Object);
            if tessera_common::fsutil::access(&dir).is_err() {
                continue;
            }
            let (names, empty) = tessera_common::fsutil::is_dir_empty(&dir)?;
            if !empty {
                return Err(Error::BucketDirNotEmpty { dir, names });
            }
        }
        Ok(())
    }
}

// The mirror configuration materially changed: worker restart required.
fn remirror(cur: &BucketProps, next: &BucketProps) -> bool {
    if !cur.mirror.enabled && next.mirror.enabled {
        return true;
    }
    if cur.mirror.enabled && next.mirror.enabled {
        return cur.mirror.copies != next.mirror.copies;
    }
    false
}

fn parse_bck(value: &serde_json::Value) -> Result<Bck> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::validation(format!("bad bucket payload: {e}")))
}

fn parse_props(value: &serde_json::Value) -> Result<BucketProps> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::validation(format!("bad bucket properties payload: {e}")))
}

fn parse_copies(value: &serde_json::Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| Error::validation("bad copy count payload"))
}
