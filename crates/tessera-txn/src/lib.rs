//! Target-side bucket transaction coordination
//!
//! This crate implements the two-phase (begin/commit, with abort) protocol
//! a proxy drives against every target when bucket metadata changes:
//! - Versioned owners of the cluster map and the bucket metadata, with a
//!   bounded wait-for-version primitive
//! - The UUID-keyed transaction table and its expiry sweeper
//! - The per-action coordinator: validation at begin, side effects at
//!   commit, silent abort
//! - The capability seam to external long-running workers (xactions)
//! - The global-find window used while a bucket rename propagates

pub mod cluster;
pub mod coordinator;
pub mod gfn;
pub mod txn;
pub mod xaction;

// Re-exports
pub use cluster::{Bmd, BmdOwner, Smap, SmapOwner};
pub use coordinator::{Action, Coordinator, Phase, TxnRequest};
pub use gfn::Gfn;
pub use txn::{Transactions, Txn, TxnAction};
pub use xaction::{NoopXactions, XactArgs, XactKind, Xactions};
