//! Capability interface to long-running workers
//!
//! The coordinator starts and stops rebalance-class workers but neither
//! runs them nor observes their state; everything goes through this seam.

use std::fmt;

use tessera_common::{Bck, Result};

/// Worker kinds the coordinator drives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XactKind {
    /// Replicates objects on PUT into a mirrored bucket
    PutCopies,
    /// Re-mirrors an entire bucket to a new copy count
    MakeNCopies,
    /// Fixes up object locations after a bucket rename
    FastRename,
}

impl fmt::Display for XactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PutCopies => "put-copies",
            Self::MakeNCopies => "make-n-copies",
            Self::FastRename => "fast-rename",
        };
        f.write_str(s)
    }
}

/// Worker parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XactArgs {
    /// Target copy count for (re-)mirroring
    Copies(u32),
    /// Source and destination of a bucket rename
    Rename { from: Bck, to: Bck },
}

/// The capability surface: abort a running worker, renew (start or
/// restart) one.
///
/// `renew` blocks until the worker has finished. In particular, a
/// `FastRename` renewal returns only after every object has been relocated;
/// the rename commit relies on this to order the hand-off.
pub trait Xactions: Send + Sync {
    /// Abort the worker of the given kind on the given bucket, if running
    fn abort(&self, kind: XactKind, bck: &Bck);

    /// Start (or restart) a worker and run it to completion
    fn renew(&self, kind: XactKind, bck: &Bck, args: XactArgs) -> Result<()>;
}

/// Default implementation for deployments without a worker runtime
/// (and for tests that only exercise the coordinator).
#[derive(Debug, Default)]
pub struct NoopXactions;

impl Xactions for NoopXactions {
    fn abort(&self, _kind: XactKind, _bck: &Bck) {}

    fn renew(&self, _kind: XactKind, _bck: &Bck, _args: XactArgs) -> Result<()> {
        Ok(())
    }
}

/// Test double recording every capability call in order
#[cfg(test)]
pub mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// One recorded capability call
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum XactEvent {
        Abort(XactKind, Bck),
        Renew(XactKind, Bck, XactArgs),
    }

    /// Records every call for later assertions
    #[derive(Debug, Default)]
    pub struct RecordingXactions {
        events: Mutex<Vec<XactEvent>>,
    }

    impl RecordingXactions {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        #[must_use]
        pub fn events(&self) -> Vec<XactEvent> {
            self.events.lock().clone()
        }
    }

    impl Xactions for RecordingXactions {
        fn abort(&self, kind: XactKind, bck: &Bck) {
            self.events.lock().push(XactEvent::Abort(kind, bck.clone()));
        }

        fn renew(&self, kind: XactKind, bck: &Bck, args: XactArgs) -> Result<()> {
            self.events
                .lock()
                .push(XactEvent::Renew(kind, bck.clone(), args));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::recording::{RecordingXactions, XactEvent};
    use super::*;
    use tessera_common::types::Provider;

    #[test]
    fn test_noop() {
        let x = NoopXactions;
        let bck = Bck::new("b1", Provider::Ais);
        x.abort(XactKind::PutCopies, &bck);
        x.renew(XactKind::MakeNCopies, &bck, XactArgs::Copies(3))
            .unwrap();
    }

    #[test]
    fn test_recording_order() {
        let x = RecordingXactions::new();
        let bck = Bck::new("b1", Provider::Ais);
        x.abort(XactKind::PutCopies, &bck);
        x.renew(XactKind::MakeNCopies, &bck, XactArgs::Copies(2))
            .unwrap();
        assert_eq!(
            x.events(),
            vec![
                XactEvent::Abort(XactKind::PutCopies, bck.clone()),
                XactEvent::Renew(XactKind::MakeNCopies, bck, XactArgs::Copies(2)),
            ]
        );
    }
}
