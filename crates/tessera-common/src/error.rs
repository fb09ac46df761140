//! Error types for the Tessera target core
//!
//! One shared enum across the mountpath, VMD, capacity, and transaction
//! layers. Every variant maps to a stable machine-readable kind string that
//! travels in RPC response bodies, and to an HTTP status for the txn
//! endpoint.

use thiserror::Error;

/// Common result type for target-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the target core
#[derive(Debug, Error)]
pub enum Error {
    // Mountpath / VMD layer
    #[error("invalid mountpath {mpath:?}: {reason}")]
    InvalidPath { mpath: String, reason: String },

    #[error("mountpath {path:?} is not accessible: {source}")]
    NotAccessible {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("fsid {fsid:#x}: filesystem sharing is not allowed: {mpath} vs {existing}")]
    FsidConflict {
        fsid: u64,
        mpath: String,
        existing: String,
    },

    #[error("mountpath {0} already exists")]
    DuplicatePath(String),

    #[error("mountpath {mpath} belongs to target {found:?}, expected {expected:?}")]
    MpathIdMismatch {
        mpath: String,
        found: String,
        expected: String,
    },

    #[error("mountpath {0} does not exist")]
    MpathNotFound(String),

    #[error("{mpath} has no disks")]
    NoDisks { mpath: String },

    #[error("volume metadata belongs to daemon {found:?}, expected {expected:?}")]
    VmdIdMismatch { found: String, expected: String },

    #[error("corrupt volume metadata at {path:?}: {reason}")]
    VmdCorrupt { path: String, reason: String },

    #[error("volume metadata write quorum not reached: {written} of {available} mountpaths")]
    VmdQuorum { written: usize, available: usize },

    #[error("no mountpaths")]
    NoMountpaths,

    // Bucket-dir lifecycle
    #[error("directory {dir:?} already exists and is not empty ({names:?}...)")]
    BucketDirNotEmpty { dir: String, names: Vec<String> },

    #[error("bucket rename {from} => {to} failed and was rolled back: {reason}")]
    RenameRollback {
        from: String,
        to: String,
        reason: String,
    },

    // Capacity monitor
    #[error(
        "used capacity {pct_max}% exceeds high watermark {high_wm}% \
         (used {total_used}B of {total}B)"
    )]
    CapacityHigh {
        pct_max: i32,
        high_wm: i64,
        total_used: u64,
        total: u64,
    },

    #[error("out of space: used capacity {pct_max}% exceeds {oos_wm}%")]
    CapacityOos { pct_max: i32, oos_wm: i64 },

    // Transaction coordinator
    #[error("transaction {0:?} not found")]
    TxnNotFound(String),

    #[error("transaction {uuid:?}: timed out waiting for bucket metadata version > {bmd_ver}")]
    TxnBmdTimeout { uuid: String, bmd_ver: u64 },

    #[error("transaction validation failed: {0}")]
    TxnValidation(String),

    // Bucket preconditions surfaced from BMD
    #[error("bucket {0} does not exist")]
    BucketNotFound(String),

    #[error("bucket {0} already exists")]
    BucketAlreadyExists(String),

    // Generic
    #[error("timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::TxnValidation(msg.into())
    }

    /// Create an invalid-path error
    pub fn invalid_path(mpath: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            mpath: mpath.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable error kind carried in RPC response bodies
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPath { .. } => "ErrInvalidPath",
            Self::NotAccessible { .. } => "ErrNotAccessible",
            Self::FsidConflict { .. } => "ErrFsidConflict",
            Self::DuplicatePath(_) => "ErrDuplicatePath",
            Self::MpathIdMismatch { .. } => "ErrMpathIdMismatch",
            Self::MpathNotFound(_) => "ErrMpathNotFound",
            Self::NoDisks { .. } => "ErrMpathNoDisks",
            Self::VmdIdMismatch { .. } => "ErrVmdIdMismatch",
            Self::VmdCorrupt { .. } => "ErrVmdCorrupt",
            Self::VmdQuorum { .. } => "ErrVmdQuorum",
            Self::NoMountpaths => "ErrNoMountpaths",
            Self::BucketDirNotEmpty { .. } => "ErrBucketDirNotEmpty",
            Self::RenameRollback { .. } => "ErrRenameRollback",
            Self::CapacityHigh { .. } => "ErrCapacityHigh",
            Self::CapacityOos { .. } => "ErrCapacityOOS",
            Self::TxnNotFound(_) => "ErrTxnNotFound",
            Self::TxnBmdTimeout { .. } => "ErrTxnBmdTimeout",
            Self::TxnValidation(_) => "ErrTxnValidation",
            Self::BucketNotFound(_) => "ErrBucketNotFound",
            Self::BucketAlreadyExists(_) => "ErrBucketAlreadyExists",
            Self::Timeout => "ErrTimeout",
            Self::Io(_) => "ErrIO",
        }
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BucketNotFound(_) | Self::MpathNotFound(_) | Self::TxnNotFound(_)
        )
    }

    /// Check if an I/O failure indicates the underlying disk went unhealthy
    /// (as opposed to an expected condition such as a missing directory).
    /// Such errors additionally disable the affected mountpath, best effort.
    #[must_use]
    pub fn is_disk_fault(&self) -> bool {
        let io = match self {
            Self::Io(e) => e,
            Self::NotAccessible { source, .. } => source,
            _ => return false,
        };
        matches!(
            io.raw_os_error(),
            Some(libc::EIO) | Some(libc::EROFS) | Some(libc::ENODEV) | Some(libc::ENXIO)
        )
    }

    /// Get HTTP status code for the transaction RPC surface
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidPath { .. }
            | Self::DuplicatePath(_)
            | Self::TxnValidation(_)
            | Self::BucketDirNotEmpty { .. } => 400,

            Self::MpathNotFound(_)
            | Self::TxnNotFound(_)
            | Self::BucketNotFound(_)
            | Self::NoMountpaths => 404,

            Self::FsidConflict { .. }
            | Self::MpathIdMismatch { .. }
            | Self::VmdIdMismatch { .. }
            | Self::BucketAlreadyExists(_) => 409,

            Self::CapacityHigh { .. } | Self::CapacityOos { .. } => 507,

            Self::TxnBmdTimeout { .. } | Self::Timeout => 504,

            Self::NotAccessible { .. }
            | Self::NoDisks { .. }
            | Self::VmdCorrupt { .. }
            | Self::VmdQuorum { .. }
            | Self::RenameRollback { .. }
            | Self::Io(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_stable() {
        assert_eq!(Error::NoMountpaths.kind(), "ErrNoMountpaths");
        assert_eq!(
            Error::TxnNotFound("u1".into()).kind(),
            "ErrTxnNotFound"
        );
        assert_eq!(
            Error::CapacityOos {
                pct_max: 96,
                oos_wm: 95
            }
            .kind(),
            "ErrCapacityOOS"
        );
        assert_eq!(
            Error::VmdIdMismatch {
                found: "T2".into(),
                expected: "T1".into()
            }
            .kind(),
            "ErrVmdIdMismatch"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(Error::TxnValidation("bad".into()).http_status(), 400);
        assert_eq!(Error::TxnNotFound("u".into()).http_status(), 404);
        assert_eq!(
            Error::BucketAlreadyExists("b1".into()).http_status(),
            409
        );
        assert_eq!(
            Error::TxnBmdTimeout {
                uuid: "u".into(),
                bmd_ver: 7
            }
            .http_status(),
            504
        );
    }

    #[test]
    fn test_disk_fault_classification() {
        let eio = Error::Io(std::io::Error::from_raw_os_error(5));
        assert!(eio.is_disk_fault());
        let enoent = Error::Io(std::io::Error::from_raw_os_error(2));
        assert!(!enoent.is_disk_fault());
        assert!(!Error::NoMountpaths.is_disk_fault());
    }
}
