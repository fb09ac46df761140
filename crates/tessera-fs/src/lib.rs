//! Target-local volume management
//!
//! This crate implements the storage side of a Tessera target:
//! - Mountpath registry with torn-free (available, disabled) snapshots
//! - Volume metadata (VMD) persistence and boot-time reconciliation
//! - Deterministic bucket/object path composition with a per-bucket-id cache
//! - Capacity accounting with watermark-driven refresh cadence
//! - Bucket directory lifecycle: create, trash, rename-with-rollback
//! - Per-mountpath io-stat tracking and the filesystem probe

pub mod capacity;
pub mod content;
pub mod iostat;
pub mod markers;
pub mod mountpath;
pub mod probe;
pub mod registry;
pub mod vmd;
pub mod xattr;

// Re-exports
pub use capacity::{CapStatus, Capacity};
pub use content::ContentType;
pub use iostat::IostatTracker;
pub use markers::Marker;
pub use mountpath::Mountpath;
pub use probe::FsInfo;
pub use registry::{Mpi, MpathCapMap, Volume};
pub use vmd::Vmd;
