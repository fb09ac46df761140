//! Shared foundation for the Tessera target: the common error type, logical
//! bucket identifiers, and target configuration.

pub mod config;
pub mod error;
pub mod fsutil;
pub mod types;

// Re-exports
pub use config::{Config, DiskConfig, MdWritePolicy, PeriodConfig, SpaceConfig, TxnConfig};
pub use error::{Error, Result};
pub use types::{Bck, BucketId, BucketProps, EcProps, MirrorProps, Namespace, Provider};
