//! Core type definitions for the Tessera target
//!
//! Logical bucket identity (`Bck`), the cluster-assigned bucket id, and the
//! bucket property payloads carried by the replicated bucket metadata.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend provider of a bucket
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Native buckets owned by this cluster
    #[default]
    Ais,
    /// Amazon S3 backend
    Aws,
    /// Google Cloud Storage backend
    Gcp,
    /// Azure Blob Storage backend
    Azure,
}

impl Provider {
    /// Short tag used in on-disk paths and wire messages
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ais => "ais",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket namespace: global, local named, or remote-cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Remote cluster UUID; empty for this cluster
    #[serde(default)]
    pub uuid: String,
    /// Namespace name; empty for the global namespace
    #[serde(default)]
    pub name: String,
}

impl Namespace {
    /// The global (default) namespace
    pub const GLOBAL: Self = Self {
        uuid: String::new(),
        name: String::new(),
    };

    /// Check whether this is the global namespace
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.uuid.is_empty() && self.name.is_empty()
    }

    /// Check whether this namespace lives in a remote cluster
    #[must_use]
    pub fn is_remote(&self) -> bool {
        !self.uuid.is_empty()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            return Ok(());
        }
        if self.is_remote() {
            write!(f, "@{}", self.uuid)?;
        }
        write!(f, "#{}", self.name)
    }
}

/// Cluster-assigned 64-bit bucket id; zero means "not yet assigned"
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0:x}")]
pub struct BucketId(u64);

impl BucketId {
    /// The unassigned id
    pub const NONE: Self = Self(0);

    /// Check whether the id has been assigned by the cluster
    #[must_use]
    pub const fn is_assigned(&self) -> bool {
        self.0 != 0
    }

    /// Raw value
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// Logical bucket identity: name, provider, namespace
///
/// Distinct from [`BucketId`], which the cluster assigns on creation and may
/// reassign across a destroy/create cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bck {
    pub name: String,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub ns: Namespace,
}

impl Bck {
    /// Create a bucket identity in the global namespace
    pub fn new(name: impl Into<String>, provider: Provider) -> Self {
        Self {
            name: name.into(),
            provider,
            ns: Namespace::GLOBAL,
        }
    }

    /// An identity with an empty name is a query: it matches "all buckets"
    /// in listing contexts and never resolves to an on-disk directory.
    #[must_use]
    pub fn is_query(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Display for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ns.is_global() {
            write!(f, "{}/{}", self.provider, self.name)
        } else {
            write!(f, "{}/{}/{}", self.provider, self.ns, self.name)
        }
    }
}

/// Mirroring (n-way replication) properties of a bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorProps {
    pub enabled: bool,
    /// Number of copies, including the primary replica
    pub copies: u32,
}

impl Default for MirrorProps {
    fn default() -> Self {
        Self {
            enabled: false,
            copies: 1,
        }
    }
}

/// Erasure-coding properties of a bucket
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcProps {
    pub enabled: bool,
    pub data_slices: u8,
    pub parity_slices: u8,
}

/// Bucket properties as replicated in the bucket metadata
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProps {
    /// Cluster-assigned bucket id
    #[serde(default)]
    pub bid: BucketId,
    #[serde(default)]
    pub mirror: MirrorProps,
    #[serde(default)]
    pub ec: EcProps,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_kinds() {
        assert!(Namespace::GLOBAL.is_global());
        let local = Namespace {
            uuid: String::new(),
            name: "team-a".into(),
        };
        assert!(!local.is_global());
        assert!(!local.is_remote());
        let remote = Namespace {
            uuid: "Cu9X".into(),
            name: "team-a".into(),
        };
        assert!(remote.is_remote());
        assert_eq!(remote.to_string(), "@Cu9X#team-a");
    }

    #[test]
    fn test_bck_display() {
        let bck = Bck::new("imagenet", Provider::Ais);
        assert_eq!(bck.to_string(), "ais/imagenet");
        assert!(!bck.is_query());
    }

    #[test]
    fn test_bucket_id() {
        assert!(!BucketId::NONE.is_assigned());
        assert!(BucketId::from(42u64).is_assigned());
        assert_eq!(BucketId::from(0xffu64).to_string(), "ff");
    }

    #[test]
    fn test_bck_serde_roundtrip() {
        let bck = Bck {
            name: "b1".into(),
            provider: Provider::Aws,
            ns: Namespace {
                uuid: String::new(),
                name: "ns1".into(),
            },
        };
        let s = serde_json::to_string(&bck).unwrap();
        let back: Bck = serde_json::from_str(&s).unwrap();
        assert_eq!(bck, back);
    }
}
