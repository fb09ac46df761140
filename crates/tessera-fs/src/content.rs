//! Closed registry of on-disk content types
//!
//! Every file under a bucket directory lives beneath a `%<tag>` subdirectory
//! where the tag is one of the fixed 2-character types below. The set is
//! closed: callers select a variant, they cannot invent tags.

use std::fmt;

/// Length of every content-type tag
pub const TAG_LEN: usize = 2;

/// On-disk content classification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// User objects
    Object,
    /// Transient workfiles (partial PUTs, downloads in progress)
    Workfile,
    /// Erasure-coded slices and replicas
    EcSlice,
}

impl ContentType {
    /// All registered content types, in bucket-dir creation order
    pub const ALL: [Self; 3] = [Self::Object, Self::Workfile, Self::EcSlice];

    /// The fixed 2-character tag used in paths
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Object => "ob",
            Self::Workfile => "wk",
            Self::EcSlice => "ec",
        }
    }

    /// Look a tag up in the registry
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ct| ct.tag() == tag)
    }

    /// Transient content may legally survive a crash; a non-empty transient
    /// directory does not block bucket creation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Workfile)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_fixed_width() {
        for ct in ContentType::ALL {
            assert_eq!(ct.tag().len(), TAG_LEN);
        }
    }

    #[test]
    fn test_registry_closed() {
        assert_eq!(ContentType::from_tag("ob"), Some(ContentType::Object));
        assert_eq!(ContentType::from_tag("wk"), Some(ContentType::Workfile));
        assert_eq!(ContentType::from_tag("ec"), Some(ContentType::EcSlice));
        assert_eq!(ContentType::from_tag("zz"), None);
        assert_eq!(ContentType::from_tag(""), None);
    }

    #[test]
    fn test_transient() {
        assert!(ContentType::Workfile.is_transient());
        assert!(!ContentType::Object.is_transient());
    }
}
