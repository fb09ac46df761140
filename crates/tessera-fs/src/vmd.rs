//! Volume metadata (VMD)
//!
//! A VMD document pins the mountpath set to a daemon identity. It is
//! replicated to every available mountpath as `.ais.vmd` and rewritten on
//! any membership change. At boot the replicas are read back, the majority
//! content wins, and the winner is reconciled against configuration.
//!
//! On-disk format (little-endian):
//! ```text
//! magic [8] | format version u32 | payload length u32 | payload | crc32c u32
//! payload: document version u64
//!          daemon id        u16 len + bytes
//!          entry count      u32
//!          entry            u16 len + path bytes, flags u8 (bit0: enabled)
//! ```
//! Readers accept any format version >= 1 (unknown trailing payload is
//! covered by the length prefix) and reject unknown magic as corrupt.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use xxhash_rust::xxh64::xxh64;

use tessera_common::{Error, Result};

/// VMD file name at each mountpath root
pub const VMD_FILENAME: &str = ".ais.vmd";

/// Magic identifying a VMD file
pub const VMD_MAGIC: [u8; 8] = *b"TESSRVMD";

/// Current format version
pub const VMD_FORMAT_VERSION: u32 = 1;

const FLAG_ENABLED: u8 = 1;

/// Per-mountpath state recorded in the VMD
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmdMountpath {
    pub enabled: bool,
}

/// The volume metadata document
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vmd {
    /// Identity of the owning target
    pub daemon_id: String,
    /// Document version; incremented on every rewrite
    pub version: u64,
    /// Ordered so encoding is deterministic across replicas
    pub mountpaths: BTreeMap<String, VmdMountpath>,
}

impl Vmd {
    /// Fresh document for a daemon, at version 1
    #[must_use]
    pub fn new(daemon_id: &str) -> Self {
        Self {
            daemon_id: daemon_id.to_string(),
            version: 1,
            mountpaths: BTreeMap::new(),
        }
    }

    /// Record a mountpath
    pub fn add(&mut self, mpath: &str, enabled: bool) {
        self.mountpaths
            .insert(mpath.to_string(), VmdMountpath { enabled });
    }

    /// Serialize to the on-disk representation
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = BytesMut::with_capacity(64 + self.mountpaths.len() * 64);
        payload.put_u64_le(self.version);
        payload.put_u16_le(self.daemon_id.len() as u16);
        payload.put_slice(self.daemon_id.as_bytes());
        payload.put_u32_le(self.mountpaths.len() as u32);
        for (path, mp) in &self.mountpaths {
            payload.put_u16_le(path.len() as u16);
            payload.put_slice(path.as_bytes());
            payload.put_u8(if mp.enabled { FLAG_ENABLED } else { 0 });
        }

        let mut buf = BytesMut::with_capacity(16 + payload.len() + 4);
        buf.put_slice(&VMD_MAGIC);
        buf.put_u32_le(VMD_FORMAT_VERSION);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        buf.put_u32_le(crc32c::crc32c(&payload));
        buf.to_vec()
    }

    /// Parse the on-disk representation
    pub fn from_bytes(data: &[u8], origin: &str) -> Result<Self> {
        let corrupt = |reason: &str| Error::VmdCorrupt {
            path: origin.to_string(),
            reason: reason.to_string(),
        };
        if data.len() < 16 {
            return Err(corrupt("truncated header"));
        }
        let mut buf = data;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != VMD_MAGIC {
            return Err(corrupt("unknown magic"));
        }
        let format = buf.get_u32_le();
        if format < 1 {
            return Err(corrupt("bad format version"));
        }
        let payload_len = buf.get_u32_le() as usize;
        if buf.remaining() < payload_len + 4 {
            return Err(corrupt("truncated payload"));
        }
        let payload = &buf[..payload_len];
        let mut tail = &buf[payload_len..];
        let stored_crc = tail.get_u32_le();
        if crc32c::crc32c(payload) != stored_crc {
            return Err(corrupt("checksum mismatch"));
        }

        let mut p = payload;
        if p.remaining() < 8 + 2 {
            return Err(corrupt("short payload"));
        }
        let version = p.get_u64_le();
        let id_len = p.get_u16_le() as usize;
        if p.remaining() < id_len + 4 {
            return Err(corrupt("short payload"));
        }
        let daemon_id = String::from_utf8(p[..id_len].to_vec())
            .map_err(|_| corrupt("daemon id is not UTF-8"))?;
        p.advance(id_len);
        let count = p.get_u32_le() as usize;
        let mut mountpaths = BTreeMap::new();
        for _ in 0..count {
            if p.remaining() < 2 {
                return Err(corrupt("truncated entry"));
            }
            let path_len = p.get_u16_le() as usize;
            if p.remaining() < path_len + 1 {
                return Err(corrupt("truncated entry"));
            }
            let path = String::from_utf8(p[..path_len].to_vec())
                .map_err(|_| corrupt("mountpath is not UTF-8"))?;
            p.advance(path_len);
            let flags = p.get_u8();
            mountpaths.insert(
                path,
                VmdMountpath {
                    enabled: flags & FLAG_ENABLED != 0,
                },
            );
        }
        Ok(Self {
            daemon_id,
            version,
            mountpaths,
        })
    }

    /// Content hash used for majority election across replicas
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        xxh64(&self.to_bytes(), 0)
    }

    fn file_path(mpath: &str) -> PathBuf {
        Path::new(mpath).join(VMD_FILENAME)
    }

    /// Persist this document to one mountpath root (write-temp + rename)
    pub fn save(&self, mpath: &str) -> Result<()> {
        let final_path = Self::file_path(mpath);
        let tmp_path = Path::new(mpath).join(format!("{VMD_FILENAME}.tmp"));
        fs::write(&tmp_path, self.to_bytes())?;
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Load the document from one mountpath root; `Ok(None)` when absent
    pub fn load(mpath: &str) -> Result<Option<Self>> {
        let path = Self::file_path(mpath);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::from_bytes(&data, &path.display().to_string()).map(Some)
    }

    /// Load replicas from all configured mountpaths and elect the winner:
    /// majority by content, ties broken by highest document version.
    /// Corrupt replicas are logged and treated as absent; a replica owned by
    /// a different daemon is fatal. The second value reports whether any
    /// replica was unreadable or outvoted and needs a repair write.
    pub fn load_all<'a>(
        mpaths: impl Iterator<Item = &'a str>,
        daemon_id: &str,
    ) -> Result<(Option<Self>, bool)> {
        let mut groups: BTreeMap<u64, (Self, usize)> = BTreeMap::new();
        let mut loaded = 0usize;
        let mut unreadable = false;
        for mpath in mpaths {
            let vmd = match Self::load(mpath) {
                Ok(Some(v)) => v,
                Ok(None) => continue,
                Err(e) => {
                    warn!(mpath, %e, "unreadable volume metadata replica");
                    unreadable = true;
                    continue;
                }
            };
            if vmd.daemon_id != daemon_id {
                return Err(Error::VmdIdMismatch {
                    found: vmd.daemon_id,
                    expected: daemon_id.to_string(),
                });
            }
            loaded += 1;
            let key = vmd.content_hash();
            groups
                .entry(key)
                .and_modify(|(_, n)| *n += 1)
                .or_insert((vmd, 1));
        }
        let winner = groups
            .into_values()
            .max_by(|(a, na), (b, nb)| na.cmp(nb).then(a.version.cmp(&b.version)));
        let repair = match &winner {
            Some((vmd, replicas)) => {
                info!(version = vmd.version, replicas, "loaded volume metadata");
                unreadable || *replicas < loaded
            }
            None => false,
        };
        Ok((winner.map(|(vmd, _)| vmd), repair))
    }

    /// Persist to every given mountpath root; returns how many writes
    /// succeeded (the caller enforces its quorum rule).
    pub fn persist<'a>(&self, mpaths: impl Iterator<Item = &'a str>) -> usize {
        let mut written = 0;
        for mpath in mpaths {
            match self.save(mpath) {
                Ok(()) => written += 1,
                Err(e) => warn!(mpath, %e, "failed to write volume metadata"),
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Vmd {
        let mut vmd = Vmd::new("T1");
        vmd.add("/data/m1", true);
        vmd.add("/data/m2", false);
        vmd
    }

    #[test]
    fn test_roundtrip() {
        let vmd = sample();
        let bytes = vmd.to_bytes();
        let back = Vmd::from_bytes(&bytes, "test").unwrap();
        assert_eq!(vmd, back);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] ^= 0xff;
        let err = Vmd::from_bytes(&bytes, "test").unwrap_err();
        assert_eq!(err.kind(), "ErrVmdCorrupt");
    }

    #[test]
    fn test_rejects_bad_checksum() {
        let mut bytes = sample().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = Vmd::from_bytes(&bytes, "test").unwrap_err();
        assert_eq!(err.kind(), "ErrVmdCorrupt");
    }

    #[test]
    fn test_rejects_truncation() {
        let bytes = sample().to_bytes();
        for cut in [0, 8, 15, bytes.len() - 3] {
            assert!(Vmd::from_bytes(&bytes[..cut], "test").is_err());
        }
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        assert_eq!(Vmd::load(root).unwrap(), None);

        let vmd = sample();
        vmd.save(root).unwrap();
        let back = Vmd::load(root).unwrap().unwrap();
        assert_eq!(vmd, back);
    }

    #[test]
    fn test_load_all_majority_wins() {
        let dirs: Vec<_> = (0..3).map(|_| tempdir().unwrap()).collect();
        let roots: Vec<String> = dirs
            .iter()
            .map(|d| d.path().to_str().unwrap().to_string())
            .collect();

        let mut majority = Vmd::new("T1");
        majority.add("/data/m1", true);
        let mut minority = majority.clone();
        minority.version = 9; // newer but outvoted
        minority.add("/data/m2", true);

        majority.save(&roots[0]).unwrap();
        majority.save(&roots[1]).unwrap();
        minority.save(&roots[2]).unwrap();

        let (winner, repair) = Vmd::load_all(roots.iter().map(String::as_str), "T1").unwrap();
        assert_eq!(winner.unwrap(), majority);
        assert!(repair, "outvoted replica requires a repair write");
    }

    #[test]
    fn test_load_all_tie_breaks_on_version() {
        let dirs: Vec<_> = (0..2).map(|_| tempdir().unwrap()).collect();
        let roots: Vec<String> = dirs
            .iter()
            .map(|d| d.path().to_str().unwrap().to_string())
            .collect();

        let mut old = Vmd::new("T1");
        old.add("/data/m1", true);
        let mut new = old.clone();
        new.version = 2;
        new.add("/data/m2", true);

        old.save(&roots[0]).unwrap();
        new.save(&roots[1]).unwrap();

        let (winner, _) = Vmd::load_all(roots.iter().map(String::as_str), "T1").unwrap();
        assert_eq!(winner.unwrap().version, 2);
    }

    #[test]
    fn test_load_all_foreign_daemon_is_fatal() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        sample().save(root).unwrap();

        let err = Vmd::load_all(std::iter::once(root), "T2").unwrap_err();
        assert_eq!(err.kind(), "ErrVmdIdMismatch");
    }

    #[test]
    fn test_persist_counts_successes() {
        let dir = tempdir().unwrap();
        let good = dir.path().to_str().unwrap();
        let vmd = sample();
        let written = vmd.persist(vec![good, "/no/such/root"].into_iter());
        assert_eq!(written, 1);
    }
}
