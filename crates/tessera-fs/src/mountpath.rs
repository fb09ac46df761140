//! Mountpath: one local directory serviced by one filesystem
//!
//! Terminology: a mountpath is a directory of the form
//! `<filesystem-mountpoint>/a/b/c` owned by exactly one target. Different
//! mountpaths map onto different filesystems and vice versa.
//!
//! A `Mountpath` owns the per-bucket-id path cache (`bpc`), the sharded
//! object-metadata caches, and the last-sampled capacity; registry-level
//! bookkeeping (fsid uniqueness, snapshots) lives in [`crate::registry`].

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, MAIN_SEPARATOR};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};
use xxhash_rust::xxh64::xxh64;

use tessera_common::config::{Config, MdWritePolicy};
use tessera_common::{fsutil, Bck, BucketId, Error, Result};

use crate::capacity::Capacity;
use crate::content::ContentType;
use crate::iostat::IostatTracker;
use crate::probe::{self, FsInfo};
use crate::xattr::{self, DAEMON_ID_XATTR};

/// Trash directory name at a mountpath root
pub const TRASH_DIR: &str = "$trash";

// Path-grammar prefixes: @provider, @ns-uuid, #ns-name, %content-type.
const PREF_PROVIDER: char = '@';
const PREF_NS_UUID: char = '@';
const PREF_NS_NAME: char = '#';
const PREF_CT: char = '%';

// Bounded retry for the nanosecond-suffixed trash rename.
const TRASH_RENAME_RETRIES: usize = 3;

type LomCache = Mutex<HashMap<String, Arc<Vec<u8>>>>;

fn is_xattr_unsupported(e: &Error) -> bool {
    matches!(e, Error::Io(io) if io.raw_os_error() == Some(libc::ENOTSUP))
}

/// One mountpath and its caches
pub struct Mountpath {
    /// Canonical absolute path (symlinks resolved)
    pub path: String,
    /// Identity of the servicing filesystem
    pub fs: FsInfo,
    /// xxh64 of the canonical path; used for rendezvous (HRW) hashing
    pub path_digest: u64,
    /// Owned physical disks; empty only in testing mode
    pub disks: Vec<String>,

    // bucket path cache: bucket-id => bucket directory
    bpc: RwLock<HashMap<u64, String>>,
    // per-content-type object-metadata caches (opaque payloads here;
    // the object I/O path populates them)
    lom_caches: [LomCache; ContentType::ALL.len()],
    // last sampled capacity
    capacity: RwLock<Capacity>,
}

impl Mountpath {
    /// Validate, canonicalize, and probe a configured mountpath
    pub fn new(mpath: &str) -> Result<Self> {
        let clean = fsutil::validate_mpath(mpath)?;
        let real = fs::canonicalize(&clean).map_err(|source| Error::NotAccessible {
            path: clean.clone(),
            source,
        })?;
        let path = real
            .into_os_string()
            .into_string()
            .map_err(|_| Error::invalid_path(mpath, "not valid UTF-8"))?;
        let fs_info = probe::probe_fs(&path)?;
        let disks = probe::disks_of(&fs_info.fs);
        Ok(Self {
            path_digest: xxh64(path.as_bytes(), 0),
            path,
            fs: fs_info,
            disks,
            bpc: RwLock::new(HashMap::new()),
            lom_caches: Default::default(),
            capacity: RwLock::new(Capacity::default()),
        })
    }

    // daemon-id binding

    /// Read the daemon id bound to this mountpath root, if any
    pub fn load_daemon_id(&self) -> Result<Option<String>> {
        let raw = xattr::get_xattr(&self.path, DAEMON_ID_XATTR)?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let id = String::from_utf8(bytes).map_err(|_| Error::VmdCorrupt {
                    path: self.path.clone(),
                    reason: "daemon-id xattr is not UTF-8".to_string(),
                })?;
                Ok(Some(id))
            }
        }
    }

    /// Bind this mountpath to a daemon id; fails when already bound to a
    /// different target. Filesystems without extended-attribute support are
    /// tolerated with a warning (the VMD still pins the identity).
    pub fn set_daemon_id(&self, tid: &str, policy: MdWritePolicy) -> Result<()> {
        debug_assert!(!tid.is_empty());
        if policy == MdWritePolicy::Never {
            return Ok(());
        }
        let found = match self.load_daemon_id() {
            Ok(v) => v,
            Err(e) if is_xattr_unsupported(&e) => {
                warn!(mpath = %self.path, "filesystem does not support extended attributes");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match found {
            Some(found) if found == tid => Ok(()),
            Some(found) => Err(Error::MpathIdMismatch {
                mpath: self.path.clone(),
                found,
                expected: tid.to_string(),
            }),
            None => match xattr::set_xattr(&self.path, DAEMON_ID_XATTR, tid.as_bytes()) {
                Ok(()) => Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => {
                    warn!(mpath = %self.path, "filesystem does not support extended attributes");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Unbind the daemon id (mountpath removal, decommission)
    pub fn clear_daemon_id(&self) -> Result<()> {
        match xattr::remove_xattr(&self.path, DAEMON_ID_XATTR) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // path composition
    //
    // <path>/@<provider>[/[@<ns-uuid>]#<ns-name>]/<bucket>/%<ct>[/<object>]

    fn bucket_path(&self, bck: &Bck) -> String {
        let mut s = String::with_capacity(
            self.path.len() + bck.name.len() + bck.ns.uuid.len() + bck.ns.name.len() + 16,
        );
        s.push_str(&self.path);
        s.push(MAIN_SEPARATOR);
        s.push(PREF_PROVIDER);
        s.push_str(bck.provider.as_str());
        if !bck.ns.is_global() {
            s.push(MAIN_SEPARATOR);
            if bck.ns.is_remote() {
                s.push(PREF_NS_UUID);
                s.push_str(&bck.ns.uuid);
            }
            s.push(PREF_NS_NAME);
            s.push_str(&bck.ns.name);
        }
        if !bck.name.is_empty() {
            s.push(MAIN_SEPARATOR);
            s.push_str(&bck.name);
        }
        s
    }

    /// Bucket directory on this mountpath; memoized by bucket id when the
    /// id has been assigned.
    pub fn make_path_bck(&self, bck: &Bck, bid: BucketId) -> String {
        if !bid.is_assigned() {
            return self.bucket_path(bck);
        }
        if let Some(dir) = self.bpc.read().get(&bid.get()) {
            return dir.clone();
        }
        let dir = self.bucket_path(bck);
        self.bpc.write().insert(bid.get(), dir.clone());
        dir
    }

    /// Content-type directory under the bucket directory
    pub fn make_path_ct(&self, bck: &Bck, bid: BucketId, ct: ContentType) -> String {
        debug_assert!(!bck.is_query());
        let mut s = self.make_path_bck(bck, bid);
        s.push(MAIN_SEPARATOR);
        s.push(PREF_CT);
        s.push_str(ct.tag());
        s
    }

    /// Fully qualified object path
    pub fn make_path_fqn(&self, bck: &Bck, bid: BucketId, ct: ContentType, obj: &str) -> String {
        debug_assert!(!obj.is_empty());
        let mut s = self.make_path_ct(bck, bid, ct);
        s.push(MAIN_SEPARATOR);
        s.push_str(obj);
        s
    }

    /// Bucket directory for rename/destroy: evicts the bucket-id cache
    /// entry so a reassigned id never resolves to the stale directory.
    pub fn make_del_path_bck(&self, bck: &Bck, bid: BucketId) -> String {
        if bid.is_assigned() {
            if let Some(dir) = self.bpc.write().remove(&bid.get()) {
                return dir;
            }
        }
        self.bucket_path(bck)
    }

    // lom caches

    /// Object-metadata cache for one content type
    #[must_use]
    pub fn lom_cache(&self, ct: ContentType) -> &LomCache {
        let idx = ContentType::ALL.iter().position(|c| *c == ct).unwrap_or(0);
        &self.lom_caches[idx]
    }

    /// Drop all cached object metadata (mountpath leaving the Available set)
    pub fn evict_lom_caches(&self) {
        for cache in &self.lom_caches {
            cache.lock().clear();
        }
    }

    // trash

    /// `$trash` directory of this mountpath
    #[must_use]
    pub fn make_path_trash(&self) -> String {
        format!("{}{}{}", self.path, MAIN_SEPARATOR, TRASH_DIR)
    }

    /// Move a directory into `$trash` under a fresh nanosecond-suffixed
    /// name. A nonexistent source is a no-op; a name collision is retried
    /// a bounded number of times.
    pub fn move_to_trash(&self, dir: &str) -> Result<()> {
        match fsutil::access(dir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }
        let trash = self.make_path_trash();
        let mut last_err: Option<std::io::Error> = None;
        for _ in 0..TRASH_RENAME_RETRIES {
            fsutil::create_dir(&trash)?;
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let tmp = format!("{trash}{MAIN_SEPARATOR}$dir-{nanos}");
            match fs::rename(dir, &tmp) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e)
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::EEXIST) | Some(libc::ENOTEMPTY)
                    ) =>
                {
                    warn!(dir = %tmp, "trash directory name collision, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AlreadyExists))
            .into())
    }

    /// Remove every trashed subdirectory; best effort
    pub fn sweep_trash(&self) {
        let trash = self.make_path_trash();
        let entries = match fs::read_dir(&trash) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!(dir = %entry.path().display(), %e, "failed to remove trashed directory");
            }
        }
    }

    // bucket directories

    /// Create the per-content-type directories of a bucket on this
    /// mountpath. A pre-existing non-empty directory fails the operation
    /// unless the target booted without a local BMD (`nil_bmd`), in which
    /// case it is assumed to be rejoining after a decommission.
    pub fn create_bck_dirs(&self, bck: &Bck, bid: BucketId, nil_bmd: bool) -> Result<usize> {
        let mut num = 0;
        for ct in ContentType::ALL {
            let dir = self.make_path_ct(bck, bid, ct);
            if fsutil::access(&dir).is_ok() {
                if nil_bmd {
                    error!(
                        bucket = %bck, dir = %dir,
                        "directory exists without local bucket metadata, keeping it"
                    );
                    num += 1;
                    continue;
                }
                let (names, empty) = fsutil::is_dir_empty(&dir)?;
                if !empty {
                    let err = Error::BucketDirNotEmpty { dir, names };
                    if !ct.is_transient() {
                        return Err(err);
                    }
                    error!(bucket = %bck, %err, "stale workfiles in new bucket");
                }
            } else {
                fsutil::create_dir(&dir)?;
            }
            num += 1;
        }
        Ok(num)
    }

    /// Ensure the per-content-type directories exist (resilver, rejoin)
    pub fn create_missing_bck_dirs(&self, bck: &Bck, bid: BucketId) -> Result<()> {
        for ct in ContentType::ALL {
            let dir = self.make_path_ct(bck, bid, ct);
            if fsutil::access(&dir).is_err() {
                fsutil::create_dir(&dir)?;
            }
        }
        Ok(())
    }

    // capacity

    /// Sampled capacity. `refresh` performs a statvfs and caches the
    /// result; otherwise the cached value is returned.
    pub fn get_capacity(&self, config: &Config, refresh: bool) -> Result<Capacity> {
        if !refresh {
            return Ok(*self.capacity.read());
        }
        let (stat, _) = probe::statvfs(&self.path).map_err(Error::Io)?;
        let bused = stat.blocks.saturating_sub(stat.bavail);
        let mut pct = if stat.blocks == 0 {
            0
        } else {
            bused * 100 / stat.blocks
        };
        // near the high watermark, round up instead of down
        if pct as i64 >= config.space.high_wm - 1 && stat.blocks > 0 {
            pct = ((bused as f64) * 100.0 / (stat.blocks as f64)).ceil() as u64;
        }
        let c = Capacity {
            used: bused * stat.bsize,
            avail: stat.bavail * stat.bsize,
            pct_used: pct as i32,
        };
        *self.capacity.write() = c;
        Ok(c)
    }

    /// Whether this mountpath is idle according to the io-stat tracker
    #[must_use]
    pub fn is_idle(&self, config: &Config, iostat: &IostatTracker) -> bool {
        let util = iostat.util(&self.path);
        util >= 0 && util < config.disk.disk_util_low_wm
    }

    // metadata cleanup

    /// Remove a path relative to the mountpath root; absence tolerated
    pub fn remove_rel(&self, rel: &str) -> Result<()> {
        let fpath = Path::new(&self.path).join(rel);
        match fs::remove_dir_all(&fpath) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            // a plain file (e.g. a marker left at the root)
            Err(_) => match fs::remove_file(&fpath) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Remove per-mountpath metadata: VMD replica and markers
    pub fn clear_mds(&self) {
        for rel in [crate::vmd::VMD_FILENAME, crate::markers::MARKERS_DIR] {
            if let Err(e) = self.remove_rel(rel) {
                warn!(mpath = %self.path, rel, %e, "failed to remove metadata");
            }
        }
    }
}

impl fmt::Display for Mountpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.disks.len() {
            0 => write!(f, "mp[{}, fs={}]", self.path, self.fs.fs),
            1 => write!(f, "mp[{}, {}]", self.path, self.disks[0]),
            _ => write!(f, "mp[{}, {:?}]", self.path, self.disks),
        }
    }
}

impl fmt::Debug for Mountpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::types::{Namespace, Provider};
    use tempfile::tempdir;

    fn mk(dir: &tempfile::TempDir) -> Mountpath {
        Mountpath::new(dir.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_new_canonicalizes() {
        let dir = tempdir().unwrap();
        let raw = format!("{}//.", dir.path().display());
        let mi = Mountpath::new(&raw).unwrap();
        assert!(!mi.path.ends_with('/'));
        assert!(mi.path_digest != 0);
    }

    #[test]
    fn test_new_missing_dir() {
        let err = Mountpath::new("/no/such/mountpath").unwrap_err();
        assert_eq!(err.kind(), "ErrNotAccessible");
    }

    #[test]
    fn test_path_composition_global_ns() {
        let dir = tempdir().unwrap();
        let mi = mk(&dir);
        let bck = Bck::new("b1", Provider::Ais);

        let bdir = mi.make_path_bck(&bck, BucketId::NONE);
        assert_eq!(bdir, format!("{}/@ais/b1", mi.path));

        let ct = mi.make_path_ct(&bck, BucketId::NONE, ContentType::Object);
        assert_eq!(ct, format!("{}/@ais/b1/%ob", mi.path));

        let fqn = mi.make_path_fqn(&bck, BucketId::NONE, ContentType::Object, "shard/0001.tar");
        assert_eq!(fqn, format!("{}/@ais/b1/%ob/shard/0001.tar", mi.path));
    }

    #[test]
    fn test_path_composition_namespaces() {
        let dir = tempdir().unwrap();
        let mi = mk(&dir);

        let local = Bck {
            name: "b1".into(),
            provider: Provider::Ais,
            ns: Namespace {
                uuid: String::new(),
                name: "team".into(),
            },
        };
        assert_eq!(
            mi.make_path_bck(&local, BucketId::NONE),
            format!("{}/@ais/#team/b1", mi.path)
        );

        let remote = Bck {
            name: "b1".into(),
            provider: Provider::Ais,
            ns: Namespace {
                uuid: "Cu9X".into(),
                name: "team".into(),
            },
        };
        assert_eq!(
            mi.make_path_bck(&remote, BucketId::NONE),
            format!("{}/@ais/@Cu9X#team/b1", mi.path)
        );
    }

    #[test]
    fn test_path_composition_injective() {
        let dir = tempdir().unwrap();
        let mi = mk(&dir);
        let mut seen = std::collections::HashSet::new();
        for name in ["b1", "b2"] {
            for ct in ContentType::ALL {
                for obj in ["o1", "o2", "d/o1"] {
                    let bck = Bck::new(name, Provider::Ais);
                    let fqn = mi.make_path_fqn(&bck, BucketId::NONE, ct, obj);
                    assert!(seen.insert(fqn), "collision for {name}/{ct}/{obj}");
                }
            }
        }
    }

    #[test]
    fn test_bpc_cache_and_invalidation() {
        let dir = tempdir().unwrap();
        let mi = mk(&dir);
        let bck = Bck::new("b1", Provider::Ais);
        let bid = BucketId::from(42u64);

        let p1 = mi.make_path_bck(&bck, bid);
        // cached: a different name under the same bid returns the cached dir
        let renamed = Bck::new("other", Provider::Ais);
        assert_eq!(mi.make_path_bck(&renamed, bid), p1);

        // eviction: the next composition is fresh
        let deleted = mi.make_del_path_bck(&bck, bid);
        assert_eq!(deleted, p1);
        assert_eq!(
            mi.make_path_bck(&renamed, bid),
            format!("{}/@ais/other", mi.path)
        );
    }

    #[test]
    fn test_create_bck_dirs() {
        let dir = tempdir().unwrap();
        let mi = mk(&dir);
        let bck = Bck::new("b1", Provider::Ais);

        let num = mi.create_bck_dirs(&bck, BucketId::NONE, false).unwrap();
        assert_eq!(num, ContentType::ALL.len());
        for ct in ContentType::ALL {
            let d = mi.make_path_ct(&bck, BucketId::NONE, ct);
            assert!(std::path::Path::new(&d).is_dir());
        }
        // idempotent while empty
        mi.create_bck_dirs(&bck, BucketId::NONE, false).unwrap();
    }

    #[test]
    fn test_create_bck_dirs_nonempty() {
        let dir = tempdir().unwrap();
        let mi = mk(&dir);
        let bck = Bck::new("b1", Provider::Ais);
        mi.create_bck_dirs(&bck, BucketId::NONE, false).unwrap();

        let obj_dir = mi.make_path_ct(&bck, BucketId::NONE, ContentType::Object);
        fs::write(format!("{obj_dir}/leftover"), b"x").unwrap();

        let err = mi
            .create_bck_dirs(&bck, BucketId::NONE, false)
            .unwrap_err();
        assert_eq!(err.kind(), "ErrBucketDirNotEmpty");

        // nil_bmd boot keeps the directory and continues
        let num = mi.create_bck_dirs(&bck, BucketId::NONE, true).unwrap();
        assert_eq!(num, ContentType::ALL.len());
    }

    #[test]
    fn test_move_to_trash() {
        let dir = tempdir().unwrap();
        let mi = mk(&dir);
        let victim = dir.path().join("doomed");
        fs::create_dir(&victim).unwrap();
        fs::write(victim.join("f"), b"x").unwrap();

        mi.move_to_trash(victim.to_str().unwrap()).unwrap();
        assert!(!victim.exists());
        let trashed: Vec<_> = fs::read_dir(mi.make_path_trash()).unwrap().collect();
        assert_eq!(trashed.len(), 1);

        // nonexistent source is a no-op
        mi.move_to_trash(victim.to_str().unwrap()).unwrap();

        mi.sweep_trash();
        let left: Vec<_> = fs::read_dir(mi.make_path_trash()).unwrap().collect();
        assert!(left.is_empty());
    }

    #[test]
    fn test_get_capacity_refresh_and_cache() {
        let dir = tempdir().unwrap();
        let mi = mk(&dir);
        let config = Config::testing();

        let cached = mi.get_capacity(&config, false).unwrap();
        assert_eq!(cached, Capacity::default());

        let fresh = mi.get_capacity(&config, true).unwrap();
        assert!(fresh.used + fresh.avail > 0);
        assert!((0..=100).contains(&fresh.pct_used));

        assert_eq!(mi.get_capacity(&config, false).unwrap(), fresh);
    }

    #[test]
    fn test_lom_cache_eviction() {
        let dir = tempdir().unwrap();
        let mi = mk(&dir);
        mi.lom_cache(ContentType::Object)
            .lock()
            .insert("o1".into(), Arc::new(vec![1, 2]));
        assert_eq!(mi.lom_cache(ContentType::Object).lock().len(), 1);
        mi.evict_lom_caches();
        assert!(mi.lom_cache(ContentType::Object).lock().is_empty());
    }
}
