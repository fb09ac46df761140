//! Mountpath registry
//!
//! The volume holds all mountpaths of a target in two sets, Available and
//! Disabled. Mutations serialize on one lock, clone both sets, modify the
//! clones, and swap a single snapshot handle, so readers always observe a
//! consistent (available, disabled) pair without blocking.
//!
//! Membership changes rewrite the volume metadata replicas; boot
//! reconciles the persisted document against configuration.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use tessera_common::config::{Config, MdWritePolicy};
use tessera_common::{fsutil, Bck, BucketId, Error, Result};

use crate::capacity::{next_refresh, CapStatus, Capacity};
use crate::iostat::IostatTracker;
use crate::markers;
use crate::mountpath::Mountpath;
use crate::vmd::Vmd;

/// Immutable mapping `path -> mountpath`; ordered, so "registry iteration
/// order" is deterministic across runs.
pub type Mpi = BTreeMap<String, Arc<Mountpath>>;

/// Per-mountpath capacities keyed by path
pub type MpathCapMap = HashMap<String, Capacity>;

#[derive(Clone, Default)]
struct Snapshot {
    available: Arc<Mpi>,
    disabled: Arc<Mpi>,
}

// Mutation-side bookkeeping, guarded by `Volume::mu`.
struct Registry {
    // fsid => owning mountpath; entries exist iff the mountpath is in one
    // of the two sets
    fsids: HashMap<u64, String>,
    // one mountpath per filesystem unless explicitly disabled (tests)
    fsid_check: bool,
    // last persisted VMD document version
    vmd_version: u64,
}

#[derive(Default)]
struct CapState {
    status: CapStatus,
    next_at: Option<Instant>,
}

/// The mountpath registry of one target
pub struct Volume {
    daemon_id: String,
    mu: Mutex<Registry>,
    snap: RwLock<Snapshot>,
    ios: IostatTracker,
    cap: RwLock<CapState>,
}

impl Volume {
    /// Create an empty registry for a target
    #[must_use]
    pub fn new(daemon_id: &str) -> Self {
        Self {
            daemon_id: daemon_id.to_string(),
            mu: Mutex::new(Registry {
                fsids: HashMap::new(),
                fsid_check: true,
                vmd_version: 0,
            }),
            snap: RwLock::new(Snapshot::default()),
            ios: IostatTracker::new(),
            cap: RwLock::new(CapState::default()),
        }
    }

    #[must_use]
    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    #[must_use]
    pub fn iostat(&self) -> &IostatTracker {
        &self.ios
    }

    /// Allow several mountpaths to share one filesystem (tests only)
    pub fn disable_fsid_check(&self) {
        self.mu.lock().fsid_check = false;
    }

    /// Current (available, disabled) snapshot; the pair is from a single
    /// mutation epoch.
    #[must_use]
    pub fn get(&self) -> (Arc<Mpi>, Arc<Mpi>) {
        let snap = self.snap.read();
        (Arc::clone(&snap.available), Arc::clone(&snap.disabled))
    }

    /// Number of available mountpaths
    #[must_use]
    pub fn num_available(&self) -> usize {
        self.snap.read().available.len()
    }

    // internals (all called under `self.mu`)

    fn clone_mpi(&self) -> (Mpi, Mpi) {
        let snap = self.snap.read();
        ((*snap.available).clone(), (*snap.disabled).clone())
    }

    fn swap(&self, available: Mpi, disabled: Mpi) {
        debug_assert!(available.keys().all(|k| !disabled.contains_key(k)));
        *self.snap.write() = Snapshot {
            available: Arc::new(available),
            disabled: Arc::new(disabled),
        };
    }

    fn check_can_add(
        &self,
        reg: &Registry,
        mi: &Mountpath,
        available: &Mpi,
        disabled: &Mpi,
    ) -> Result<()> {
        if available.contains_key(&mi.path) || disabled.contains_key(&mi.path) {
            return Err(Error::DuplicatePath(mi.path.clone()));
        }
        if reg.fsid_check {
            if let Some(existing) = reg.fsids.get(&mi.fs.fsid) {
                return Err(Error::FsidConflict {
                    fsid: mi.fs.fsid,
                    mpath: mi.path.clone(),
                    existing: existing.clone(),
                });
            }
        }
        Ok(())
    }

    fn add_enabled(
        &self,
        reg: &mut Registry,
        mi: &Arc<Mountpath>,
        available: &mut Mpi,
        config: &Config,
    ) -> Result<()> {
        self.ios.add_mpath(&mi.path, &mi.disks);
        if let Err(e) = mi.set_daemon_id(&self.daemon_id, config.md_write) {
            self.ios.remove_mpath(&mi.path);
            return Err(e);
        }
        available.insert(mi.path.clone(), Arc::clone(mi));
        reg.fsids.insert(mi.fs.fsid, mi.path.clone());
        Ok(())
    }

    fn persist_vmd(
        &self,
        reg: &mut Registry,
        available: &Mpi,
        disabled: &Mpi,
        require_quorum: bool,
    ) -> Result<()> {
        if available.is_empty() {
            warn!("no available mountpaths to persist volume metadata to");
            return Ok(());
        }
        let mut vmd = Vmd::new(&self.daemon_id);
        vmd.version = reg.vmd_version + 1;
        for path in available.keys() {
            vmd.add(path, true);
        }
        for path in disabled.keys() {
            vmd.add(path, false);
        }
        let written = vmd.persist(available.keys().map(String::as_str));
        if require_quorum && written * 2 <= available.len() {
            return Err(Error::VmdQuorum {
                written,
                available: available.len(),
            });
        }
        if written < available.len() {
            warn!(
                written,
                total = available.len(),
                "volume metadata not written everywhere"
            );
        }
        reg.vmd_version = vmd.version;
        Ok(())
    }

    // mountpath keys are canonical; resolve an operator-supplied path the
    // same way, falling back to the lexical form when it no longer exists
    fn clean_key(mpath: &str) -> Result<String> {
        let clean = fsutil::validate_mpath(mpath)?;
        match fs::canonicalize(&clean) {
            Ok(real) => real
                .into_os_string()
                .into_string()
                .map_err(|_| Error::invalid_path(mpath, "not valid UTF-8")),
            Err(_) => Ok(clean),
        }
    }

    // membership operations

    /// Prepare, validate, and register all configured mountpaths,
    /// reconciling against the persisted volume metadata. Returns whether
    /// the metadata had to be rewritten.
    pub fn init(&self, config: &Config) -> Result<bool> {
        if config.fspaths.is_empty() {
            return Err(Error::NoMountpaths);
        }
        if config.testing_env {
            self.disable_fsid_check();
        }
        let cfgpaths: Vec<String> = config
            .fspaths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let (vmd, mut changed) =
            Vmd::load_all(cfgpaths.iter().map(String::as_str), &self.daemon_id)?;

        let mut reg = self.mu.lock();
        let mut available = Mpi::new();
        let mut disabled = Mpi::new();

        match vmd {
            None => {
                warn!(paths = ?cfgpaths, "no volume metadata: populating from configuration");
                for path in &cfgpaths {
                    let mi = Arc::new(Mountpath::new(path)?);
                    if mi.disks.is_empty() && !config.testing_env {
                        return Err(Error::NoDisks {
                            mpath: mi.path.clone(),
                        });
                    }
                    self.check_can_add(&reg, &mi, &available, &disabled)?;
                    self.add_enabled(&mut reg, &mi, &mut available, config)?;
                }
                changed = true;
            }
            Some(vmd) => {
                info!(version = vmd.version, "validating volume metadata against configuration");
                for path in &cfgpaths {
                    let mi = Arc::new(Mountpath::new(path)?);
                    if mi.path != *path {
                        warn!(given = %path, clean = %mi.path, "mountpath canonicalized");
                    }
                    let enabled = match vmd.mountpaths.get(&mi.path) {
                        Some(entry) => entry.enabled,
                        None => {
                            error!(mpath = %mi.path, "mountpath not in volume metadata");
                            changed = true;
                            true
                        }
                    };
                    if enabled {
                        if mi.disks.is_empty() && !config.testing_env {
                            return Err(Error::NoDisks {
                                mpath: mi.path.clone(),
                            });
                        }
                        self.check_can_add(&reg, &mi, &available, &disabled)?;
                        self.add_enabled(&mut reg, &mi, &mut available, config)?;
                    } else {
                        reg.fsids.insert(mi.fs.fsid, mi.path.clone());
                        disabled.insert(mi.path.clone(), mi);
                    }
                }
                for vpath in vmd.mountpaths.keys() {
                    if !available.contains_key(vpath) && !disabled.contains_key(vpath) {
                        error!(mpath = %vpath, "mountpath in volume metadata but not in configuration");
                        changed = true;
                    }
                }
                reg.vmd_version = vmd.version;
            }
        }

        if changed && config.md_write == MdWritePolicy::Always {
            self.persist_vmd(&mut reg, &available, &disabled, true)?;
        }
        self.swap(available, disabled);
        Ok(changed)
    }

    /// Add a new mountpath to the Available set
    pub fn add(&self, mpath: &str, config: &Config) -> Result<Arc<Mountpath>> {
        let mi = Arc::new(Mountpath::new(mpath)?);
        if mi.disks.is_empty() && !config.testing_env {
            return Err(Error::NoDisks {
                mpath: mi.path.clone(),
            });
        }
        let mut reg = self.mu.lock();
        let (mut available, disabled) = self.clone_mpi();
        self.check_can_add(&reg, &mi, &available, &disabled)?;
        self.add_enabled(&mut reg, &mi, &mut available, config)?;
        if config.md_write == MdWritePolicy::Always {
            self.persist_vmd(&mut reg, &available, &disabled, false)?;
        }
        self.swap(available, disabled);
        if mi.path != mpath {
            warn!(given = %mpath, clean = %mi.path, "mountpath canonicalized");
        }
        info!(%mi, "added mountpath");
        Ok(mi)
    }

    /// Move a previously disabled mountpath back to Available. `Ok(None)`
    /// when the mountpath is already available.
    pub fn enable(&self, mpath: &str, config: &Config) -> Result<Option<Arc<Mountpath>>> {
        let clean = Self::clean_key(mpath)?;
        let mut reg = self.mu.lock();
        let (mut available, mut disabled) = self.clone_mpi();
        if available.contains_key(&clean) {
            debug_assert!(!disabled.contains_key(&clean));
            return Ok(None);
        }
        let Some(mi) = disabled.remove(&clean) else {
            return Err(Error::MpathNotFound(mpath.to_string()));
        };
        self.ios.add_mpath(&mi.path, &mi.disks);
        if let Err(e) = mi.set_daemon_id(&self.daemon_id, config.md_write) {
            self.ios.remove_mpath(&mi.path);
            return Err(e);
        }
        available.insert(clean.clone(), Arc::clone(&mi));
        if config.md_write == MdWritePolicy::Always {
            self.persist_vmd(&mut reg, &available, &disabled, false)?;
        }
        self.swap(available, disabled);
        info!(%mi, "enabled mountpath");
        Ok(Some(mi))
    }

    /// Move an available mountpath to Disabled, keeping disk contents.
    /// `Ok(None)` when the mountpath was already disabled.
    pub fn disable(&self, mpath: &str, config: &Config) -> Result<Option<Arc<Mountpath>>> {
        let clean = Self::clean_key(mpath)?;
        let mut reg = self.mu.lock();
        let (mut available, mut disabled) = self.clone_mpi();
        if let Some(mi) = available.remove(&clean) {
            disabled.insert(clean.clone(), Arc::clone(&mi));
            self.ios.remove_mpath(&clean);
            mi.evict_lom_caches();
            markers::migrate(available.keys().map(String::as_str), &clean);
            if available.is_empty() {
                error!(%mi, "disabled the last available mountpath");
            } else {
                info!(%mi, remaining = available.len(), "disabled mountpath");
            }
            if config.md_write == MdWritePolicy::Always {
                self.persist_vmd(&mut reg, &available, &disabled, false)?;
            }
            self.swap(available, disabled);
            return Ok(Some(mi));
        }
        if disabled.contains_key(&clean) {
            return Ok(None);
        }
        Err(Error::MpathNotFound(mpath.to_string()))
    }

    /// Remove a mountpath from the registry entirely, clearing its
    /// daemon-id binding. Searches Available first, then Disabled.
    pub fn remove(&self, mpath: &str, config: &Config) -> Result<Arc<Mountpath>> {
        let clean = Self::clean_key(mpath)?;
        let mut reg = self.mu.lock();
        let (mut available, mut disabled) = self.clone_mpi();

        if let Some(mi) = disabled.remove(&clean) {
            if config.md_write == MdWritePolicy::Always {
                mi.clear_daemon_id()?;
            }
            reg.fsids.remove(&mi.fs.fsid);
            if config.md_write == MdWritePolicy::Always {
                self.persist_vmd(&mut reg, &available, &disabled, false)?;
            }
            self.swap(available, disabled);
            info!(%mi, "removed disabled mountpath");
            return Ok(mi);
        }

        let Some(mi) = available.remove(&clean) else {
            return Err(Error::MpathNotFound(mpath.to_string()));
        };
        if config.md_write == MdWritePolicy::Always {
            mi.clear_daemon_id()?;
        }
        self.ios.remove_mpath(&clean);
        reg.fsids.remove(&mi.fs.fsid);
        mi.evict_lom_caches();
        markers::migrate(available.keys().map(String::as_str), &clean);
        if available.is_empty() {
            error!(%mi, "removed the last available mountpath");
        } else {
            info!(%mi, remaining = available.len(), "removed mountpath");
        }
        if config.md_write == MdWritePolicy::Always {
            self.persist_vmd(&mut reg, &available, &disabled, false)?;
        }
        self.swap(available, disabled);
        Ok(mi)
    }

    /// Disable a mountpath after a disk fault, best effort
    pub fn disable_faulty(&self, mpath: &str, config: &Config) {
        warn!(mpath, "disabling mountpath after disk fault");
        if let Err(e) = self.disable(mpath, config) {
            error!(mpath, %e, "failed to disable faulty mountpath");
        }
    }

    // bucket-dir lifecycle

    /// Create the content-type directories of a bucket on every available
    /// mountpath. All mountpaths are attempted; the first error (if any) is
    /// returned.
    pub fn create_bucket_dirs(
        &self,
        bck: &Bck,
        bid: BucketId,
        nil_bmd: bool,
        config: &Config,
    ) -> Result<()> {
        let (available, _) = self.get();
        if available.is_empty() {
            return Err(Error::NoMountpaths);
        }
        let mut first_err = None;
        for mi in available.values() {
            match mi.create_bck_dirs(bck, bid, nil_bmd) {
                Ok(_) => {}
                Err(e) => {
                    error!(%mi, bucket = %bck, %e, "failed to create bucket directories");
                    if e.is_disk_fault() {
                        self.disable_faulty(&mi.path, config);
                    }
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Trash the bucket directory on every available mountpath. Missing
    /// sources are tolerated; the operation fails only when trashing failed
    /// on a majority of mountpaths.
    pub fn destroy_bucket_dirs(&self, bck: &Bck, bid: BucketId, config: &Config) -> Result<()> {
        let (available, _) = self.get();
        if available.is_empty() {
            return Err(Error::NoMountpaths);
        }
        let total = available.len();
        let mut failed = 0usize;
        let mut first_err = None;
        for mi in available.values() {
            let dir = mi.make_del_path_bck(bck, bid);
            if let Err(e) = mi.move_to_trash(&dir) {
                error!(%mi, dir, %e, "failed to trash bucket directory");
                if e.is_disk_fault() {
                    self.disable_faulty(&mi.path, config);
                }
                failed += 1;
                first_err.get_or_insert(e);
            }
        }
        if failed * 2 > total {
            return Err(first_err.unwrap_or(Error::NoMountpaths));
        }
        Ok(())
    }

    /// Rename the bucket directory on every available mountpath, in
    /// registry iteration order. On any failure the already-renamed
    /// mountpaths are rolled back in reverse order; rollback failures are
    /// logged without masking the original error.
    pub fn rename_bucket_dirs(
        &self,
        from_bid: BucketId,
        from: &Bck,
        to: &Bck,
        config: &Config,
    ) -> Result<()> {
        let (available, _) = self.get();
        if available.is_empty() {
            return Err(Error::NoMountpaths);
        }
        let mut renamed: Vec<&Arc<Mountpath>> = Vec::with_capacity(available.len());
        let mut failure: Option<(String, Error)> = None;
        for mi in available.values() {
            let from_dir = mi.make_del_path_bck(from, from_bid);
            let to_dir = mi.make_path_bck(to, BucketId::NONE);
            // the destination was validated empty at begin; clear leftovers
            // so the rename lands
            if let Err(e) = fs::remove_dir_all(&to_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    failure = Some((mi.path.clone(), e.into()));
                    break;
                }
            }
            match fs::rename(&from_dir, &to_dir) {
                Ok(()) => renamed.push(mi),
                Err(e) => {
                    failure = Some((mi.path.clone(), e.into()));
                    break;
                }
            }
        }
        let Some((fail_path, cause)) = failure else {
            return Ok(());
        };
        for mi in renamed.iter().rev() {
            let cur = mi.make_path_bck(to, BucketId::NONE);
            let orig = mi.make_path_bck(from, BucketId::NONE);
            if let Err(e) = fs::rename(&cur, &orig) {
                error!(%mi, %e, "bucket rename rollback failed");
            }
        }
        if cause.is_disk_fault() {
            self.disable_faulty(&fail_path, config);
        }
        Err(Error::RenameRollback {
            from: from.to_string(),
            to: to.to_string(),
            reason: cause.to_string(),
        })
    }

    /// Remove trashed directories on every available mountpath
    pub fn sweep_trash(&self) {
        let (available, _) = self.get();
        for mi in available.values() {
            mi.sweep_trash();
        }
    }

    // capacity

    /// Cached aggregate capacity status
    #[must_use]
    pub fn get_cap_status(&self) -> CapStatus {
        self.cap.read().status.clone()
    }

    /// Recompute the aggregate capacity status with fresh statvfs samples;
    /// optionally fills a per-mountpath capacity map.
    pub fn refresh_cap_status(
        &self,
        config: &Config,
        mut out: Option<&mut MpathCapMap>,
    ) -> Result<CapStatus> {
        let (available, _) = self.get();
        if available.is_empty() {
            return Err(Error::NoMountpaths);
        }
        let mut caps = Vec::with_capacity(available.len());
        for (path, mi) in available.iter() {
            let c = mi.get_capacity(config, true)?;
            if let Some(m) = out.as_deref_mut() {
                m.insert(path.clone(), c);
            }
            caps.push(c);
        }
        let cs = CapStatus::aggregate(caps.iter(), &config.space);
        let interval = next_refresh(cs.pct_avg, config);
        let mut st = self.cap.write();
        st.status = cs.clone();
        st.next_at = Some(Instant::now() + interval);
        Ok(cs)
    }

    /// Stats-ticker hook: refresh the aggregate when the adaptive interval
    /// has elapsed. Returns the status and whether it was recomputed.
    pub fn cap_periodic(
        &self,
        config: &Config,
        out: Option<&mut MpathCapMap>,
    ) -> Result<(CapStatus, bool)> {
        let due = {
            let st = self.cap.read();
            st.next_at.map_or(true, |t| Instant::now() >= t)
        };
        if !due {
            return Ok((self.get_cap_status(), false));
        }
        self.refresh_cap_status(config, out).map(|cs| (cs, true))
    }

    // decommission

    /// Take this target out of service. With `md_only` the per-mountpath
    /// metadata (VMD, markers, daemon-id binding) is removed and user data
    /// kept; otherwise mountpath contents are deleted entirely.
    pub fn decommission(&self, md_only: bool) {
        let (available, disabled) = self.get();
        for (idx, mpi) in [&available, &disabled].into_iter().enumerate() {
            for mi in mpi.values() {
                if md_only {
                    mi.clear_mds();
                    if let Err(e) = mi.clear_daemon_id() {
                        warn!(%mi, %e, "failed to clear daemon id");
                    }
                } else if let Err(e) = fs::remove_dir_all(&mi.path) {
                    if e.kind() != std::io::ErrorKind::NotFound && idx == 0 {
                        error!(%mi, %e, "failed to clean up available mountpath");
                    }
                }
            }
        }
    }

}
