//! Filesystem probe
//!
//! Resolves a directory to the filesystem that services it: device name,
//! fsid, mountpoint, and the owned physical disks. Capacity numbers come
//! from `statvfs`; the device/mountpoint pair comes from the OS mount table.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tessera_common::{Error, Result};

/// Identity of the filesystem backing a mountpath
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsInfo {
    /// Device (or pseudo-device) the filesystem lives on, e.g. `/dev/sda1`
    pub fs: String,
    /// Filesystem type, e.g. `xfs`
    pub fs_type: String,
    /// Mountpoint servicing the probed path
    pub mountpoint: String,
    /// Opaque filesystem id; unique per mounted filesystem
    pub fsid: u64,
}

/// Raw capacity numbers for one filesystem
#[derive(Clone, Copy, Debug, Default)]
pub struct VfsStat {
    pub blocks: u64,
    pub bavail: u64,
    pub bsize: u64,
}

/// statvfs(2) wrapper returning block counts and the fragment size
pub fn statvfs(path: impl AsRef<Path>) -> io::Result<(VfsStat, u64)> {
    let cpath = CString::new(path.as_ref().as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut vfs) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::unnecessary_cast)]
    let stat = VfsStat {
        blocks: vfs.f_blocks as u64,
        bavail: vfs.f_bavail as u64,
        bsize: vfs.f_frsize as u64,
    };
    #[allow(clippy::unnecessary_cast)]
    let fsid = vfs.f_fsid as u64;
    Ok((stat, fsid))
}

/// Resolve the filesystem servicing `path`
pub fn probe_fs(path: &str) -> Result<FsInfo> {
    let (_, fsid) = statvfs(path).map_err(|source| Error::NotAccessible {
        path: path.to_string(),
        source,
    })?;
    let (fs, fs_type, mountpoint) = mount_entry_for(path);
    Ok(FsInfo {
        fs,
        fs_type,
        mountpoint,
        fsid,
    })
}

/// Physical disks behind a device name; empty when the device is virtual
/// (tmpfs, overlay, network filesystems) or cannot be resolved.
#[must_use]
pub fn disks_of(device: &str) -> Vec<String> {
    let Some(name) = device.strip_prefix("/dev/") else {
        return Vec::new();
    };
    let base = strip_partition(name);
    if base.is_empty() {
        return Vec::new();
    }
    vec![base.to_string()]
}

// "sda1" => "sda", "nvme0n1p2" => "nvme0n1", "nvme0n1" => "nvme0n1"
fn strip_partition(name: &str) -> &str {
    if let Some(idx) = name.rfind('p') {
        // nvme/mmcblk style: <disk>p<digits>
        let (disk, part) = name.split_at(idx);
        if !disk.is_empty()
            && disk.ends_with(|c: char| c.is_ascii_digit())
            && part.len() > 1
            && part[1..].chars().all(|c| c.is_ascii_digit())
        {
            return disk;
        }
    }
    // sdX/vdX/xvdX style: the disk name itself carries no digits
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() < name.len() && trimmed.chars().all(|c| !c.is_ascii_digit()) {
        return trimmed;
    }
    name
}

/// Longest-prefix match of `path` against the mount table
#[cfg(target_os = "linux")]
fn mount_entry_for(path: &str) -> (String, String, String) {
    let table = match std::fs::read_to_string("/proc/self/mounts") {
        Ok(t) => t,
        Err(_) => return fallback_entry(path),
    };
    let mut best: Option<(String, String, String)> = None;
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(dev), Some(mp), Some(fstype)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !is_path_prefix(mp, path) {
            continue;
        }
        match &best {
            Some((_, _, cur)) if cur.len() >= mp.len() => {}
            _ => best = Some((dev.to_string(), fstype.to_string(), mp.to_string())),
        }
    }
    best.unwrap_or_else(|| fallback_entry(path))
}

#[cfg(not(target_os = "linux"))]
fn mount_entry_for(path: &str) -> (String, String, String) {
    fallback_entry(path)
}

fn fallback_entry(path: &str) -> (String, String, String) {
    ("unknown".to_string(), "unknown".to_string(), path.to_string())
}

fn is_path_prefix(mountpoint: &str, path: &str) -> bool {
    if mountpoint == "/" {
        return true;
    }
    match path.strip_prefix(mountpoint) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_statvfs_reports_capacity() {
        let dir = tempdir().unwrap();
        let (stat, _fsid) = statvfs(dir.path()).unwrap();
        assert!(stat.blocks > 0);
        assert!(stat.bsize > 0);
        assert!(stat.bavail <= stat.blocks);
    }

    #[test]
    fn test_probe_missing_path() {
        let err = probe_fs("/definitely/not/here").unwrap_err();
        assert_eq!(err.kind(), "ErrNotAccessible");
    }

    #[test]
    fn test_probe_resolves_mountpoint() {
        let dir = tempdir().unwrap();
        let info = probe_fs(dir.path().to_str().unwrap()).unwrap();
        assert!(!info.mountpoint.is_empty());
        assert!(is_path_prefix(&info.mountpoint, dir.path().to_str().unwrap()));
    }

    #[test]
    fn test_strip_partition() {
        assert_eq!(strip_partition("sda1"), "sda");
        assert_eq!(strip_partition("sdb"), "sdb");
        assert_eq!(strip_partition("nvme0n1p2"), "nvme0n1");
        assert_eq!(strip_partition("nvme0n1"), "nvme0n1");
        assert_eq!(strip_partition("mmcblk0p1"), "mmcblk0");
    }

    #[test]
    fn test_path_prefix() {
        assert!(is_path_prefix("/", "/data/m1"));
        assert!(is_path_prefix("/data", "/data/m1"));
        assert!(is_path_prefix("/data/m1", "/data/m1"));
        assert!(!is_path_prefix("/data/m1", "/data/m10"));
        assert!(!is_path_prefix("/data/m10", "/data/m1"));
    }

    #[test]
    fn test_disks_of() {
        assert_eq!(disks_of("/dev/sda1"), vec!["sda".to_string()]);
        assert_eq!(disks_of("tmpfs"), Vec::<String>::new());
        assert_eq!(disks_of("overlay"), Vec::<String>::new());
    }
}
