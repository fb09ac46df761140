//! Extended-attribute access for mountpath roots
//!
//! The daemon id is bound to each mountpath root through the
//! `user.ais.daemon_id` attribute so a disk that migrates between hosts is
//! recognized as foreign.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Attribute binding a mountpath root to its target's daemon id
pub const DAEMON_ID_XATTR: &str = "user.ais.daemon_id";

#[cfg(target_os = "linux")]
const ENO_ATTR: i32 = libc::ENODATA;
#[cfg(target_os = "macos")]
const ENO_ATTR: i32 = libc::ENOATTR;

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

fn cname(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

/// Read an extended attribute; `Ok(None)` when the attribute is not set.
pub fn get_xattr(path: impl AsRef<Path>, name: &str) -> io::Result<Option<Vec<u8>>> {
    let path = cpath(path.as_ref())?;
    let name = cname(name)?;
    let mut buf = vec![0u8; 256];
    loop {
        #[cfg(target_os = "linux")]
        let n = unsafe {
            libc::getxattr(
                path.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        #[cfg(target_os = "macos")]
        let n = unsafe {
            libc::getxattr(
                path.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                0,
            )
        };
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(Some(buf));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == ENO_ATTR => return Ok(None),
            Some(libc::ERANGE) if buf.len() < 64 * 1024 => {
                let doubled = buf.len() * 2;
                buf.resize(doubled, 0);
            }
            _ => return Err(err),
        }
    }
}

/// Set an extended attribute
pub fn set_xattr(path: impl AsRef<Path>, name: &str, value: &[u8]) -> io::Result<()> {
    let path = cpath(path.as_ref())?;
    let name = cname(name)?;
    #[cfg(target_os = "linux")]
    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    #[cfg(target_os = "macos")]
    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
            0,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Remove an extended attribute; absence is not an error.
pub fn remove_xattr(path: impl AsRef<Path>, name: &str) -> io::Result<()> {
    let path = cpath(path.as_ref())?;
    let name = cname(name)?;
    #[cfg(target_os = "linux")]
    let rc = unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) };
    #[cfg(target_os = "macos")]
    let rc = unsafe { libc::removexattr(path.as_ptr(), name.as_ptr(), 0) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(ENO_ATTR) {
            return Err(err);
        }
    }
    Ok(())
}
