//! Small filesystem helpers shared by the mountpath and transaction layers.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Validate and lexically canonicalize a mountpath string.
///
/// The path must be absolute; `.` and `..` components and duplicate or
/// trailing separators are removed. Symlink resolution is left to the caller
/// (the filesystem probe), since the path may legitimately not exist yet at
/// validation time.
pub fn validate_mpath(mpath: &str) -> Result<String> {
    if mpath.is_empty() {
        return Err(Error::invalid_path(mpath, "empty path"));
    }
    let path = Path::new(mpath);
    if !path.is_absolute() {
        return Err(Error::invalid_path(mpath, "must be absolute"));
    }
    let mut clean = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::RootDir => clean.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(Error::invalid_path(mpath, "escapes filesystem root"));
                }
            }
            Component::Normal(c) => clean.push(c),
            Component::Prefix(_) => {
                return Err(Error::invalid_path(mpath, "unsupported path prefix"))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        clean.push(Component::RootDir.as_os_str());
    }
    clean
        .into_os_string()
        .into_string()
        .map_err(|_| Error::invalid_path(mpath, "not valid UTF-8"))
}

/// Check that a path exists and is reachable
pub fn access(path: impl AsRef<Path>) -> std::io::Result<()> {
    fs::metadata(path).map(|_| ())
}

/// Create a directory and all of its parents
pub fn create_dir(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Check whether a directory is empty; returns up to a few entry names for
/// error reporting when it is not.
pub fn is_dir_empty(dir: impl AsRef<Path>) -> Result<(Vec<String>, bool)> {
    const SAMPLE: usize = 4;
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        names.push(entry.file_name().to_string_lossy().into_owned());
        if names.len() >= SAMPLE {
            break;
        }
    }
    let empty = names.is_empty();
    Ok((names, empty))
}

/// Copy a file, creating the destination's parent directory if needed.
/// Returns the number of bytes copied.
pub fn copy_file(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
    if let Some(parent) = to.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    let n = fs::copy(from, to)?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_mpath() {
        assert_eq!(validate_mpath("/data/m1").unwrap(), "/data/m1");
        assert_eq!(validate_mpath("/data//m1/").unwrap(), "/data/m1");
        assert_eq!(validate_mpath("/data/./m1").unwrap(), "/data/m1");
        assert_eq!(validate_mpath("/data/x/../m1").unwrap(), "/data/m1");
        assert_eq!(validate_mpath("/").unwrap(), "/");

        assert!(validate_mpath("").is_err());
        assert!(validate_mpath("relative/path").is_err());
        assert!(validate_mpath("/..").is_err());
    }

    #[test]
    fn test_is_dir_empty() {
        let dir = tempdir().unwrap();
        let (_, empty) = is_dir_empty(dir.path()).unwrap();
        assert!(empty);

        std::fs::write(dir.path().join("x"), b"1").unwrap();
        let (names, empty) = is_dir_empty(dir.path()).unwrap();
        assert!(!empty);
        assert_eq!(names, vec!["x".to_string()]);
    }

    #[test]
    fn test_copy_file_creates_parents() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, b"payload").unwrap();
        let dst = dir.path().join("a/b/dst");
        let n = copy_file(&src, &dst).unwrap();
        assert_eq!(n, 7);
        assert_eq!(std::fs::read(dst).unwrap(), b"payload");
    }
}
