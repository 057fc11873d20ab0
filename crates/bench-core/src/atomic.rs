//! Crash-safe file replacement.
//!
//! Both helpers write into a temporary file in the destination directory,
//! flush it to disk and then rename it over the destination, so readers only
//! ever observe the old file or the complete new one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Prefix of in-flight temporary files. Directory scanners should skip these.
pub const TEMP_PREFIX: &str = ".bench-";

/// Suffix of in-flight temporary files.
pub const TEMP_SUFFIX: &str = ".partial";

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = temp_beside(path)?;
    tmp.write_all(contents)?;
    finish(tmp, path)
}

/// Atomically copy `source` to `dest`, replacing any existing file.
///
/// Returns the number of bytes copied.
pub fn copy_atomic(source: &Path, dest: &Path) -> io::Result<u64> {
    let mut input = File::open(source)?;
    let mut tmp = temp_beside(dest)?;
    let copied = io::copy(&mut input, tmp.as_file_mut())?;
    finish(tmp, dest)?;
    Ok(copied)
}

/// Check whether a file name belongs to an in-flight temporary file.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn temp_beside(path: &Path) -> io::Result<NamedTempFile> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
}

fn finish(tmp: NamedTempFile, dest: &Path) -> io::Result<()> {
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    sync_dir(parent_dir(dest));
    Ok(())
}

/// Flush the directory entry of a rename. Best-effort; not supported everywhere.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            tracing::debug!(dir = %dir.display(), error = %e, "Directory sync failed");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_write_atomic_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/settings.toml");

        write_atomic(&path, b"x = \"1\"").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_copy_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.lua");
        fs::write(&source, "return {}").unwrap();

        let store = dir.path().join("store");
        let dest = store.join("source.lua");
        let copied = copy_atomic(&source, &dest).unwrap();

        assert_eq!(copied, 9);
        let names: Vec<String> = fs::read_dir(&store)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["source.lua".to_string()]);
    }

    #[test]
    fn test_copy_atomic_missing_source_keeps_dest() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("kept.lua");
        fs::write(&dest, "old").unwrap();

        let result = copy_atomic(&dir.path().join("missing.lua"), &dest);
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "old");
    }

    #[test]
    fn test_is_temp_name() {
        assert!(is_temp_name(".bench-abc123.partial"));
        assert!(!is_temp_name("weather.plugin"));
        assert!(!is_temp_name(".bench-abc123"));
    }
}
