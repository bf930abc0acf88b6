//! Checked reads and atomic writes.
//!
//! The write path is all-or-nothing: content goes to a temp file in the
//! target directory, is synced, and is renamed over the destination. A
//! target file is never observable in a half-written state.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Atomically replace `path` with `content`, preserving its permissions
/// when it already exists.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let prior_perms = fs::metadata(path).ok().map(|m| m.permissions());

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.as_file().sync_all().ok();
    tmp.persist(path)
        .with_context(|| format!("rename into place: {}", path.display()))?;

    if let Some(perms) = prior_perms {
        let _ = fs::set_permissions(path, perms);
    }
    let _ = sync_dir(dir);
    Ok(())
}

/// Create `path` with `content` only when it does not already exist.
/// Returns whether the file was created.
pub fn create_if_missing(path: &Path, content: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    write_atomic(path, content)?;
    Ok(true)
}

/// Cross-platform directory fsync helper.
#[cfg(unix)]
pub fn sync_dir(p: &Path) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;
    let f = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(p)?;
    f.sync_all()
}

#[cfg(windows)]
pub fn sync_dir(_p: &Path) -> std::io::Result<()> {
    // Windows does not expose a reliable directory fsync; best-effort no-op.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("site.conf");
        fs::write(&path, "old").unwrap();

        write_atomic(&path, "new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn create_if_missing_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("conf.d/zones.conf");

        assert!(create_if_missing(&path, "zones").unwrap());
        assert!(!create_if_missing(&path, "other").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "zones");
    }
}
