//! Durable private file writes shared by the changelog and usage counters.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Write `data` to `path` atomically: temp file, fsync, owner-only mode, rename.
///
/// Parent directories are created (owner-only on unix).
pub fn atomic_write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            set_mode(parent, 0o700)?;
        }
    }

    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        set_mode(&temp_path, 0o600)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
