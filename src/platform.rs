//! Platform-specific filesystem helpers
//!
//! Hidden-item detection, read-only clearing before deletes, and timestamps.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;
use chrono::{DateTime, Utc};

#[cfg(windows)]
const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;

/// Whether an item is hidden: dot-prefixed anywhere, plus the hidden attribute on Windows.
pub fn is_hidden(path: &Path, metadata: Option<&fs::Metadata>) -> bool {
    let name = path.file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();

    if name.starts_with('.') {
        return true;
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::MetadataExt;
        let attrs = match metadata {
            Some(meta) => Some(meta.file_attributes()),
            None => fs::metadata(path).ok().map(|m| m.file_attributes()),
        };
        if let Some(attrs) = attrs {
            return attrs & FILE_ATTRIBUTE_HIDDEN != 0;
        }
    }
    #[cfg(not(windows))]
    let _ = metadata;

    false
}

/// Clear the read-only flag on a single item so it can be removed.
pub fn clear_readonly(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut permissions = metadata.permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = permissions.mode();
        if mode & 0o200 != 0 {
            return Ok(());
        }
        permissions.set_mode(mode | 0o200);
    }

    #[cfg(not(unix))]
    {
        if !permissions.readonly() {
            return Ok(());
        }
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
    }

    fs::set_permissions(path, permissions)
}

pub fn system_time_to_datetime(st: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(st)
}

/// Creation time, falling back to modification time where the platform has none.
pub fn created_at(metadata: &fs::Metadata) -> DateTime<Utc> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(system_time_to_datetime)
        .unwrap_or_else(|_| Utc::now())
}

pub fn modified_at(metadata: &fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(system_time_to_datetime)
        .unwrap_or_else(|_| Utc::now())
}
