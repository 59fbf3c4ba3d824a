//! Copy and move between folders
//!
//! Both operations share one per-item pipeline. Conflicts and missing items
//! accumulate; the first permission or I/O failure ends the batch and nothing
//! already transferred is undone.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::access::PermissionAction;
use crate::naming::next_available_name;
use crate::operations::{remove_tree, BatchResult, FileError, FileManager, Result};
use crate::platform::clear_readonly;
use crate::security::VirtualPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    Move,
}

impl TransferMode {
    fn required(self) -> &'static [PermissionAction] {
        match self {
            TransferMode::Copy => &[PermissionAction::Read, PermissionAction::Copy],
            TransferMode::Move => &[PermissionAction::Read, PermissionAction::Write],
        }
    }
}

/// Destination folder as the client last saw it, used when no target path is sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetHint {
    pub name: String,
    pub filter_path: String,
}

impl FileManager {
    /// Copy `names` from `path` into `target_path`.
    pub fn copy(
        &self,
        path: &str,
        target_path: &str,
        names: &[String],
        rename_files: &[String],
        target_hint: Option<&TargetHint>,
    ) -> BatchResult {
        self.transfer(TransferMode::Copy, path, target_path, names, rename_files, target_hint)
    }

    /// Move `names` from `path` into `target_path`.
    pub fn move_items(
        &self,
        path: &str,
        target_path: &str,
        names: &[String],
        rename_files: &[String],
        target_hint: Option<&TargetHint>,
    ) -> BatchResult {
        self.transfer(TransferMode::Move, path, target_path, names, rename_files, target_hint)
    }

    fn transfer(
        &self,
        mode: TransferMode,
        path: &str,
        target_path: &str,
        names: &[String],
        rename_files: &[String],
        target_hint: Option<&TargetHint>,
    ) -> BatchResult {
        let mut result = BatchResult::default();

        let target = match self.transfer_target(target_path, target_hint) {
            Ok(target) => target,
            Err(e) => {
                result.error = Some(e);
                return result;
            }
        };
        tracing::debug!("{:?} {} item(s) from {} to {}", mode, names.len(), path, target);

        for name in names {
            if let Err(e) = self.transfer_one(mode, path, &target, name, rename_files, &mut result) {
                tracing::warn!("{:?} stopped at '{}': {}", mode, name, e);
                result.error = Some(e);
                break;
            }
        }
        result.finish()
    }

    /// Resolve the destination folder and check it accepts new contents.
    fn transfer_target(&self, target_path: &str, hint: Option<&TargetHint>) -> Result<VirtualPath> {
        let target = match hint {
            Some(hint) if target_path.is_empty() => {
                let parent = VirtualPath::parse(&hint.filter_path)?;
                if hint.name.is_empty() {
                    parent
                } else {
                    parent.join(&hint.name)?
                }
            }
            _ => VirtualPath::parse(target_path)?,
        };
        let host = self.resolver.resolve_virtual(&target)?;
        if !host.is_dir() {
            return Err(FileError::NotFound(target.to_string()));
        }
        self.access.require(&target, false, &[PermissionAction::WriteContents])?;
        Ok(target)
    }

    fn transfer_one(
        &self,
        mode: TransferMode,
        path: &str,
        target: &VirtualPath,
        name: &str,
        rename_files: &[String],
        result: &mut BatchResult,
    ) -> Result<()> {
        let (prefix, item) = match name.rfind('/') {
            Some(idx) => (&name[..idx], &name[idx + 1..]),
            None => ("", name),
        };
        let mut folder = VirtualPath::parse(path)?;
        if !prefix.is_empty() {
            folder = folder.join(prefix)?;
        }
        let source = folder.join(item)?;
        let source_host = self.resolver.resolve_virtual(&source)?;
        self.require_readable(&folder)?;

        let Ok(metadata) = fs::symlink_metadata(&source_host) else {
            result.missing.push(item.to_string());
            return Ok(());
        };
        let is_file = !metadata.is_dir();
        self.access.require(&source, is_file, mode.required())?;

        if !is_file && target.starts_with(&source) {
            return Err(FileError::DestinationInsideSource);
        }

        let mut dest = target.join(item)?;
        let mut dest_host = self.resolver.resolve_virtual(&dest)?;
        let mut previous_name = None;

        if fs::symlink_metadata(&dest_host).is_ok() {
            let flagged = rename_files.iter().any(|r| r == name || r == item);
            if !flagged {
                result.conflicts.push(name.to_string());
                return Ok(());
            }
            dest_host = next_available_name(&dest_host, !is_file);
            let renamed = dest_host
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            dest = target.join(&renamed)?;
            self.resolver.resolve_virtual(&dest)?;
            previous_name = Some(item.to_string());
        }

        if is_file {
            fs::copy(&source_host, &dest_host)?;
        } else {
            copy_tree(&source_host, &dest_host)?;
        }
        if mode == TransferMode::Move {
            let removed = if is_file {
                clear_readonly(&source_host).and_then(|_| fs::remove_file(&source_host))
            } else {
                remove_tree(&source_host)
            };
            removed.map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => FileError::Unauthorized(source.to_string()),
                _ => FileError::Io(e),
            })?;
        }

        let mut entry = self.entry_for(&dest, &dest_host)?;
        entry.previous_name = previous_name;
        result.files.push(entry);
        Ok(())
    }
}

/// Recursively copy a folder. Symlinks inside the source are not followed.
fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            tracing::warn!("Not copying symlink {}", entry.path().display());
        }
    }
    Ok(())
}
