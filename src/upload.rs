//! Upload handling
//!
//! Chunked uploads are plain appends: a chunk continues an existing file when
//! it arrives as `application/octet-stream` and the file on disk has not yet
//! reached the announced total size.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use crate::access::PermissionAction;
use crate::naming;
use crate::operations::{FileError, FileManager, Result};
use crate::platform::clear_readonly;
use crate::security::VirtualPath;

/// Content type the client uses for every chunk of a chunked upload.
pub const CHUNK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAction {
    Save,
    Replace,
    Remove,
    KeepBoth,
}

impl FromStr for UploadAction {
    type Err = FileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "save" => Ok(UploadAction::Save),
            "replace" => Ok(UploadAction::Replace),
            "remove" => Ok(UploadAction::Remove),
            "keepboth" => Ok(UploadAction::KeepBoth),
            other => Err(FileError::InvalidRequest(format!("Unknown upload action '{}'", other))),
        }
    }
}

/// One uploaded part.
#[derive(Debug, Clone, Default)]
pub struct IncomingFile {
    /// File name, possibly with a relative folder prefix for folder uploads.
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
    /// Position of this chunk when the client reports it.
    pub chunk_index: Option<u32>,
}

/// What happened to each part of an upload request.
#[derive(Debug, Default)]
pub struct UploadResult {
    /// Virtual paths written or removed.
    pub files: Vec<String>,
    pub conflicts: Vec<String>,
    pub missing: Vec<String>,
    pub error: Option<FileError>,
}

impl UploadResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.conflicts.is_empty() && self.missing.is_empty()
    }
}

impl FileManager {
    /// Apply `action` to every incoming file under `path`.
    pub fn upload(
        &self,
        path: &str,
        files: &[IncomingFile],
        action: UploadAction,
        expected_size: Option<u64>,
    ) -> UploadResult {
        let mut result = UploadResult::default();

        let folder = match self.upload_folder(path) {
            Ok(folder) => folder,
            Err(e) => {
                result.error = Some(e);
                return result;
            }
        };

        for file in files {
            if let Err(e) = self.upload_one(&folder, file, action, expected_size, &mut result) {
                tracing::warn!("Upload of '{}' failed: {}", file.name, e);
                result.error = Some(e);
                break;
            }
        }
        result
    }

    fn upload_folder(&self, path: &str) -> Result<VirtualPath> {
        let (folder, _) = self.resolve_folder(path)?;
        self.access.require(
            &folder,
            false,
            &[PermissionAction::WriteContents, PermissionAction::Upload],
        )?;
        Ok(folder)
    }

    fn upload_one(
        &self,
        folder: &VirtualPath,
        file: &IncomingFile,
        action: UploadAction,
        expected_size: Option<u64>,
        result: &mut UploadResult,
    ) -> Result<()> {
        let name = file.name.trim_start_matches('/');
        if name.is_empty() {
            return Err(FileError::InvalidRequest("Upload without a file name".to_string()));
        }
        let target = folder.join(name)?;
        let host = self.resolver.resolve_virtual(&target)?;
        let destination = target.parent().unwrap_or_default();
        self.access.require(
            &destination,
            false,
            &[PermissionAction::WriteContents, PermissionAction::Upload],
        )?;

        if action == UploadAction::Remove {
            if host.is_file() {
                clear_readonly(&host)?;
                fs::remove_file(&host)?;
                result.files.push(target.to_string());
            } else {
                result.missing.push(name.to_string());
            }
            return Ok(());
        }

        self.create_parents(folder, &target)?;

        match action {
            UploadAction::Save => {
                if fs::symlink_metadata(&host).is_err() {
                    write_new(&host, &file.data)?;
                } else if self.is_continuation(&host, file, expected_size) {
                    append(&host, &file.data)?;
                } else {
                    result.conflicts.push(name.to_string());
                    return Ok(());
                }
                result.files.push(target.to_string());
            }
            UploadAction::Replace => {
                if self.is_continuation(&host, file, expected_size) {
                    append(&host, &file.data)?;
                } else {
                    if host.is_file() {
                        clear_readonly(&host)?;
                        fs::remove_file(&host)?;
                    }
                    write_new(&host, &file.data)?;
                }
                result.files.push(target.to_string());
            }
            UploadAction::KeepBoth => {
                let probe = naming::probe(&host, false);
                let written = match probe.last_taken {
                    Some(last) if self.is_continuation(&last, file, expected_size) => {
                        append(&last, &file.data)?;
                        last
                    }
                    _ => {
                        write_new(&probe.available, &file.data)?;
                        probe.available
                    }
                };
                let written_name = written
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let parent = target.parent().unwrap_or_default();
                let written_target = parent.join(&written_name)?;
                self.resolver.resolve_virtual(&written_target)?;
                result.files.push(written_target.to_string());
            }
            UploadAction::Remove => {}
        }
        Ok(())
    }

    /// Whether `file` is a later chunk of an upload already under way at `host`.
    fn is_continuation(&self, host: &Path, file: &IncomingFile, expected_size: Option<u64>) -> bool {
        if !self.options.chunked_uploads
            || file.content_type != CHUNK_CONTENT_TYPE
            || file.chunk_index == Some(0)
        {
            return false;
        }
        let Some(expected) = expected_size else {
            return false;
        };
        match fs::metadata(host) {
            Ok(metadata) => metadata.is_file() && metadata.len() != expected,
            Err(_) => false,
        }
    }

    /// Create every folder between `folder` and `target`, checking each one.
    fn create_parents(&self, folder: &VirtualPath, target: &VirtualPath) -> Result<()> {
        let Some(parent) = target.parent() else {
            return Ok(());
        };
        for intermediate in parent.ancestors().into_iter().filter(|a| a.starts_with(folder) && a != folder) {
            let host = self.resolver.resolve_virtual(&intermediate)?;
            if !host.is_dir() {
                let parent = intermediate.parent().unwrap_or_default();
                self.access.require(&parent, false, &[PermissionAction::WriteContents])?;
                fs::create_dir(&host)?;
                tracing::debug!("Created upload folder {}", intermediate);
            }
        }
        Ok(())
    }
}

fn write_new(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    file.write_all(data)?;
    file.flush()
}

fn append(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(data)?;
    file.flush()
}
