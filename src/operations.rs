//! Core file operations for fileman
//!
//! `FileManager` is the single provider behind every request. Each operation
//! resolves its paths through the [`PathResolver`] and checks the
//! [`PermissionEngine`] before it touches the filesystem.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::access::{AccessDenied, AccessDetails, AccessPermission, PermissionAction, PermissionEngine};
use crate::platform::{clear_readonly, created_at, is_hidden, modified_at};
use crate::security::{PathResolver, SecurityError, VirtualPath};

#[derive(Error, Debug)]
pub enum FileError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Access(#[from] AccessDenied),

    #[error("{0} not found in given location.")]
    NotFound(String),

    #[error("A file or folder with the name {0} already exists.")]
    AlreadyExists(String),

    #[error("Cannot rename {from} to {to}: destination already exists.")]
    RenameConflict { from: String, to: String },

    #[error("Access to the path '{0}' is denied.")]
    Unauthorized(String),

    #[error("The destination folder is the subfolder of the source folder.")]
    DestinationInsideSource,

    #[error("Restricted to modify the root folder.")]
    RootModification,

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("{0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, FileError>;

/// Coarse error classes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AccessDenied,
    Traversal,
    Io,
    Invalid,
}

impl ErrorKind {
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::Invalid => 400,
            ErrorKind::AccessDenied => 401,
            ErrorKind::Traversal | ErrorKind::Io => 417,
        }
    }
}

impl FileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FileError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => ErrorKind::NotFound,
                io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
                io::ErrorKind::AlreadyExists => ErrorKind::Conflict,
                _ => ErrorKind::Io,
            },
            FileError::Security(SecurityError::PathTraversal(_)) => ErrorKind::Traversal,
            FileError::Security(SecurityError::InvalidPath(_)) => ErrorKind::Invalid,
            FileError::Access(_) | FileError::Unauthorized(_) | FileError::RootModification => {
                ErrorKind::AccessDenied
            }
            FileError::NotFound(_) => ErrorKind::NotFound,
            FileError::AlreadyExists(_) | FileError::RenameConflict { .. } => ErrorKind::Conflict,
            FileError::DestinationInsideSource | FileError::InvalidRequest(_) => ErrorKind::Invalid,
            FileError::Archive(_) => ErrorKind::Io,
        }
    }

    pub fn code(&self) -> u16 {
        self.kind().code()
    }
}

/// One file or folder as the client widget sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub size: u64,
    pub is_file: bool,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
    pub has_child: bool,
    #[serde(rename = "type")]
    pub file_type: String,
    pub filter_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<AccessPermission>,
}

/// Folder contents or search hits together with the folder they came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub cwd: DirectoryEntry,
    pub files: Vec<DirectoryEntry>,
}

/// Summary shown in the details dialog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDetails {
    pub name: String,
    pub location: String,
    pub is_file: bool,
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    pub multiple_files: bool,
}

/// Outcome of a batch operation. Items finished before a fatal error stay done.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub files: Vec<DirectoryEntry>,
    pub conflicts: Vec<String>,
    pub missing: Vec<String>,
    pub error: Option<FileError>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.conflicts.is_empty() && self.missing.is_empty()
    }

    /// Missing items fail the whole request once nothing fatal happened first.
    pub(crate) fn finish(mut self) -> Self {
        if self.error.is_none() && !self.missing.is_empty() {
            self.error = Some(FileError::NotFound(self.missing.join(", ")));
        }
        self
    }
}

/// Image bytes plus the sniffed content type.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Capability flags for one provider.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Treat octet-stream uploads with a size mismatch as appended chunks.
    pub chunked_uploads: bool,
    /// Display name of the root folder used in details locations.
    pub root_name: Option<String>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            chunked_uploads: true,
            root_name: None,
        }
    }
}

/// Sandboxed file-manager provider
#[derive(Debug, Clone)]
pub struct FileManager {
    pub(crate) resolver: PathResolver,
    pub(crate) access: PermissionEngine,
    pub(crate) options: ProviderOptions,
    root_name: String,
}

impl FileManager {
    /// Create a provider over `root` with no access rules.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_resolver(PathResolver::new(root)?))
    }

    pub fn from_resolver(resolver: PathResolver) -> Self {
        let root_name = resolver
            .root()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Files".to_string());
        Self {
            resolver,
            access: PermissionEngine::default(),
            options: ProviderOptions::default(),
            root_name,
        }
    }

    /// Install the rule set. A provider's rules never change after this.
    pub fn with_access(mut self, details: Option<AccessDetails>) -> Self {
        self.access = PermissionEngine::new(details);
        self
    }

    pub fn with_options(mut self, options: ProviderOptions) -> Self {
        if let Some(name) = &options.root_name {
            self.root_name = name.clone();
        }
        self.options = options;
        self
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.options
    }

    /// Read access on `folder` and every folder above it.
    pub(crate) fn require_readable(&self, folder: &VirtualPath) -> Result<()> {
        for ancestor in folder.ancestors() {
            self.access.require(&ancestor, false, &[PermissionAction::Read])?;
        }
        Ok(())
    }

    /// Resolve a folder the request is operating in and make sure it is one.
    pub(crate) fn resolve_folder(&self, path: &str) -> Result<(VirtualPath, PathBuf)> {
        let folder = VirtualPath::parse(path)?;
        let host = self.resolver.resolve_virtual(&folder)?;
        if !host.is_dir() {
            return Err(FileError::NotFound(folder.to_string()));
        }
        Ok((folder, host))
    }

    /// Build the widget entry for an existing item.
    pub(crate) fn entry_for(&self, target: &VirtualPath, host: &Path) -> Result<DirectoryEntry> {
        let metadata = fs::metadata(host)?;
        let is_file = !metadata.is_dir();
        let name = target
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| self.root_name.clone());

        let file_type = if is_file {
            Path::new(&name)
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_default()
        } else {
            String::new()
        };
        let filter_path = target
            .parent()
            .map(|parent| parent.as_dir_string())
            .unwrap_or_default();

        Ok(DirectoryEntry {
            name,
            size: if is_file { metadata.len() } else { 0 },
            is_file,
            date_created: created_at(&metadata),
            date_modified: modified_at(&metadata),
            has_child: !is_file && has_subfolder(host),
            file_type,
            filter_path,
            previous_name: None,
            permission: self.access.permission_for(target, is_file),
        })
    }

    /// List the immediate children of a folder, folders first.
    pub fn list(&self, path: &str, show_hidden: bool) -> Result<Listing> {
        let (folder, host) = self.resolve_folder(path)?;
        self.require_readable(&folder)?;
        tracing::debug!("list {}", folder);

        let cwd = self.entry_for(&folder, &host)?;
        let mut folders = Vec::new();
        let mut files = Vec::new();

        for child in fs::read_dir(&host)? {
            let child = child?;
            let Some(name) = child.file_name().to_str().map(str::to_string) else {
                tracing::warn!("Skipping non UTF-8 name in {}", host.display());
                continue;
            };
            let target = match folder.join(&name) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!("Skipping '{}' in {}: {}", name, folder, e);
                    continue;
                }
            };
            let child_host = match self.resolver.resolve_virtual(&target) {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("Skipping '{}': {}", target, e);
                    continue;
                }
            };
            let Ok(metadata) = fs::metadata(&child_host) else {
                continue;
            };
            if !show_hidden && is_hidden(&child_host, Some(&metadata)) {
                continue;
            }

            let entry = self.entry_for(&target, &child_host)?;
            if metadata.is_dir() {
                folders.push(entry);
            } else {
                files.push(entry);
            }
        }

        folders.sort_by(|a, b| a.name.cmp(&b.name));
        files.sort_by(|a, b| a.name.cmp(&b.name));
        folders.extend(files);

        Ok(Listing { cwd, files: folders })
    }

    /// Recursive wildcard search below a folder.
    pub fn search(
        &self,
        path: &str,
        pattern: &str,
        show_hidden: bool,
        case_sensitive: bool,
    ) -> Result<Listing> {
        let (folder, host) = self.resolve_folder(path)?;
        self.require_readable(&folder)?;
        tracing::debug!("search {} for '{}'", folder, pattern);

        let matcher = RegexBuilder::new(&wildcard_to_regex(pattern))
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| FileError::InvalidRequest(e.to_string()))?;

        let cwd = self.entry_for(&folder, &host)?;
        let mut hits = Vec::new();

        let walker = WalkDir::new(&host)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || show_hidden || !is_hidden(e.path(), None));

        for item in walker {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!("Search skipped an entry: {}", e);
                    continue;
                }
            };
            let Some(name) = item.file_name().to_str() else {
                continue;
            };
            if !matcher.is_match(name) {
                continue;
            }

            let target = match self.resolver.virtual_path_of(item.path()) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!("Skipping search hit '{}': {}", item.path().display(), e);
                    continue;
                }
            };
            let is_file = !item.file_type().is_dir();
            let parent = target.parent().unwrap_or_default();
            let own_read = self.access.permission_for(&target, is_file).map_or(true, |p| p.read);
            if !own_read || !self.access.chain_readable(&parent) {
                continue;
            }
            hits.push(self.entry_for(&target, item.path())?);
        }

        Ok(Listing { cwd, files: hits })
    }

    /// Create a new folder.
    pub fn create(&self, path: &str, name: &str) -> Result<DirectoryEntry> {
        if name.is_empty() || name.contains('/') {
            return Err(FileError::InvalidRequest(format!("Invalid folder name '{}'", name)));
        }
        let (folder, _) = self.resolve_folder(path)?;
        self.access.require(&folder, false, &[PermissionAction::WriteContents])?;

        let target = folder.join(name)?;
        let host = self.resolver.resolve_virtual(&target)?;
        if fs::symlink_metadata(&host).is_ok() {
            return Err(FileError::AlreadyExists(name.to_string()));
        }

        fs::create_dir(&host)?;
        tracing::debug!("Created folder {}", target);
        self.entry_for(&target, &host)
    }

    /// Details for the current folder, one item, or an aggregate of several.
    pub fn details(&self, path: &str, names: &[String]) -> Result<FileDetails> {
        let folder = VirtualPath::parse(path)?;
        let names: Vec<&str> = names.iter().map(String::as_str).filter(|n| !n.is_empty()).collect();

        if names.len() <= 1 {
            let target = match names.first() {
                Some(name) => folder.join(name)?,
                None => folder,
            };
            let host = self.resolver.resolve_virtual(&target)?;
            self.require_readable(&target.parent().unwrap_or_default())?;
            let metadata = fs::metadata(&host).map_err(|_| {
                FileError::NotFound(target.name().unwrap_or(&self.root_name).to_string())
            })?;
            let is_file = !metadata.is_dir();
            self.access.require(&target, is_file, &[PermissionAction::Read])?;

            let size = if is_file { metadata.len() } else { folder_size(&host) };
            return Ok(FileDetails {
                name: target.name().unwrap_or(&self.root_name).to_string(),
                location: self.location_of(&target),
                is_file,
                size: byte_conversion(size),
                created: Some(created_at(&metadata)),
                modified: Some(modified_at(&metadata)),
                multiple_files: false,
            });
        }

        let mut total = 0;
        let mut location: Option<String> = None;
        let mut display = Vec::with_capacity(names.len());
        for name in names {
            let target = folder.join(name)?;
            let host = self.resolver.resolve_virtual(&target)?;
            self.require_readable(&target.parent().unwrap_or_default())?;
            let metadata = fs::metadata(&host).map_err(|_| FileError::NotFound(name.to_string()))?;
            let is_file = !metadata.is_dir();
            self.access.require(&target, is_file, &[PermissionAction::Read])?;

            total += if is_file { metadata.len() } else { folder_size(&host) };
            display.push(target.name().unwrap_or_default().to_string());

            let parent = self.location_of(&target.parent().unwrap_or_default());
            location = match location {
                None => Some(parent),
                Some(seen) if seen == parent => Some(seen),
                Some(_) => Some("Various Folders".to_string()),
            };
        }

        Ok(FileDetails {
            name: display.join(", "),
            location: location.unwrap_or_default(),
            is_file: false,
            size: byte_conversion(total),
            created: None,
            modified: None,
            multiple_files: true,
        })
    }

    fn location_of(&self, target: &VirtualPath) -> String {
        if target.is_root() {
            self.root_name.clone()
        } else {
            format!("{}{}", self.root_name, target)
        }
    }

    /// Delete items one by one. The first failure ends the batch.
    pub fn delete(&self, path: &str, names: &[String]) -> BatchResult {
        let mut result = BatchResult::default();
        for name in names {
            match self.delete_one(path, name) {
                Ok(entry) => result.files.push(entry),
                Err(e) => {
                    tracing::warn!("Delete stopped at '{}': {}", name, e);
                    result.error = Some(e);
                    break;
                }
            }
        }
        result
    }

    fn delete_one(&self, path: &str, name: &str) -> Result<DirectoryEntry> {
        if name.is_empty() {
            return Err(FileError::InvalidRequest("name should not be empty".to_string()));
        }
        let target = VirtualPath::parse(path)?.join(name)?;
        let host = self.resolver.resolve_virtual(&target)?;
        let metadata = fs::symlink_metadata(&host).map_err(|_| FileError::NotFound(name.to_string()))?;
        let is_file = !metadata.is_dir();
        self.access
            .require(&target, is_file, &[PermissionAction::Read, PermissionAction::Write])?;

        let entry = self.entry_for(&target, &host)?;
        let removed = if is_file {
            clear_readonly(&host).and_then(|_| fs::remove_file(&host))
        } else {
            remove_tree(&host)
        };
        removed.map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => FileError::Unauthorized(target.to_string()),
            _ => FileError::Io(e),
        })?;

        tracing::debug!("Deleted {}", target);
        Ok(entry)
    }

    /// Rename an item inside its folder.
    pub fn rename(
        &self,
        path: &str,
        name: &str,
        new_name: &str,
        show_extension: bool,
    ) -> Result<DirectoryEntry> {
        if name.is_empty() || new_name.is_empty() || new_name.contains('/') {
            return Err(FileError::InvalidRequest(format!("Invalid name '{}'", new_name)));
        }
        let folder = VirtualPath::parse(path)?;
        let source = folder.join(name)?;
        let source_host = self.resolver.resolve_virtual(&source)?;
        let metadata = fs::symlink_metadata(&source_host)
            .map_err(|_| FileError::NotFound(name.to_string()))?;
        let is_file = !metadata.is_dir();
        self.access.require(&source, is_file, &[PermissionAction::Write])?;

        let new_name = match Path::new(name).extension() {
            Some(ext) if is_file && !show_extension => {
                format!("{}.{}", new_name, ext.to_string_lossy())
            }
            _ => new_name.to_string(),
        };
        let dest = folder.join(&new_name)?;
        let dest_host = self.resolver.resolve_virtual(&dest)?;

        if name == new_name {
            return self.entry_for(&dest, &dest_host);
        }

        let case_only = name.to_lowercase() == new_name.to_lowercase();
        let parent_host = source_host.parent().unwrap_or(self.root());
        if case_only && !has_exact_child(parent_host, &new_name) {
            let staging = parent_host.join(format!(".{}.{}", name, uuid::Uuid::new_v4().simple()));
            rename_via(&source_host, &staging, &dest_host)?;
        } else {
            if fs::symlink_metadata(&dest_host).is_ok() {
                return Err(FileError::RenameConflict {
                    from: name.to_string(),
                    to: new_name,
                });
            }
            fs::rename(&source_host, &dest_host)?;
        }

        tracing::debug!("Renamed {} to {}", source, dest);
        self.entry_for(&dest, &dest_host)
    }

    /// Image bytes for a thumbnail request, `None` on any failure.
    pub fn get_image(&self, path: &str, id: Option<&str>) -> Option<ImagePayload> {
        let target = VirtualPath::parse(path).ok()?;
        let host = match self.resolver.resolve_virtual(&target) {
            Ok(host) => host,
            Err(e) => {
                tracing::warn!("Image request for '{}' rejected: {}", path, e);
                return None;
            }
        };
        if !host.is_file() {
            return None;
        }
        let parent = target.parent().unwrap_or_default();
        if !self.access.chain_readable(&parent)
            || self.access.require(&target, true, &[PermissionAction::Read]).is_err()
        {
            return None;
        }

        let bytes = fs::read(&host).ok()?;
        let content_type = infer::get(&bytes)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        tracing::debug!("Serving image {} (id {:?}) as {}", target, id, content_type);
        Some(ImagePayload { bytes, content_type })
    }
}

/// Anchored regex equivalent of a `*`/`?` wildcard pattern.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    format!("^{}$", escaped)
}

/// Human-readable size: `0 B`, `512 B`, `1.5 KB`, `2 MB`.
pub fn byte_conversion(size: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    if size == 0 {
        return "0 B".to_string();
    }
    let mut unit = 0;
    let mut value = size as f64;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", rounded, UNITS[unit])
    }
}

fn has_subfolder(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        })
        .unwrap_or(false)
}

/// Two-step rename through `staging`; a failed second step puts `source` back.
fn rename_via(source: &Path, staging: &Path, dest: &Path) -> io::Result<()> {
    fs::rename(source, staging)?;
    if let Err(e) = fs::rename(staging, dest) {
        if let Err(restore) = fs::rename(staging, source) {
            tracing::error!(
                "Could not restore {} from {}: {}",
                source.display(),
                staging.display(),
                restore
            );
        }
        return Err(e);
    }
    Ok(())
}

fn has_exact_child(folder: &Path, name: &str) -> bool {
    fs::read_dir(folder)
        .map(|entries| entries.filter_map(|e| e.ok()).any(|e| e.file_name() == name))
        .unwrap_or(false)
}

/// Total size of every file below `path`.
pub(crate) fn folder_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Remove a folder bottom-up after clearing read-only flags top-down.
pub(crate) fn remove_tree(path: &Path) -> io::Result<()> {
    for entry in WalkDir::new(path) {
        clear_readonly(entry.map_err(io::Error::from)?.path())?;
    }
    for entry in WalkDir::new(path).contents_first(true) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
