//! fileman - sandboxed file manager backend
//!
//! Virtual paths rooted at one host folder, rule-based access control and
//! the operations a file-manager widget needs.

pub mod access;
pub mod archive;
pub mod config;
pub mod naming;
pub mod operations;
pub mod platform;
pub mod response;
pub mod security;
pub mod server;
pub mod transfer;
pub mod upload;

pub use access::{AccessDetails, AccessPermission, AccessRule, Permission, PermissionEngine};
pub use archive::{DownloadContent, DownloadPayload};
pub use config::Config;
pub use operations::{BatchResult, DirectoryEntry, ErrorKind, FileError, FileManager};
pub use response::{ErrorDetails, FileManagerResponse};
pub use security::{PathResolver, SecurityError, VirtualPath};
pub use transfer::{TargetHint, TransferMode};
pub use upload::{IncomingFile, UploadAction, UploadResult};
