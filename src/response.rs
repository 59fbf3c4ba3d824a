//! Response envelope
//!
//! Every operation ends up as a `FileManagerResponse`; the HTTP layer only
//! serializes it and picks a status code.

use serde::{Deserialize, Serialize};

use crate::operations::{BatchResult, DirectoryEntry, FileDetails, FileError, Listing, Result};
use crate::upload::UploadResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_exists: Option<Vec<String>>,
}

impl ErrorDetails {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            file_exists: None,
        }
    }

    fn with_conflicts(mut self, conflicts: &[String]) -> Self {
        if !conflicts.is_empty() {
            self.file_exists = Some(conflicts.to_vec());
        }
        self
    }
}

impl From<&FileError> for ErrorDetails {
    fn from(err: &FileError) -> Self {
        ErrorDetails::new(err.code(), err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManagerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<DirectoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<DirectoryEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<FileDetails>,
}

impl FileManagerResponse {
    pub fn from_error(err: &FileError) -> Self {
        Self {
            error: Some(err.into()),
            ..Default::default()
        }
    }

    pub fn from_listing(result: Result<Listing>) -> Self {
        match result {
            Ok(listing) => Self {
                cwd: Some(listing.cwd),
                files: Some(listing.files),
                ..Default::default()
            },
            Err(e) => Self::from_error(&e),
        }
    }

    pub fn from_entry(result: Result<DirectoryEntry>) -> Self {
        match result {
            Ok(entry) => Self {
                files: Some(vec![entry]),
                ..Default::default()
            },
            Err(e) => Self::from_error(&e),
        }
    }

    pub fn from_details(result: Result<FileDetails>) -> Self {
        match result {
            Ok(details) => Self {
                details: Some(details),
                ..Default::default()
            },
            Err(e) => Self::from_error(&e),
        }
    }

    /// Finished items always go out; the error slot carries the fatal error
    /// if any, otherwise the accumulated conflicts.
    pub fn from_batch(result: BatchResult) -> Self {
        let error = match &result.error {
            Some(err) => Some(ErrorDetails::from(err).with_conflicts(&result.conflicts)),
            None if !result.conflicts.is_empty() => {
                Some(ErrorDetails::new(400, "File Already Exists").with_conflicts(&result.conflicts))
            }
            None => None,
        };
        Self {
            files: Some(result.files),
            error,
            ..Default::default()
        }
    }

    pub fn from_upload(result: &UploadResult) -> Self {
        let error = if let Some(err) = &result.error {
            Some(ErrorDetails::from(err))
        } else if !result.conflicts.is_empty() {
            Some(ErrorDetails::new(400, "File already exists.").with_conflicts(&result.conflicts))
        } else if !result.missing.is_empty() {
            Some(ErrorDetails::new(404, "File not found."))
        } else {
            None
        };
        Self {
            error,
            ..Default::default()
        }
    }

    /// Status code for the transport, 200 when there is no error.
    pub fn status_code(&self) -> u16 {
        self.error
            .as_ref()
            .and_then(|e| e.code.parse().ok())
            .unwrap_or(200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityError;

    #[test]
    fn test_batch_conflicts_envelope() {
        let result = BatchResult {
            conflicts: vec!["a.txt".to_string()],
            ..Default::default()
        };
        let response = FileManagerResponse::from_batch(result);
        let error = response.error.as_ref().unwrap();
        assert_eq!(error.code, "400");
        assert_eq!(error.message, "File Already Exists");
        assert_eq!(error.file_exists, Some(vec!["a.txt".to_string()]));
        assert_eq!(response.status_code(), 400);
    }

    #[test]
    fn test_missing_keeps_conflicts() {
        let result = BatchResult {
            conflicts: vec!["dup.txt".to_string()],
            missing: vec!["gone.txt".to_string()],
            ..Default::default()
        }
        .finish();
        let response = FileManagerResponse::from_batch(result);
        let error = response.error.unwrap();
        assert_eq!(error.code, "404");
        assert_eq!(error.message, "gone.txt not found in given location.");
        assert_eq!(error.file_exists, Some(vec!["dup.txt".to_string()]));
    }

    #[test]
    fn test_traversal_envelope() {
        let err = FileError::from(SecurityError::PathTraversal("/../x".to_string()));
        let response = FileManagerResponse::from_error(&err);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], "417");
        assert_eq!(json["error"]["message"], "Access denied for Directory-traversal");
        assert!(json.get("cwd").is_none());
    }

    #[test]
    fn test_upload_envelope() {
        let removed = UploadResult {
            missing: vec!["x.txt".to_string()],
            ..Default::default()
        };
        let response = FileManagerResponse::from_upload(&removed);
        assert_eq!(response.error.unwrap().message, "File not found.");

        let clean = FileManagerResponse::from_upload(&UploadResult::default());
        assert_eq!(clean.status_code(), 200);
    }
}
