//! HTTP front end
//!
//! Thin axum layer over [`FileManager`]. Every filesystem call runs on the
//! blocking pool; handlers only decode requests and encode envelopes.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;

use crate::archive::DownloadPayload;
use crate::operations::{FileError, FileManager};
use crate::response::FileManagerResponse;
use crate::transfer::TargetHint;
use crate::upload::{IncomingFile, UploadAction};

/// Treat an explicit JSON `null` like a missing field.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Body of a `FileOperations` call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileOperationRequest {
    #[serde(deserialize_with = "null_default")]
    pub action: String,
    #[serde(deserialize_with = "null_default")]
    pub path: String,
    pub target_path: Option<String>,
    #[serde(deserialize_with = "null_default", alias = "itemNames")]
    pub names: Vec<String>,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default", alias = "itemNewName")]
    pub new_name: String,
    #[serde(deserialize_with = "null_default")]
    pub show_hidden_items: bool,
    #[serde(deserialize_with = "null_default")]
    pub case_sensitive: bool,
    #[serde(deserialize_with = "null_default")]
    pub search_string: String,
    #[serde(deserialize_with = "null_default")]
    pub rename_files: Vec<String>,
    /// Selected items as the client sees them.
    #[serde(deserialize_with = "null_default")]
    pub data: Vec<TargetHint>,
    pub target_data: Option<TargetHint>,
    pub show_file_extension: Option<bool>,
}

impl FileOperationRequest {
    /// Item names, falling back to the names carried in `data`.
    pub fn item_names(&self) -> Vec<String> {
        if !self.names.is_empty() {
            return self.names.clone();
        }
        self.data
            .iter()
            .filter(|item| !item.name.is_empty())
            .map(|item| item.name.clone())
            .collect()
    }

    fn targets_root(&self) -> bool {
        self.target_path.is_none() && self.path.is_empty()
    }
}

/// Run one file operation against the provider.
pub fn dispatch(manager: &FileManager, request: &FileOperationRequest) -> FileManagerResponse {
    let action = request.action.to_ascii_lowercase();

    if matches!(action.as_str(), "delete" | "remove" | "rename") && request.targets_root() {
        tracing::warn!("Rejected {} on the root folder", action);
        return FileManagerResponse::from_error(&FileError::RootModification);
    }

    tracing::debug!("{} {}", action, request.path);
    let names = request.item_names();
    let target_path = request.target_path.as_deref().unwrap_or_default();

    match action.as_str() {
        "read" => FileManagerResponse::from_listing(
            manager.list(&request.path, request.show_hidden_items),
        ),
        "create" | "createfolder" => {
            FileManagerResponse::from_entry(manager.create(&request.path, &request.name))
        }
        "details" | "getdetails" => {
            FileManagerResponse::from_details(manager.details(&request.path, &names))
        }
        "delete" | "remove" => FileManagerResponse::from_batch(manager.delete(&request.path, &names)),
        "rename" => FileManagerResponse::from_entry(manager.rename(
            &request.path,
            &request.name,
            &request.new_name,
            request.show_file_extension.unwrap_or(true),
        )),
        "copy" => FileManagerResponse::from_batch(manager.copy(
            &request.path,
            target_path,
            &names,
            &request.rename_files,
            request.target_data.as_ref(),
        )),
        "move" => FileManagerResponse::from_batch(manager.move_items(
            &request.path,
            target_path,
            &names,
            &request.rename_files,
            request.target_data.as_ref(),
        )),
        "search" => FileManagerResponse::from_listing(manager.search(
            &request.path,
            &request.search_string,
            request.show_hidden_items,
            request.case_sensitive,
        )),
        other => FileManagerResponse::from_error(&FileError::InvalidRequest(format!(
            "Unknown action '{}'",
            other
        ))),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Shared state for HTTP server
struct AppState {
    manager: Arc<FileManager>,
}

/// Move a provider call onto the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, FileError>
where
    F: FnOnce() -> Result<T, FileError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FileError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

/// Envelope with the HTTP status taken from its error code.
fn with_status(response: FileManagerResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response)).into_response()
}

fn error_response(err: &FileError) -> Response {
    with_status(FileManagerResponse::from_error(err))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Errors travel inside the envelope; the client reads them from the body.
async fn file_operations(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FileOperationRequest>,
) -> Response {
    let manager = state.manager.clone();
    let response = run_blocking(move || Ok(dispatch(&manager, &request)))
        .await
        .unwrap_or_else(|e| FileManagerResponse::from_error(&e));
    Json(response).into_response()
}

async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut path = String::new();
    let mut action = String::new();
    let mut size = None;
    let mut chunk_index = None;
    let mut files = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_response(&FileError::InvalidRequest(e.to_string())),
        };
        let field_name = field.name().unwrap_or_default().to_string();

        if field_name == "uploadFiles" {
            let name = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().unwrap_or_default().to_string();
            match field.bytes().await {
                Ok(data) => files.push(IncomingFile {
                    name,
                    content_type,
                    data: data.to_vec(),
                    chunk_index: None,
                }),
                Err(e) => return error_response(&FileError::InvalidRequest(e.to_string())),
            }
            continue;
        }

        let value = match field.text().await {
            Ok(value) => value,
            Err(e) => return error_response(&FileError::InvalidRequest(e.to_string())),
        };
        match field_name.as_str() {
            "path" => path = value,
            "action" => action = value,
            "size" => size = value.trim().parse::<u64>().ok(),
            "chunk-index" => chunk_index = value.trim().parse::<u32>().ok(),
            _ => {}
        }
    }

    let action = match action.parse::<UploadAction>() {
        Ok(action) => action,
        Err(e) => return error_response(&e),
    };
    for file in &mut files {
        file.chunk_index = chunk_index;
    }
    tracing::debug!("upload {:?} of {} part(s) to {}", action, files.len(), path);

    let manager = state.manager.clone();
    match run_blocking(move || Ok(manager.upload(&path, &files, action, size))).await {
        Ok(result) => with_status(FileManagerResponse::from_upload(&result)),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct DownloadForm {
    #[serde(rename = "downloadInput")]
    download_input: String,
}

async fn download(State(state): State<Arc<AppState>>, Form(form): Form<DownloadForm>) -> Response {
    let request: FileOperationRequest = match serde_json::from_str(&form.download_input) {
        Ok(request) => request,
        Err(e) => return error_response(&FileError::InvalidRequest(e.to_string())),
    };

    let manager = state.manager.clone();
    let result = run_blocking(move || {
        let payload = manager.download(&request.path, &request.item_names())?;
        let file = payload.open()?;
        Ok((payload, file))
    })
    .await;

    match result.and_then(|(payload, file)| download_response(payload, file).map_err(FileError::from)) {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

/// Open download body. Holds the payload so a temporary archive outlives the stream.
struct DownloadReader {
    file: tokio::fs::File,
    _payload: DownloadPayload,
}

impl AsyncRead for DownloadReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

/// Attachment response streaming `file`, the opened body of `payload`.
fn download_response(payload: DownloadPayload, file: std::fs::File) -> io::Result<Response> {
    let length = file.metadata()?.len();
    let disposition = format!("attachment; filename=\"{}\"", payload.file_name.replace('"', ""));
    let reader = DownloadReader {
        file: tokio::fs::File::from_std(file),
        _payload: payload,
    };

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
    #[serde(default)]
    path: String,
    id: Option<String>,
}

async fn get_image(State(state): State<Arc<AppState>>, Query(query): Query<ImageQuery>) -> Response {
    let manager = state.manager.clone();
    let image = run_blocking(move || Ok(manager.get_image(&query.path, query.id.as_deref()))).await;
    match image {
        Ok(Some(image)) => ([(header::CONTENT_TYPE, image.content_type)], image.bytes).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Create the HTTP router
pub fn create_router(manager: Arc<FileManager>, max_body: usize) -> Router {
    let state = Arc::new(AppState { manager });

    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/api/FileManager/FileOperations", post(file_operations))
        .route("/api/FileManager/Upload", post(upload))
        .route("/api/FileManager/Download", post(download))
        .route("/api/FileManager/GetImage", get(get_image))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn request(body: serde_json::Value) -> FileOperationRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_request_accepts_nulls_and_aliases() {
        let req = request(json!({
            "action": "Remove",
            "path": null,
            "targetPath": null,
            "itemNames": ["a.txt"],
            "showHiddenItems": null,
            "itemNewName": "b.txt"
        }));
        assert_eq!(req.path, "");
        assert!(req.target_path.is_none());
        assert_eq!(req.names, vec!["a.txt".to_string()]);
        assert_eq!(req.new_name, "b.txt");
        assert!(!req.show_hidden_items);
        assert!(req.show_file_extension.is_none());
    }

    #[test]
    fn test_root_guard() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.txt"), "a").unwrap();
        let manager = FileManager::new(temp.path()).unwrap();

        for action in ["delete", "Remove", "rename"] {
            let response = dispatch(
                &manager,
                &request(json!({"action": action, "path": "", "names": ["a.txt"], "name": "a.txt", "newName": "b.txt"})),
            );
            let error = response.error.unwrap();
            assert_eq!(error.code, "401");
            assert_eq!(error.message, "Restricted to modify the root folder.");
        }
        assert!(temp.path().join("a.txt").exists());

        // an explicit "/" is not the root guard's business
        let response = dispatch(
            &manager,
            &request(json!({"action": "delete", "path": "/", "names": ["a.txt"]})),
        );
        assert!(response.error.is_none());
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn test_dispatch_create_and_read() {
        let temp = tempdir().unwrap();
        let manager = FileManager::new(temp.path()).unwrap();

        let created = dispatch(
            &manager,
            &request(json!({"action": "create", "path": "/", "name": "Docs"})),
        );
        assert!(created.error.is_none());
        assert_eq!(created.files.unwrap()[0].name, "Docs");

        let listing = dispatch(&manager, &request(json!({"action": "read", "path": "/"})));
        assert_eq!(listing.cwd.unwrap().name, manager.root_name());
        let files = listing.files.unwrap();
        assert_eq!(files.len(), 1);
        assert!(!files[0].is_file);
    }

    #[test]
    fn test_dispatch_copy_reports_conflicts() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.txt"), "a").unwrap();
        let manager = FileManager::new(temp.path()).unwrap();

        let response = dispatch(
            &manager,
            &request(json!({"action": "copy", "path": "/", "targetPath": "/", "names": ["a.txt"]})),
        );
        let error = response.error.as_ref().unwrap();
        assert_eq!(error.code, "400");
        assert_eq!(error.file_exists, Some(vec!["a.txt".to_string()]));

        let response = dispatch(
            &manager,
            &request(json!({
                "action": "copy", "path": "/", "targetPath": "/",
                "names": ["a.txt"], "renameFiles": ["a.txt"]
            })),
        );
        assert!(response.error.is_none());
        assert!(temp.path().join("a(1).txt").exists());
    }

    #[test]
    fn test_names_fall_back_to_data() {
        let req = request(json!({
            "action": "details",
            "path": "/",
            "data": [{"name": "a.txt", "filterPath": "/"}, {"name": "b.txt"}]
        }));
        assert_eq!(req.item_names(), vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_download_streams_and_keeps_archive_alive() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.txt"), "a").unwrap();
        fs::write(temp.path().join("b.txt"), "b").unwrap();
        let manager = FileManager::new(temp.path()).unwrap();

        let payload = manager
            .download("/", &["a.txt".to_string(), "b.txt".to_string()])
            .unwrap();
        let archive_path = match &payload.content {
            crate::archive::DownloadContent::Archive(file) => file.path().to_path_buf(),
            crate::archive::DownloadContent::File(_) => panic!("expected an archive"),
        };
        let file = payload.open().unwrap();
        let response = download_response(payload, file).unwrap();
        assert!(archive_path.exists());
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"files.zip\""
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 2);
        assert!(!archive_path.exists());
    }

    #[test]
    fn test_unknown_action() {
        let temp = tempdir().unwrap();
        let manager = FileManager::new(temp.path()).unwrap();
        let response = dispatch(&manager, &request(json!({"action": "explode", "path": "/"})));
        assert_eq!(response.status_code(), 400);
    }
}
