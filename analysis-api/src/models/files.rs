use serde::{Deserialize, Serialize};

/// Durable handle returned by the intake service after a finalized upload.
///
/// `uri` is the reference passed to generation calls; it is scoped to the
/// credential that performed the upload. `name` is the resource path used
/// for status polls (`files/{id}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHandle {
    pub uri: String,
    pub name: String,
}

/// Processing state reported by the file-status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    Processing,
    Active,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Response of `GET /v1beta/{file_name}`
#[derive(Debug, Clone, Deserialize)]
pub struct FileStatus {
    pub state: FileState,
    #[serde(default)]
    pub error: Option<FileStatusError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileStatusError {
    #[serde(default)]
    pub message: String,
}

/// Body of the resumable-upload initiation request
#[derive(Debug, Serialize)]
pub struct StartUploadRequest {
    pub file: StartUploadFile,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadFile {
    pub display_name: String,
}

/// Body of the finalizing transfer response
#[derive(Debug, Deserialize)]
pub struct FinalizeResponse {
    pub file: FileHandle,
}
