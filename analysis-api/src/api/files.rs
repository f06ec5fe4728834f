use crate::client::{Client, INIT_TIMEOUT, STATUS_TIMEOUT};
use crate::error::{ApiError, ApiResult};
use crate::models::files::{
    FileHandle, FileStatus, FinalizeResponse, StartUploadFile, StartUploadRequest,
};
use async_trait::async_trait;
use reqwest::Body;
use std::time::Duration;
use url::Url;

const HEADER_PROTOCOL: &str = "X-Goog-Upload-Protocol";
const HEADER_COMMAND: &str = "X-Goog-Upload-Command";
const HEADER_OFFSET: &str = "X-Goog-Upload-Offset";
const HEADER_CONTENT_LENGTH: &str = "X-Goog-Upload-Header-Content-Length";
const HEADER_CONTENT_TYPE: &str = "X-Goog-Upload-Header-Content-Type";
const HEADER_UPLOAD_URL: &str = "X-Goog-Upload-URL";

/// Resumable file-intake API
#[async_trait]
pub trait FilesApi {
    /// Initiate a resumable upload, returning the session's transfer URL.
    async fn start_resumable_upload(
        &self,
        key: &str,
        display_name: &str,
        total_size: u64,
        mime_type: &str,
    ) -> ApiResult<Url>;

    /// Send one transfer segment to the session URL.
    ///
    /// Non-final segments use the `upload` command and return `None`; the
    /// final segment uses `upload, finalize` and returns the durable handle.
    async fn upload_segment(
        &self,
        upload_url: &Url,
        offset: u64,
        content_length: u64,
        body: Body,
        finalize: bool,
        timeout: Duration,
    ) -> ApiResult<Option<FileHandle>>;

    /// Poll processing state for an uploaded file (`files/{id}`).
    async fn get_file_status(&self, key: &str, name: &str) -> ApiResult<FileStatus>;
}

#[async_trait]
impl FilesApi for Client {
    async fn start_resumable_upload(
        &self,
        key: &str,
        display_name: &str,
        total_size: u64,
        mime_type: &str,
    ) -> ApiResult<Url> {
        let url = self.keyed_endpoint("upload", key)?;
        let request = StartUploadRequest {
            file: StartUploadFile {
                display_name: display_name.to_string(),
            },
        };

        let response = self
            .http
            .post(url)
            .timeout(INIT_TIMEOUT)
            .header(HEADER_PROTOCOL, "resumable")
            .header(HEADER_COMMAND, "start")
            .header(HEADER_CONTENT_LENGTH, total_size)
            .header(HEADER_CONTENT_TYPE, mime_type)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        let upload_url = response
            .headers()
            .get(HEADER_UPLOAD_URL)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::MissingUploadUrl(HEADER_UPLOAD_URL))?;

        Ok(Url::parse(upload_url)?)
    }

    async fn upload_segment(
        &self,
        upload_url: &Url,
        offset: u64,
        content_length: u64,
        body: Body,
        finalize: bool,
        timeout: Duration,
    ) -> ApiResult<Option<FileHandle>> {
        let command = if finalize { "upload, finalize" } else { "upload" };

        let response = self
            .http
            .put(upload_url.clone())
            .timeout(timeout)
            .header("Content-Length", content_length)
            .header(HEADER_OFFSET, offset)
            .header(HEADER_COMMAND, command)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        if !finalize {
            return Ok(None);
        }

        let finalized: FinalizeResponse = response.json().await?;
        Ok(Some(finalized.file))
    }

    async fn get_file_status(&self, key: &str, name: &str) -> ApiResult<FileStatus> {
        let url = self.keyed_endpoint(&format!("v1beta/{name}"), key)?;

        let response = self.http.get(url).timeout(STATUS_TIMEOUT).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        Ok(response.json().await?)
    }
}
