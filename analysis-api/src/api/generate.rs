use crate::client::Client;
use crate::error::{ApiError, ApiResult};
use crate::models::generate::{GenerateRequest, WireGenerateRequest, WireGenerateResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Content-generation API
#[async_trait]
pub trait GenerateApi {
    /// Run one generation call against an uploaded file.
    ///
    /// Returns the raw candidate text; callers own JSON parsing because the
    /// service occasionally wraps or truncates its output.
    async fn generate_content(
        &self,
        key: &str,
        model_id: &str,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> ApiResult<String>;
}

#[async_trait]
impl GenerateApi for Client {
    async fn generate_content(
        &self,
        key: &str,
        model_id: &str,
        request: &GenerateRequest,
        timeout: Duration,
    ) -> ApiResult<String> {
        let url = self.keyed_endpoint(&format!("v1beta/models/{model_id}:generateContent"), key)?;
        let wire = WireGenerateRequest::from_request(request);

        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(&wire)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }

        let parsed: WireGenerateResponse = response.json().await?;
        parsed.first_text().ok_or(ApiError::EmptyCandidates)
    }
}
