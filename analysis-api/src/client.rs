use crate::error::ApiResult;
use reqwest::Client as HttpClient;
use std::time::Duration;
use url::Url;

/// Default timeout for upload initiation requests
pub const INIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default timeout for a single transfer segment body
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);
/// Default timeout for file-status polls
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Analysis Service client.
///
/// Holds the base URL and a shared connection pool. Credentials are passed
/// per call as the `key` query parameter, never stored on the client.
pub struct Client {
    pub(crate) http: HttpClient,
    pub(crate) base_url: Url,
}

impl Client {
    /// Create a client for the given service base URL.
    pub fn new(base_url: &str) -> ApiResult<Self> {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(20))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
        })
    }

    /// Create a client with a caller-supplied reqwest client.
    pub fn with_http_client(base_url: &str, http: HttpClient) -> ApiResult<Self> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
        })
    }

    /// Build an endpoint URL with the credential attached as `key`.
    pub(crate) fn keyed_endpoint(&self, path: &str, key: &str) -> ApiResult<Url> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut().append_pair("key", key);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_endpoint_appends_credential() {
        let client = Client::new("https://analysis.example.com/").unwrap();
        let url = client
            .keyed_endpoint("v1beta/files/abc", "secret-1")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://analysis.example.com/v1beta/files/abc?key=secret-1"
        );
    }
}
