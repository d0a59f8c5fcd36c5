use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use trawl_core::error::AppError;
use trawl_core::models::Source;
use url::Url;

/// Desktop browser identity. Several platforms serve an empty shell or a
/// login wall to anything that looks like a bot.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// HTTP client shared by all platform extractors.
///
/// Maps transport failures and HTTP statuses onto [`AppError`] variants so
/// the scheduler can classify them: 404 is `NotFound`, 401/403 are
/// `Blocked`, 429 is `RateLimited` (honouring `Retry-After`), other
/// non-2xx statuses are `HttpError`.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(20))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    /// Per-request timeout, covering connect through the end of the body.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GETs `url` with extra `headers` and returns the body as text.
    pub async fn get_text(
        &self,
        source: Source,
        url: &Url,
        headers: &[(&str, &str)],
    ) -> Result<String, AppError> {
        let mut request = self.client.get(url.as_str());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        tracing::debug!(%source, %url, "GET");
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        check_status(source, response.status(), retry_after, url)?;

        response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))
    }

    /// Like [`get_text`](Self::get_text), decoding the body as JSON.
    pub async fn get_json(
        &self,
        source: Source,
        url: &Url,
        headers: &[(&str, &str)],
    ) -> Result<Value, AppError> {
        let body = self.get_text(source, url, headers).await?;
        parse_json(&body)
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

/// Parses a JSON body. An HTML login page served in place of JSON is the
/// usual cause of failure here, so the error is `ParseError` (unknown).
pub fn parse_json(body: &str) -> Result<Value, AppError> {
    serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(80).collect();
        AppError::ParseError(format!("Expected JSON ({e}), got: {preview}"))
    })
}

/// Maps a non-success status onto the error taxonomy.
pub fn check_status(
    source: Source,
    status: StatusCode,
    retry_after: Option<Duration>,
    url: &Url,
) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }
    let err = match status {
        StatusCode::NOT_FOUND => AppError::NotFound(format!("{source} returned 404 for {url}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::Blocked(format!(
            "{source} refused access (HTTP {})",
            status.as_u16()
        )),
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimited {
            platform: source,
            retry_after,
        },
        _ => AppError::HttpError(format!("HTTP {} for {url}", status.as_u16())),
    };
    Err(err)
}
