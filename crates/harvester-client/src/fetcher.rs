//! `reqwest`-backed [`Fetcher`] implementation.
//!
//! Maps transport failures to the pipeline's error taxonomy and surfaces
//! every received HTTP response as-is, including its `Retry-After` header,
//! so the orchestrator can drive retries and rate limiting itself.

use std::time::Duration;

use url::Url;

use harvester_core::{FetchResponse, Fetcher, HarvestError};

const DEFAULT_USER_AGENT: &str =
    concat!("package-harvester/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub user_agent: String,
    /// Total per-request deadline.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Attached as a bearer token to GitHub-hosted URLs only.
    pub github_token: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            github_token: None,
        }
    }
}

impl FetcherConfig {
    pub fn with_github_token(mut self, token: Option<String>) -> Self {
        self.github_token = token;
        self
    }
}

/// Shared HTTP client; cheap to clone into concurrent tasks.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    timeout_secs: u64,
    github_token: Option<String>,
}

impl ReqwestFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| HarvestError::Http(format!("client build failed: {e}")))?;
        if config.github_token.is_some() {
            tracing::debug!("GitHub token configured, raising API rate limits");
        }
        Ok(Self {
            client,
            timeout_secs: config.timeout.as_secs(),
            github_token: config.github_token,
        })
    }

    fn map_error(&self, e: reqwest::Error) -> HarvestError {
        if e.is_timeout() {
            HarvestError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            HarvestError::Network(e.to_string())
        } else {
            HarvestError::Http(e.to_string())
        }
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, HarvestError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.github_token
            && is_github_host(url)
        {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = response.text().await.map_err(|e| self.map_error(e))?;
        Ok(FetchResponse {
            status,
            body,
            retry_after,
        })
    }
}

/// The token must never leak to non-GitHub hosts (the AUR, mirrors).
fn is_github_host(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    host == "github.com"
        || host.ends_with(".github.com")
        || host.ends_with(".githubusercontent.com")
}
