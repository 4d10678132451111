use std::future::Future;

use async_trait::async_trait;

use crate::error::HarvestError;
use crate::package::NpsPackage;

/// One HTTP response as seen by the orchestrator.
///
/// Non-success statuses are not errors at this level: the orchestrator
/// inspects the status to drive retry and rate-limit handling.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    /// Server-advertised `Retry-After` seconds, when present on a 429.
    pub retry_after: Option<u64>,
}

impl FetchResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Fetches raw content from a URL.
///
/// Implementations map transport failures (timeout, connection refused) to
/// errors and deliver every received HTTP response, whatever its status.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<FetchResponse, HarvestError>> + Send;
}

/// Output backend for normalized package records.
///
/// The orchestrator holds a list of `Box<dyn Exporter>` and is unaware of
/// concrete sinks; per-record errors are caught by the caller and never
/// abort the task or sibling exporters.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Short sink name for log context (e.g. "nps", "sqlite").
    fn name(&self) -> &str;

    /// Accept one canonical record.
    async fn export(&self, package: &NpsPackage) -> Result<(), HarvestError>;

    /// Flush/close. Called exactly once after all records have been offered.
    async fn finalize(&self) -> Result<(), HarvestError>;
}
