//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability, allowing test assertions on
//! recorded calls.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::HarvestError;
use crate::package::NpsPackage;
use crate::traits::{Exporter, FetchResponse, Fetcher};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Route {
    pattern: String,
    status: u16,
    body: String,
    retry_after: Option<u64>,
    error: Option<String>,
}

/// Mock fetcher that routes by URL substring and records every request.
///
/// The first route whose pattern is contained in the URL wins; unmatched
/// URLs answer 404.
#[derive(Clone, Default)]
pub struct MockFetcher {
    routes: Arc<Mutex<Vec<Route>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer URLs containing `pattern` with the given status and body.
    pub fn route(self, pattern: &str, status: u16, body: &str) -> Self {
        self.routes.lock().unwrap().push(Route {
            pattern: pattern.to_string(),
            status,
            body: body.to_string(),
            retry_after: None,
            error: None,
        });
        self
    }

    /// Answer URLs containing `pattern` with a 429 carrying `Retry-After`.
    pub fn route_rate_limited(self, pattern: &str, retry_after: u64) -> Self {
        self.routes.lock().unwrap().push(Route {
            pattern: pattern.to_string(),
            status: 429,
            body: String::new(),
            retry_after: Some(retry_after),
            error: None,
        });
        self
    }

    /// Answer URLs containing `pattern` with a transport-level failure.
    pub fn route_error(self, pattern: &str, message: &str) -> Self {
        self.routes.lock().unwrap().push(Route {
            pattern: pattern.to_string(),
            status: 0,
            body: String::new(),
            retry_after: None,
            error: Some(message.to_string()),
        });
        self
    }

    /// Every URL requested so far, in order.
    pub fn requested_urls(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, HarvestError> {
        self.requests.lock().unwrap().push(url.to_string());
        let routes = self.routes.lock().unwrap();
        for route in routes.iter() {
            if url.contains(&route.pattern) {
                if let Some(message) = &route.error {
                    return Err(HarvestError::Network(message.clone()));
                }
                return Ok(FetchResponse {
                    status: route.status,
                    body: route.body.clone(),
                    retry_after: route.retry_after,
                });
            }
        }
        Ok(FetchResponse {
            status: 404,
            body: String::new(),
            retry_after: None,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingExporter
// ---------------------------------------------------------------------------

/// Exporter that records every package offered to it.
#[derive(Clone, Default)]
pub struct RecordingExporter {
    pub exported: Arc<Mutex<Vec<NpsPackage>>>,
    pub finalize_calls: Arc<Mutex<u32>>,
}

impl RecordingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exported_ids(&self) -> Vec<String> {
        self.exported
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.id.clone())
            .collect()
    }
}

#[async_trait]
impl Exporter for RecordingExporter {
    fn name(&self) -> &str {
        "recording"
    }

    async fn export(&self, package: &NpsPackage) -> Result<(), HarvestError> {
        self.exported.lock().unwrap().push(package.clone());
        Ok(())
    }

    async fn finalize(&self) -> Result<(), HarvestError> {
        *self.finalize_calls.lock().unwrap() += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FailingExporter
// ---------------------------------------------------------------------------

/// Exporter whose every call fails, for isolation tests.
#[derive(Clone, Copy, Default)]
pub struct FailingExporter;

#[async_trait]
impl Exporter for FailingExporter {
    fn name(&self) -> &str {
        "failing"
    }

    async fn export(&self, _package: &NpsPackage) -> Result<(), HarvestError> {
        Err(HarvestError::Export("sink unavailable".into()))
    }

    async fn finalize(&self) -> Result<(), HarvestError> {
        Err(HarvestError::Export("sink unavailable".into()))
    }
}
