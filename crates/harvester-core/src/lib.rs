//! Core harvesting pipeline: orchestration, resilience, checkpointing, and
//! the canonical package record.
//!
//! The crate is transport-agnostic. Callers inject a [`Fetcher`] for network
//! access and any number of [`Exporter`] sinks, then drive a [`Harvester`]
//! to completion.

pub mod checkpoint;
pub mod error;
pub mod harvester;
pub mod package;
pub mod resilience;
pub mod stats;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use checkpoint::{CheckpointStore, HarvestCheckpoint, HarvestTask, TaskRecord, TaskStatus};
pub use error::HarvestError;
pub use harvester::{DiscoveredRepo, HarvestReport, Harvester, HarvesterConfig};
pub use package::{NPS_VERSION, NpsPackage};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, ExponentialBackoff};
pub use stats::{HarvestStats, StatsSnapshot};
pub use traits::{Exporter, FetchResponse, Fetcher};
