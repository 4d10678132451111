//! Exporter sinks for [`harvester_core::NpsPackage`] records.
//!
//! Each sink implements [`harvester_core::Exporter`]; the orchestrator fans
//! records out to all configured sinks and isolates their failures.

mod json;
mod nps;
mod sqlite;

pub use json::JsonExporter;
pub use nps::NpsExporter;
pub use sqlite::SqliteExporter;
