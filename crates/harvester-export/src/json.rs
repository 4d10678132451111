//! Flat JSON sink: every record lands in one directory as
//! `<source_type>_<name>.json`, handy for quick grepping and ad-hoc tooling.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use harvester_core::{Exporter, HarvestError, NpsPackage};

use crate::nps::sanitize_file_name;

pub struct JsonExporter {
    output_dir: PathBuf,
    exported: AtomicUsize,
}

impl JsonExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            exported: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Exporter for JsonExporter {
    fn name(&self) -> &str {
        "json"
    }

    async fn export(&self, package: &NpsPackage) -> Result<(), HarvestError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| {
                HarvestError::Export(format!(
                    "cannot create {}: {e}",
                    self.output_dir.display()
                ))
            })?;

        let file_name = format!(
            "{}_{}.json",
            package.source_type,
            sanitize_file_name(&package.name)
        );
        let path = self.output_dir.join(file_name);
        let text = serde_json::to_string_pretty(package)?;
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| HarvestError::Export(format!("cannot write {}: {e}", path.display())))?;

        self.exported.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), "Wrote JSON record");
        Ok(())
    }

    async fn finalize(&self) -> Result<(), HarvestError> {
        info!(exported = self.exported.load(Ordering::Relaxed), dir = %self.output_dir.display(), "JSON export finished");
        Ok(())
    }
}
