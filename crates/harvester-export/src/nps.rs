//! Canonical NPS file sink: one pretty-printed JSON file per record, laid
//! out as `<output_dir>/<source_type>/<name>.nps.json`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use harvester_core::{Exporter, HarvestError, NpsPackage};

pub struct NpsExporter {
    output_dir: PathBuf,
    exported: AtomicUsize,
}

impl NpsExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            exported: AtomicUsize::new(0),
        }
    }

    pub fn exported_count(&self) -> usize {
        self.exported.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Exporter for NpsExporter {
    fn name(&self) -> &str {
        "nps"
    }

    async fn export(&self, package: &NpsPackage) -> Result<(), HarvestError> {
        let dir = self.output_dir.join(&package.source_type);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| HarvestError::Export(format!("cannot create {}: {e}", dir.display())))?;

        let path = dir.join(format!("{}.nps.json", sanitize_file_name(&package.name)));
        let text = serde_json::to_string_pretty(package)?;
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| HarvestError::Export(format!("cannot write {}: {e}", path.display())))?;

        self.exported.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), "Wrote NPS record");
        Ok(())
    }

    async fn finalize(&self) -> Result<(), HarvestError> {
        info!(exported = self.exported_count(), dir = %self.output_dir.display(), "NPS export finished");
        Ok(())
    }
}

/// Package names come from upstream metadata; keep them out of path tricks.
pub(crate) fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}
