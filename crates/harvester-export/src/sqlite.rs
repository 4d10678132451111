//! SQLite sink: all records in one `packages` table, list and map fields
//! stored as JSON text. `INSERT OR REPLACE` keyed on the record id makes
//! re-harvesting idempotent.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use harvester_core::{Exporter, HarvestError, NpsPackage};

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS packages (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT,
    source_type TEXT NOT NULL,
    description TEXT,
    dependencies TEXT NOT NULL,
    build_dependencies TEXT NOT NULL,
    frameworks TEXT NOT NULL,
    metadata TEXT NOT NULL,
    nps_version TEXT NOT NULL
)";

const UPSERT: &str = "\
INSERT OR REPLACE INTO packages
    (id, name, version, source_type, description,
     dependencies, build_dependencies, frameworks, metadata, nps_version)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

pub struct SqliteExporter {
    pool: SqlitePool,
}

impl SqliteExporter {
    /// Open (creating if needed) the database and ensure the schema exists.
    pub async fn connect(path: &Path) -> Result<Self, HarvestError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| HarvestError::Export(format!("cannot open {}: {e}", path.display())))?;

        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| HarvestError::Export(format!("schema setup failed: {e}")))?;
        info!(path = %path.display(), "SQLite export database ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Exporter for SqliteExporter {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn export(&self, package: &NpsPackage) -> Result<(), HarvestError> {
        sqlx::query(UPSERT)
            .bind(&package.id)
            .bind(&package.name)
            .bind(&package.version)
            .bind(&package.source_type)
            .bind(&package.description)
            .bind(serde_json::to_string(&package.dependencies)?)
            .bind(serde_json::to_string(&package.build_dependencies)?)
            .bind(serde_json::to_string(&package.frameworks)?)
            .bind(serde_json::to_string(&package.metadata)?)
            .bind(&package.nps_version)
            .execute(&self.pool)
            .await
            .map_err(|e| HarvestError::Export(format!("insert failed for {}: {e}", package.id)))?;
        debug!(id = %package.id, "Upserted package row");
        Ok(())
    }

    async fn finalize(&self) -> Result<(), HarvestError> {
        self.pool.close().await;
        info!("SQLite export finished");
        Ok(())
    }
}
