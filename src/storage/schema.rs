//! Relational schema initialization

use sqlx::AnyPool;
use tracing::{debug, info};

use crate::error::StoreError;

/// SQL flavour behind an `AnyPool`, derived from the connection URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        let scheme = url.split(':').next().unwrap_or_default().to_lowercase();
        match scheme.as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            other => Err(StoreError::validation(format!(
                "unsupported relational database scheme '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Mysql => "mysql",
        }
    }

    fn statements(&self) -> &'static [&'static str] {
        match self {
            Self::Sqlite => &[
                r#"
                CREATE TABLE IF NOT EXISTS reports (
                    id VARCHAR(64) NOT NULL PRIMARY KEY,
                    fqdn VARCHAR(255) NOT NULL,
                    environment VARCHAR(16) NOT NULL,
                    state VARCHAR(16) NOT NULL,
                    blob_path VARCHAR(512) NOT NULL,
                    executed_at VARCHAR(19) NOT NULL,
                    runtime_ms BIGINT NOT NULL DEFAULT 0,
                    total BIGINT NOT NULL DEFAULT 0,
                    changed BIGINT NOT NULL DEFAULT 0,
                    failed BIGINT NOT NULL DEFAULT 0,
                    skipped BIGINT NOT NULL DEFAULT 0
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_reports_fqdn ON reports(fqdn)",
                "CREATE INDEX IF NOT EXISTS idx_reports_executed_at ON reports(executed_at)",
                "CREATE INDEX IF NOT EXISTS idx_reports_state ON reports(state)",
            ],
            // MySQL has no CREATE INDEX IF NOT EXISTS, so indexes live in the table definition
            Self::Mysql => &[r#"
                CREATE TABLE IF NOT EXISTS reports (
                    id VARCHAR(64) NOT NULL,
                    fqdn VARCHAR(255) NOT NULL,
                    environment VARCHAR(16) NOT NULL,
                    state VARCHAR(16) NOT NULL,
                    blob_path VARCHAR(512) NOT NULL,
                    executed_at VARCHAR(19) NOT NULL,
                    runtime_ms BIGINT NOT NULL DEFAULT 0,
                    total BIGINT NOT NULL DEFAULT 0,
                    changed BIGINT NOT NULL DEFAULT 0,
                    failed BIGINT NOT NULL DEFAULT 0,
                    skipped BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (id),
                    INDEX idx_reports_fqdn (fqdn),
                    INDEX idx_reports_executed_at (executed_at),
                    INDEX idx_reports_state (state)
                )
                "#],
        }
    }
}

/// Create the reports table and its indexes if they do not exist yet
pub async fn init_schema(pool: &AnyPool, dialect: Dialect) -> Result<(), StoreError> {
    debug!(dialect = dialect.name(), "Initializing database schema");

    for statement in dialect.statements() {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::from(e).context("initialize schema"))?;
    }

    info!(dialect = dialect.name(), "Database schema ready");
    Ok(())
}
