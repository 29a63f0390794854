//! Storage backends for run reports
//!
//! Every backend exposes the same [`Backend`] contract so callers never
//! branch on the engine in use. Relational engines share the sqlx `Any`
//! adapter, the document engine has its own adapter, and both keep their
//! live connection inside a [`ConnectionManager`] so credentials can be
//! rotated without restarting.

pub mod connection;
pub mod history;
mod mongo;
mod schema;
mod sql;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use connection::{Connection, ConnectionManager, SwapPolicy};
pub use mongo::{MongoBackend, MongoConnection};
pub use schema::Dialect;
pub use sql::{SqlBackend, SqlConnection};

use crate::error::StoreError;
use crate::model::{
    Environment, EnvironmentFilter, HistoryBucket, Report, ReportId, ReportSummary, RunSummary,
    State,
};

/// Persistence contract shared by all storage engines
#[async_trait]
pub trait Backend: Send + Sync {
    fn driver(&self) -> Driver;

    /// Round trip to the engine, bounded by `deadline`
    async fn ping(&self, deadline: Duration) -> Result<(), StoreError>;

    /// Insert a run. A second insert with the same id fails with
    /// `DuplicateRecord` and leaves the stored row untouched.
    async fn save_run(&self, report: &Report) -> Result<(), StoreError>;

    /// All runs, newest first
    async fn get_runs(&self) -> Result<Vec<RunSummary>, StoreError>;

    /// Runs in any of `states`, newest first. An empty slice matches nothing.
    async fn get_runs_by_state(&self, states: &[State]) -> Result<Vec<RunSummary>, StoreError>;

    /// Every report of one node, newest first
    async fn get_reports(&self, fqdn: &str) -> Result<Vec<ReportSummary>, StoreError>;

    async fn get_report(&self, id: &ReportId) -> Result<Report, StoreError>;

    /// Per-day state counts for the most recent days, newest first
    async fn get_history(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<HistoryBucket>, StoreError>;

    /// Environments that have at least one run, sorted
    async fn get_environments(&self) -> Result<Vec<Environment>, StoreError>;

    /// Delete runs executed strictly before `cutoff`, returning how many
    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Open a connection to `url`, wait until it is reachable and swap it in
    async fn reconnect(&self, url: &str) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Storage engine selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    Sqlite,
    Mysql,
    Mongo,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Mysql => "mysql",
            Self::Mongo => "mongo",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "mongo" | "mongodb" => Ok(Self::Mongo),
            other => Err(StoreError::validation(format!(
                "unknown storage driver '{}'",
                other
            ))),
        }
    }
}

/// Connection settings shared by all drivers
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub swap: SwapPolicy,
    /// Database name used by the document engine
    pub mongo_database: String,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            swap: SwapPolicy::default(),
            mongo_database: "run-summary".to_string(),
        }
    }
}

pub struct BackendFactory;

impl BackendFactory {
    pub async fn connect(
        driver: Driver,
        url: &str,
        options: &BackendOptions,
    ) -> Result<Arc<dyn Backend>, StoreError> {
        info!(driver = %driver, "Connecting storage backend");

        match driver {
            Driver::Sqlite | Driver::Mysql => {
                let dialect = Dialect::from_url(url)?;
                let expected = if driver == Driver::Sqlite {
                    Dialect::Sqlite
                } else {
                    Dialect::Mysql
                };
                if dialect != expected {
                    return Err(StoreError::validation(format!(
                        "driver '{}' does not accept a {} connection URL",
                        driver,
                        dialect.name()
                    )));
                }
                Ok(Arc::new(SqlBackend::connect(url, options).await?))
            }
            Driver::Mongo => Ok(Arc::new(MongoBackend::connect(url, options).await?)),
        }
    }
}
