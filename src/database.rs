//! Single entry point for callers: validation, per-call timeouts and the
//! ingest workflow on top of whichever backend is configured.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{Instrument, debug, debug_span, error, info, warn};

use crate::blob::BlobStore;
use crate::credentials::Reconnect;
use crate::error::StoreError;
use crate::model::{
    Environment, EnvironmentFilter, HistoryBucket, Report, ReportId, ReportSummary, RunSummary,
    State, latest_per_node, validate_fqdn,
};
use crate::storage::{Backend, BackendFactory, BackendOptions, Driver};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn Backend>,
    query_timeout: Duration,
}

impl Database {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub async fn connect(
        driver: Driver,
        url: &str,
        options: &BackendOptions,
    ) -> Result<Self, StoreError> {
        let backend = BackendFactory::connect(driver, url, options).await?;
        Ok(Self::new(backend))
    }

    pub fn driver(&self) -> Driver {
        self.backend.driver()
    }

    async fn bounded<T, F>(&self, op: &str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let span = debug_span!("storage_call", operation = op, driver = %self.driver());
        async {
            match timeout(self.query_timeout, call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        timeout_ms = self.query_timeout.as_millis() as u64,
                        "Storage call timed out"
                    );
                    Err(StoreError::connection(format!(
                        "{} exceeded {:?}",
                        op, self.query_timeout
                    )))
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn ping(&self, deadline: Duration) -> Result<(), StoreError> {
        self.backend.ping(deadline).await
    }

    pub async fn save_run(&self, report: &Report) -> Result<(), StoreError> {
        report.validate()?;
        self.bounded("save run", self.backend.save_run(report)).await
    }

    pub async fn get_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        self.bounded("get runs", self.backend.get_runs()).await
    }

    /// Newest run per node, optionally restricted to some environments
    pub async fn latest_runs(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<RunSummary>, StoreError> {
        let runs = self.get_runs().await?;
        Ok(latest_per_node(
            runs.into_iter()
                .filter(|run| filter.matches(run.environment))
                .collect(),
        ))
    }

    pub async fn get_runs_by_state(&self, states: &[State]) -> Result<Vec<RunSummary>, StoreError> {
        self.bounded("get runs by state", self.backend.get_runs_by_state(states))
            .await
    }

    pub async fn get_reports(&self, fqdn: &str) -> Result<Vec<ReportSummary>, StoreError> {
        validate_fqdn(fqdn)?;
        self.bounded("get reports", self.backend.get_reports(fqdn))
            .await
    }

    pub async fn get_report(&self, id: &str) -> Result<Report, StoreError> {
        let id = ReportId::parse(id)?;
        self.bounded("get report", self.backend.get_report(&id)).await
    }

    pub async fn get_history(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<HistoryBucket>, StoreError> {
        self.bounded("get history", self.backend.get_history(filter))
            .await
    }

    pub async fn get_environments(&self) -> Result<Vec<Environment>, StoreError> {
        self.bounded("get environments", self.backend.get_environments())
            .await
    }

    pub async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.bounded("purge", self.backend.purge(cutoff)).await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.backend.close().await
    }

    /// Archive the raw payload, then record the run.
    ///
    /// The payload is written first so a stored run always has its blob. A
    /// duplicate submission rewrites identical bytes at the same locator and
    /// then fails with `DuplicateRecord`.
    pub async fn ingest(
        &self,
        raw: &[u8],
        report: &Report,
        blobs: &dyn BlobStore,
    ) -> Result<(), StoreError> {
        let expected = ReportId::from_payload(raw);
        if report.id != expected {
            return Err(StoreError::validation(format!(
                "report id {} does not match payload hash {}",
                report.id, expected
            )));
        }
        report.validate()?;

        blobs
            .save_file(&report.blob, raw)
            .await
            .map_err(|e| e.context("archive payload"))?;

        match self.save_run(report).await {
            Ok(()) => {
                info!(
                    id = %report.id,
                    fqdn = %report.fqdn,
                    environment = %report.environment,
                    state = %report.state,
                    blob = %report.blob,
                    "Report ingested"
                );
                Ok(())
            }
            Err(e @ StoreError::DuplicateRecord(_)) => {
                debug!(id = %report.id, "Report already ingested");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Ping the backend every `interval` until shutdown, logging the outcome
    pub async fn watch_health(
        &self,
        interval: Duration,
        deadline: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if interval.is_zero() {
            debug!("Database health check disabled (interval=0)");
            return;
        }

        info!(
            driver = %self.driver(),
            interval_secs = interval.as_secs(),
            "Starting periodic database health check"
        );

        let mut consecutive_failures: u32 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let started = Instant::now();
                    match self.ping(deadline).await {
                        Ok(()) => {
                            if consecutive_failures > 0 {
                                info!(
                                    driver = %self.driver(),
                                    failures = consecutive_failures,
                                    "Database reachable again"
                                );
                            }
                            consecutive_failures = 0;
                            debug!(
                                driver = %self.driver(),
                                status = "success",
                                response_time_ms = started.elapsed().as_millis() as u64,
                                "Database health check passed"
                            );
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            error!(
                                driver = %self.driver(),
                                status = "failed",
                                error = %e,
                                consecutive_failures,
                                response_time_ms = started.elapsed().as_millis() as u64,
                                "Database health check failed"
                            );
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Database health check shutting down");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Reconnect for Database {
    async fn reconnect(&self, url: &str) -> Result<(), StoreError> {
        self.backend.reconnect(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn sqlite_database(dir: &TempDir) -> Database {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("reports.db").display());
        Database::connect(Driver::Sqlite, &url, &BackendOptions::default())
            .await
            .expect("Failed to open SQLite backend")
    }

    #[tokio::test]
    async fn test_slow_call_becomes_connection_error() {
        let dir = TempDir::new().unwrap();
        let database = sqlite_database(&dir)
            .await
            .with_query_timeout(Duration::from_millis(20));

        let err = database
            .bounded::<(), _>("slow call", std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_watch_health_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let database = sqlite_database(&dir).await;
        let (tx, rx) = watch::channel(false);

        let watcher = database.clone();
        let handle = tokio::spawn(async move {
            watcher
                .watch_health(Duration::from_millis(10), Duration::from_secs(1), rx)
                .await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("health watcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_save_run_rejects_invalid_report() {
        let dir = TempDir::new().unwrap();
        let database = sqlite_database(&dir).await;
        let raw = b"---\nhost: \n";
        let report = Report::new(
            raw,
            "",
            Environment::Development,
            State::Changed,
            Utc::now(),
            Duration::from_secs(1),
            Default::default(),
        );

        assert!(matches!(
            database.save_run(&report).await,
            Err(StoreError::Validation(_))
        ));
        assert!(database.get_runs().await.unwrap().is_empty());
    }
}
