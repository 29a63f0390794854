//! Document backend over MongoDB

use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use mongodb::options::{ClientOptions, FindOptions, IndexOptions, UpdateOptions};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionManager};
use super::history::{self, HistorySource};
use super::{Backend, BackendOptions, Driver};
use crate::error::StoreError;
use crate::model::{
    BlobLocator, Environment, EnvironmentFilter, HistoryBucket, Report, ReportId, ReportSummary,
    ResourceCounts, RunSummary, State,
};

const COLLECTION: &str = "reports";

/// Stored shape of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportDocument {
    id: String,
    fqdn: String,
    environment: String,
    state: String,
    exec_time: bson::DateTime,
    runtime_ms: i64,
    total: i64,
    changed: i64,
    failed: i64,
    skipped: i64,
    blob_path: String,
}

impl ReportDocument {
    fn from_report(report: &Report) -> Self {
        Self {
            id: report.id.as_str().to_string(),
            fqdn: report.fqdn.clone(),
            environment: report.environment.as_str().to_string(),
            state: report.state.as_str().to_string(),
            exec_time: bson::DateTime::from_chrono(report.exec_time),
            runtime_ms: report.runtime.as_millis() as i64,
            total: i64::from(report.counts.total),
            changed: i64::from(report.counts.changed),
            failed: i64::from(report.counts.failed),
            skipped: i64::from(report.counts.skipped),
            blob_path: report.blob.as_str().to_string(),
        }
    }

    fn run_summary(&self) -> Result<RunSummary, StoreError> {
        Ok(RunSummary {
            id: ReportId::parse(&self.id).map_err(|e| StoreError::storage(e.to_string()))?,
            fqdn: self.fqdn.clone(),
            environment: decode_field::<Environment>("environment", &self.environment)?,
            state: decode_field::<State>("state", &self.state)?,
            exec_time: self.exec_time.to_chrono(),
            runtime: Duration::from_millis(self.runtime_ms.max(0) as u64),
        })
    }

    fn counts(&self) -> Result<ResourceCounts, StoreError> {
        let count = |field: &str, value: i64| {
            u32::try_from(value).map_err(|_| {
                StoreError::storage(format!("field {} out of range: {}", field, value))
            })
        };
        Ok(ResourceCounts {
            total: count("total", self.total)?,
            changed: count("changed", self.changed)?,
            failed: count("failed", self.failed)?,
            skipped: count("skipped", self.skipped)?,
        })
    }

    fn report(&self) -> Result<Report, StoreError> {
        let run = self.run_summary()?;
        Ok(Report {
            id: run.id,
            fqdn: run.fqdn,
            environment: run.environment,
            state: run.state,
            exec_time: run.exec_time,
            runtime: run.runtime,
            counts: self.counts()?,
            blob: BlobLocator::new(self.blob_path.clone()),
        })
    }
}

fn decode_field<T>(field: &str, raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = StoreError>,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::storage(format!("malformed {} field '{}': {}", field, raw, e)))
}

fn env_filter(filter: &EnvironmentFilter) -> Document {
    match filter.environments() {
        Some(envs) => {
            let values: Vec<&str> = envs.iter().map(Environment::as_str).collect();
            doc! { "environment": { "$in": values } }
        }
        None => Document::new(),
    }
}

fn newest_first() -> FindOptions {
    FindOptions::builder()
        .sort(doc! { "exec_time": -1, "id": 1 })
        .build()
}

/// Client handle bound to one database
pub struct MongoConnection {
    client: Client,
    database: String,
}

impl MongoConnection {
    /// Build a client. Servers are discovered lazily, so reachability is
    /// only known after the first ping.
    pub async fn open(url: &str, options: &BackendOptions) -> Result<Self, StoreError> {
        let mut client_options = ClientOptions::parse(url)
            .await
            .map_err(|e| StoreError::from(e).context("parse connection string"))?;
        client_options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        client_options.max_pool_size = Some(options.max_connections);
        client_options.server_selection_timeout = Some(options.acquire_timeout);

        let client = Client::with_options(client_options)?;
        Ok(Self {
            client,
            database: options.mongo_database.clone(),
        })
    }

    fn reports(&self) -> Collection<ReportDocument> {
        self.client.database(&self.database).collection(COLLECTION)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "id": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder().keys(doc! { "fqdn": 1 }).build(),
            IndexModel::builder().keys(doc! { "exec_time": -1 }).build(),
            IndexModel::builder().keys(doc! { "state": 1 }).build(),
        ];
        self.reports()
            .create_indexes(indexes, None)
            .await
            .map_err(|e| StoreError::from(e).context("create indexes"))?;
        Ok(())
    }
}

#[async_trait]
impl Connection for MongoConnection {
    async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .database(&self.database)
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from(e).context("ping"))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.client.clone().shutdown().await;
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        "mongo"
    }
}

pub struct MongoBackend {
    manager: ConnectionManager<MongoConnection>,
    options: BackendOptions,
}

impl MongoBackend {
    pub async fn connect(url: &str, options: &BackendOptions) -> Result<Self, StoreError> {
        let conn = MongoConnection::open(url, options).await?;
        conn.ping().await?;
        conn.ensure_indexes().await?;

        info!(database = %options.mongo_database, "Document backend ready");
        Ok(Self {
            manager: ConnectionManager::new(conn, options.swap),
            options: options.clone(),
        })
    }

    async fn find_runs(&self, filter: Document) -> Result<Vec<ReportDocument>, StoreError> {
        let conn = self.manager.acquire().await?;
        let cursor = conn.reports().find(filter, newest_first()).await?;
        Ok(cursor.try_collect().await?)
    }
}

#[async_trait]
impl HistorySource for MongoBackend {
    async fn distinct_dates(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        let conn = self.manager.acquire().await?;
        let pipeline = vec![
            doc! { "$match": env_filter(filter) },
            doc! { "$group": {
                "_id": { "$dateToString": { "format": "%Y-%m-%d", "date": "$exec_time" } }
            }},
        ];

        let groups: Vec<Document> = conn
            .reports()
            .aggregate(pipeline, None)
            .await?
            .try_collect()
            .await?;

        groups
            .iter()
            .map(|group| {
                let day = group.get_str("_id").map_err(|e| {
                    StoreError::storage(format!("malformed history group: {}", e))
                })?;
                NaiveDate::parse_from_str(day, "%Y-%m-%d")
                    .map_err(|e| StoreError::storage(format!("malformed day '{}': {}", day, e)))
            })
            .collect()
    }

    async fn count_state(
        &self,
        state: State,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &EnvironmentFilter,
    ) -> Result<u64, StoreError> {
        let conn = self.manager.acquire().await?;
        let mut query = doc! {
            "state": state.as_str(),
            "exec_time": {
                "$gte": bson::DateTime::from_chrono(start),
                "$lt": bson::DateTime::from_chrono(end),
            },
        };
        for (key, value) in env_filter(filter) {
            query.insert(key, value);
        }

        Ok(conn.reports().count_documents(query, None).await?)
    }
}

#[async_trait]
impl Backend for MongoBackend {
    fn driver(&self) -> Driver {
        Driver::Mongo
    }

    async fn ping(&self, deadline: Duration) -> Result<(), StoreError> {
        self.manager.ping(deadline).await
    }

    async fn save_run(&self, report: &Report) -> Result<(), StoreError> {
        let conn = self.manager.acquire().await?;
        let document = bson::to_document(&ReportDocument::from_report(report))
            .map_err(|e| StoreError::storage(format!("encode run {}: {}", report.id, e)))?;

        // Insert only when absent. The unique index turns a concurrent
        // racing insert into a duplicate key error.
        let result = conn
            .reports()
            .update_one(
                doc! { "id": report.id.as_str() },
                doc! { "$setOnInsert": document },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(|e| StoreError::from(e).context(&format!("save run {}", report.id)))?;

        if result.upserted_id.is_none() {
            return Err(StoreError::duplicate(format!(
                "save run {}: already stored",
                report.id
            )));
        }

        debug!(id = %report.id, fqdn = %report.fqdn, "Run stored");
        Ok(())
    }

    async fn get_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        self.find_runs(Document::new())
            .await?
            .iter()
            .map(ReportDocument::run_summary)
            .collect()
    }

    async fn get_runs_by_state(&self, states: &[State]) -> Result<Vec<RunSummary>, StoreError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<&str> = states.iter().map(State::as_str).collect();
        self.find_runs(doc! { "state": { "$in": values } })
            .await?
            .iter()
            .map(ReportDocument::run_summary)
            .collect()
    }

    async fn get_reports(&self, fqdn: &str) -> Result<Vec<ReportSummary>, StoreError> {
        self.find_runs(doc! { "fqdn": fqdn })
            .await?
            .iter()
            .map(|document| Ok(document.report()?.report_summary()))
            .collect()
    }

    async fn get_report(&self, id: &ReportId) -> Result<Report, StoreError> {
        let conn = self.manager.acquire().await?;
        conn.reports()
            .find_one(doc! { "id": id.as_str() }, None)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("report {}", id)))?
            .report()
    }

    async fn get_history(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<HistoryBucket>, StoreError> {
        history::collect(self, filter).await
    }

    async fn get_environments(&self) -> Result<Vec<Environment>, StoreError> {
        let conn = self.manager.acquire().await?;
        let values = conn
            .reports()
            .distinct("environment", None, None)
            .await?;

        let mut envs = values
            .iter()
            .map(|value| match value {
                Bson::String(raw) => decode_field::<Environment>("environment", raw),
                other => Err(StoreError::storage(format!(
                    "malformed environment field: {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        envs.sort();
        envs.dedup();
        Ok(envs)
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.manager.acquire().await?;
        let result = conn
            .reports()
            .delete_many(
                doc! { "exec_time": { "$lt": bson::DateTime::from_chrono(cutoff) } },
                None,
            )
            .await
            .map_err(|e| StoreError::from(e).context("purge runs"))?;

        info!(
            cutoff = %cutoff,
            removed = result.deleted_count,
            "Purged runs from document backend"
        );
        Ok(result.deleted_count)
    }

    async fn reconnect(&self, url: &str) -> Result<(), StoreError> {
        let candidate = MongoConnection::open(url, &self.options).await?;
        self.manager.swap(candidate).await.map_err(|e| {
            warn!(driver = "mongo", error = %e, "Reconnect failed");
            e.context("reconnect")
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.manager.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_report() -> Report {
        Report::new(
            b"payload",
            "web1",
            Environment::Production,
            State::Failed,
            Utc.with_ymd_and_hms(2024, 2, 17, 2, 0, 9).unwrap(),
            Duration::from_millis(4_250),
            ResourceCounts {
                total: 10,
                changed: 2,
                failed: 1,
                skipped: 0,
            },
        )
    }

    #[test]
    fn test_document_roundtrip_preserves_report() {
        let report = sample_report();
        let document = ReportDocument::from_report(&report);
        assert_eq!(document.environment, "PRODUCTION");
        assert_eq!(document.state, "FAILED");
        assert_eq!(document.report().unwrap(), report);
    }

    #[test]
    fn test_corrupted_document_is_storage_error() {
        let mut document = ReportDocument::from_report(&sample_report());
        document.state = "MELTED".to_string();
        assert!(matches!(document.report(), Err(StoreError::Storage(_))));

        let mut document = ReportDocument::from_report(&sample_report());
        document.total = -1;
        assert!(matches!(document.counts(), Err(StoreError::Storage(_))));
    }

    #[test]
    fn test_env_filter_document() {
        assert!(env_filter(&EnvironmentFilter::All).is_empty());
        let filter = env_filter(&EnvironmentFilter::only([Environment::Staging]));
        let envs = filter
            .get_document("environment")
            .unwrap()
            .get_array("$in")
            .unwrap();
        assert_eq!(envs, &vec![Bson::String("STAGING".to_string())]);
    }
}
