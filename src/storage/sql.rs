//! Relational backend over the sqlx `Any` driver (SQLite and MySQL)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, QueryBuilder, Row};
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionManager};
use super::history::{self, HistorySource};
use super::schema::{self, Dialect};
use super::{Backend, BackendOptions, Driver};
use crate::error::StoreError;
use crate::model::{
    BlobLocator, Environment, EnvironmentFilter, HistoryBucket, Report, ReportId, ReportSummary,
    ResourceCounts, RunSummary, State,
};

/// Execution times are stored as sortable UTC text so that string ordering
/// and range comparisons match time ordering on every engine.
const EXEC_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const RUN_COLUMNS: &str = "id, fqdn, environment, state, executed_at, runtime_ms";
const REPORT_COLUMNS: &str =
    "id, fqdn, environment, state, executed_at, runtime_ms, total, changed, failed, skipped";
const FULL_COLUMNS: &str = "id, fqdn, environment, state, executed_at, runtime_ms, total, changed, \
     failed, skipped, blob_path";

fn encode_time(ts: DateTime<Utc>) -> String {
    ts.format(EXEC_TIME_FORMAT).to_string()
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(raw, EXEC_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::storage(format!("malformed executed_at '{}': {}", raw, e)))
}

/// Pooled relational connection
pub struct SqlConnection {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlConnection {
    /// Open a pool and establish its first connection immediately
    pub async fn open(url: &str, options: &BackendOptions) -> Result<Self, StoreError> {
        let dialect = Dialect::from_url(url)?;
        sqlx::any::install_default_drivers();

        let pool = Self::pool_options(options)
            .connect(url)
            .await
            .map_err(|e| StoreError::from(e).context("open connection pool"))?;
        Ok(Self { pool, dialect })
    }

    /// Build a pool without connecting. Reachability is checked by pinging.
    pub fn open_lazy(url: &str, options: &BackendOptions) -> Result<Self, StoreError> {
        let dialect = Dialect::from_url(url)?;
        sqlx::any::install_default_drivers();

        let pool = Self::pool_options(options)
            .connect_lazy(url)
            .map_err(|e| StoreError::from(e).context("configure connection pool"))?;
        Ok(Self { pool, dialect })
    }

    fn pool_options(options: &BackendOptions) -> AnyPoolOptions {
        AnyPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

#[async_trait]
impl Connection for SqlConnection {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from(e).context("ping"))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        self.dialect.name()
    }
}

pub struct SqlBackend {
    manager: ConnectionManager<SqlConnection>,
    dialect: Dialect,
    options: BackendOptions,
}

impl SqlBackend {
    pub async fn connect(url: &str, options: &BackendOptions) -> Result<Self, StoreError> {
        let conn = SqlConnection::open(url, options).await?;
        let dialect = conn.dialect;
        schema::init_schema(conn.pool(), dialect).await?;

        info!(
            driver = dialect.name(),
            max_connections = options.max_connections,
            "Relational backend ready"
        );
        Ok(Self {
            manager: ConnectionManager::new(conn, options.swap),
            dialect,
            options: options.clone(),
        })
    }

    fn push_env_filter(qb: &mut QueryBuilder<'_, Any>, filter: &EnvironmentFilter, joiner: &str) {
        if let Some(envs) = filter.environments() {
            qb.push(joiner);
            qb.push(" environment IN (");
            let mut separated = qb.separated(", ");
            for env in envs {
                separated.push_bind(env.as_str().to_string());
            }
            separated.push_unseparated(")");
        }
    }
}

fn run_from_row(row: &AnyRow) -> Result<RunSummary, StoreError> {
    let id: String = row.try_get("id")?;
    let environment: String = row.try_get("environment")?;
    let state: String = row.try_get("state")?;
    let executed_at: String = row.try_get("executed_at")?;
    let runtime_ms: i64 = row.try_get("runtime_ms")?;

    Ok(RunSummary {
        id: ReportId::parse(&id).map_err(|e| StoreError::storage(e.to_string()))?,
        fqdn: row.try_get("fqdn")?,
        environment: decode_column::<Environment>("environment", &environment)?,
        state: decode_column::<State>("state", &state)?,
        exec_time: decode_time(&executed_at)?,
        runtime: Duration::from_millis(runtime_ms.max(0) as u64),
    })
}

fn counts_from_row(row: &AnyRow) -> Result<ResourceCounts, StoreError> {
    let count = |column: &str| -> Result<u32, StoreError> {
        let value: i64 = row.try_get(column)?;
        u32::try_from(value)
            .map_err(|_| StoreError::storage(format!("column {} out of range: {}", column, value)))
    };

    Ok(ResourceCounts {
        total: count("total")?,
        changed: count("changed")?,
        failed: count("failed")?,
        skipped: count("skipped")?,
    })
}

/// Stored enum values that fail to parse indicate corrupted rows
fn decode_column<T>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = StoreError>,
{
    raw.parse::<T>().map_err(|e| {
        StoreError::storage(format!("malformed {} column '{}': {}", column, raw, e))
    })
}

#[async_trait]
impl HistorySource for SqlBackend {
    async fn distinct_dates(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        let conn = self.manager.acquire().await?;
        let mut qb = QueryBuilder::<Any>::new(
            "SELECT DISTINCT SUBSTR(executed_at, 1, 10) AS day FROM reports",
        );
        Self::push_env_filter(&mut qb, filter, " WHERE");

        let rows = qb.build().fetch_all(conn.pool()).await?;
        rows.iter()
            .map(|row| {
                let day: String = row.try_get("day")?;
                NaiveDate::parse_from_str(&day, "%Y-%m-%d")
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
        let mut qb =
            QueryBuilder::<Any>::new("SELECT COUNT(*) AS runs FROM reports WHERE state = ");
        qb.push_bind(state.as_str().to_string());
        qb.push(" AND executed_at >= ");
        qb.push_bind(encode_time(start));
        qb.push(" AND executed_at < ");
        qb.push_bind(encode_time(end));
        Self::push_env_filter(&mut qb, filter, " AND");

        let row = qb.build().fetch_one(conn.pool()).await?;
        let runs: i64 = row.try_get("runs")?;
        Ok(runs.max(0) as u64)
    }
}

#[async_trait]
impl Backend for SqlBackend {
    fn driver(&self) -> Driver {
        match self.dialect {
            Dialect::Sqlite => Driver::Sqlite,
            Dialect::Mysql => Driver::Mysql,
        }
    }

    async fn ping(&self, deadline: Duration) -> Result<(), StoreError> {
        self.manager.ping(deadline).await
    }

    async fn save_run(&self, report: &Report) -> Result<(), StoreError> {
        let conn = self.manager.acquire().await?;
        sqlx::query(
            "INSERT INTO reports (id, fqdn, environment, state, blob_path, executed_at, \
             runtime_ms, total, changed, failed, skipped) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(report.id.as_str().to_string())
        .bind(report.fqdn.clone())
        .bind(report.environment.as_str().to_string())
        .bind(report.state.as_str().to_string())
        .bind(report.blob.as_str().to_string())
        .bind(encode_time(report.exec_time))
        .bind(report.runtime.as_millis() as i64)
        .bind(i64::from(report.counts.total))
        .bind(i64::from(report.counts.changed))
        .bind(i64::from(report.counts.failed))
        .bind(i64::from(report.counts.skipped))
        .execute(conn.pool())
        .await
        .map_err(|e| StoreError::from(e).context(&format!("save run {}", report.id)))?;

        debug!(id = %report.id, fqdn = %report.fqdn, "Run stored");
        Ok(())
    }

    async fn get_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let conn = self.manager.acquire().await?;
        let sql = format!(
            "SELECT {} FROM reports ORDER BY executed_at DESC, id ASC",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(conn.pool()).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn get_runs_by_state(&self, states: &[State]) -> Result<Vec<RunSummary>, StoreError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.manager.acquire().await?;
        let mut qb = QueryBuilder::<Any>::new(format!(
            "SELECT {} FROM reports WHERE state IN (",
            RUN_COLUMNS
        ));
        let mut separated = qb.separated(", ");
        for state in states {
            separated.push_bind(state.as_str().to_string());
        }
        separated.push_unseparated(") ORDER BY executed_at DESC, id ASC");

        let rows = qb.build().fetch_all(conn.pool()).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn get_reports(&self, fqdn: &str) -> Result<Vec<ReportSummary>, StoreError> {
        let conn = self.manager.acquire().await?;
        let sql = format!(
            "SELECT {} FROM reports WHERE fqdn = ? ORDER BY executed_at DESC, id ASC",
            REPORT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(fqdn.to_string())
            .fetch_all(conn.pool())
            .await?;

        rows.iter()
            .map(|row| {
                let run = run_from_row(row)?;
                Ok(ReportSummary {
                    id: run.id,
                    fqdn: run.fqdn,
                    environment: run.environment,
                    state: run.state,
                    exec_time: run.exec_time,
                    runtime: run.runtime,
                    counts: counts_from_row(row)?,
                })
            })
            .collect()
    }

    async fn get_report(&self, id: &ReportId) -> Result<Report, StoreError> {
        let conn = self.manager.acquire().await?;
        let sql = format!("SELECT {} FROM reports WHERE id = ?", FULL_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.as_str().to_string())
            .fetch_optional(conn.pool())
            .await?
            .ok_or_else(|| StoreError::not_found(format!("report {}", id)))?;

        let run = run_from_row(&row)?;
        let blob_path: String = row.try_get("blob_path")?;
        Ok(Report {
            id: run.id,
            fqdn: run.fqdn,
            environment: run.environment,
            state: run.state,
            exec_time: run.exec_time,
            runtime: run.runtime,
            counts: counts_from_row(&row)?,
            blob: BlobLocator::new(blob_path),
        })
    }

    async fn get_history(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<HistoryBucket>, StoreError> {
        history::collect(self, filter).await
    }

    async fn get_environments(&self) -> Result<Vec<Environment>, StoreError> {
        let conn = self.manager.acquire().await?;
        let rows = sqlx::query("SELECT DISTINCT environment FROM reports")
            .fetch_all(conn.pool())
            .await?;

        let mut envs = rows
            .iter()
            .map(|row| {
                let raw: String = row.try_get("environment")?;
                decode_column::<Environment>("environment", &raw)
            })
            .collect::<Result<Vec<_>, _>>()?;
        envs.sort();
        envs.dedup();
        Ok(envs)
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.manager.acquire().await?;
        let result = sqlx::query("DELETE FROM reports WHERE executed_at < ?")
            .bind(encode_time(cutoff))
            .execute(conn.pool())
            .await
            .map_err(|e| StoreError::from(e).context("purge runs"))?;

        let removed = result.rows_affected();
        info!(cutoff = %cutoff, removed, "Purged runs from relational backend");
        Ok(removed)
    }

    async fn reconnect(&self, url: &str) -> Result<(), StoreError> {
        let dialect = Dialect::from_url(url)?;
        if dialect != self.dialect {
            return Err(StoreError::validation(format!(
                "cannot switch from {} to {} while running",
                self.dialect.name(),
                dialect.name()
            )));
        }

        let candidate = SqlConnection::open_lazy(url, &self.options)?;
        self.manager.swap(candidate).await.map_err(|e| {
            warn!(driver = dialect.name(), error = %e, "Reconnect failed");
            e.context("reconnect")
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.manager.close().await
    }
}
