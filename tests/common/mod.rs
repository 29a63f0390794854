#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use run_summary::storage::{Backend, BackendFactory, BackendOptions, Driver, SwapPolicy};
use run_summary::model::{Environment, Report, ResourceCounts, State};

pub fn sqlite_url(dir: &TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("reports.db").display())
}

pub fn fast_options() -> BackendOptions {
    BackendOptions {
        max_connections: 4,
        acquire_timeout: Duration::from_secs(1),
        swap: SwapPolicy {
            interval: Duration::from_millis(20),
            ceiling: Duration::from_millis(400),
        },
        ..BackendOptions::default()
    }
}

pub async fn sqlite_backend(dir: &TempDir) -> Arc<dyn Backend> {
    BackendFactory::connect(Driver::Sqlite, &sqlite_url(dir), &fast_options())
        .await
        .expect("Failed to open SQLite backend")
}

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
}

/// Payload and report for one run; the payload is unique per argument set
pub fn run_report(
    fqdn: &str,
    env: Environment,
    state: State,
    exec_time: DateTime<Utc>,
) -> (Vec<u8>, Report) {
    let raw = format!(
        "---\nhost: {}\nenvironment: {}\nstatus: {}\ntime: {}\n",
        fqdn,
        env,
        state,
        exec_time.to_rfc3339()
    )
    .into_bytes();
    let counts = ResourceCounts {
        total: 10,
        changed: if state == State::Changed { 2 } else { 0 },
        failed: if state == State::Failed { 1 } else { 0 },
        skipped: 1,
    };
    let report = Report::new(
        &raw,
        fqdn,
        env,
        state,
        exec_time,
        Duration::from_millis(3_500),
        counts,
    );
    (raw, report)
}
