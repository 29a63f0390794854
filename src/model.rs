//! Domain types shared by every backend and blob store.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Deployment environment a node reports from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Environment {
    pub const ALL: [Environment; 3] = [
        Environment::Production,
        Environment::Staging,
        Environment::Development,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "PRODUCTION",
            Self::Staging => "STAGING",
            Self::Development => "DEVELOPMENT",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PRODUCTION" => Ok(Self::Production),
            "STAGING" => Ok(Self::Staging),
            "DEVELOPMENT" => Ok(Self::Development),
            other => Err(StoreError::validation(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

/// Restricts queries to a set of environments. An empty `Only` set behaves
/// like `All`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EnvironmentFilter {
    #[default]
    All,
    Only(Vec<Environment>),
}

impl EnvironmentFilter {
    pub fn only(envs: impl IntoIterator<Item = Environment>) -> Self {
        let mut envs: Vec<Environment> = envs.into_iter().collect();
        envs.sort();
        envs.dedup();
        if envs.is_empty() {
            Self::All
        } else {
            Self::Only(envs)
        }
    }

    /// Environments to restrict to, or `None` when every environment matches
    pub fn environments(&self) -> Option<&[Environment]> {
        match self {
            Self::Only(envs) if !envs.is_empty() => Some(envs),
            _ => None,
        }
    }

    pub fn matches(&self, env: Environment) -> bool {
        self.environments().is_none_or(|envs| envs.contains(&env))
    }
}

/// Outcome of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Changed,
    Unchanged,
    Failed,
    Skipped,
}

impl State {
    pub const ALL: [State; 4] = [
        State::Changed,
        State::Unchanged,
        State::Failed,
        State::Skipped,
    ];

    /// States that get a counter in history buckets
    pub const COUNTED: [State; 3] = [State::Changed, State::Unchanged, State::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Changed => "CHANGED",
            Self::Unchanged => "UNCHANGED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CHANGED" => Ok(Self::Changed),
            "UNCHANGED" => Ok(Self::Unchanged),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(StoreError::validation(format!("unknown state '{}'", other))),
        }
    }
}

/// Content-derived report identifier (lowercase SHA-256 hex of the raw payload)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(String);

impl ReportId {
    pub fn from_payload(raw: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(raw)))
    }

    /// Wrap an identifier received from a caller
    pub fn parse(id: &str) -> Result<Self, StoreError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(StoreError::validation("report id must not be empty"));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relative location of an archived payload inside a blob store.
///
/// Layout is `ENVIRONMENT/fqdn/<RFC3339 timestamp>.yaml`, and the timestamp
/// in the file name is the run's execution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobLocator(String);

pub const BLOB_EXTENSION: &str = ".yaml";

impl BlobLocator {
    pub fn for_run(env: Environment, fqdn: &str, exec_time: DateTime<Utc>) -> Self {
        Self(format!(
            "{}/{}/{}{}",
            env,
            fqdn,
            exec_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            BLOB_EXTENSION
        ))
    }

    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Execution time encoded in the file name of a locator
    pub fn timestamp_of(file_name: &str) -> Result<DateTime<Utc>, StoreError> {
        let stem = file_name.strip_suffix(BLOB_EXTENSION).ok_or_else(|| {
            StoreError::blob(format!(
                "unexpected file '{}': missing {} extension",
                file_name, BLOB_EXTENSION
            ))
        })?;
        DateTime::parse_from_rfc3339(stem)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| {
                StoreError::blob(format!(
                    "unexpected file '{}': not an RFC 3339 timestamp ({})",
                    file_name, e
                ))
            })
    }

    /// Execution time encoded in this locator's last path segment
    pub fn timestamp(&self) -> Result<DateTime<Utc>, StoreError> {
        let name = self.0.rsplit('/').next().unwrap_or(&self.0);
        Self::timestamp_of(name)
    }
}

impl fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource counts of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub total: u32,
    pub changed: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Fully described run as persisted by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub fqdn: String,
    pub environment: Environment,
    pub state: State,
    pub exec_time: DateTime<Utc>,
    pub runtime: Duration,
    pub counts: ResourceCounts,
    pub blob: BlobLocator,
}

impl Report {
    /// Build a report for a raw payload. The id is the payload hash, the
    /// execution time is truncated to whole seconds and the blob locator is
    /// derived from environment, node and time.
    pub fn new(
        raw: &[u8],
        fqdn: impl Into<String>,
        environment: Environment,
        state: State,
        exec_time: DateTime<Utc>,
        runtime: Duration,
        counts: ResourceCounts,
    ) -> Self {
        let fqdn = fqdn.into();
        let exec_time = truncate_to_seconds(exec_time);
        let blob = BlobLocator::for_run(environment, &fqdn, exec_time);
        Self {
            id: ReportId::from_payload(raw),
            fqdn,
            environment,
            state,
            exec_time,
            runtime,
            counts,
            blob,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.id.as_str().is_empty() {
            return Err(StoreError::validation("report id must not be empty"));
        }
        validate_fqdn(&self.fqdn)?;
        if self.blob.as_str().is_empty() {
            return Err(StoreError::validation("blob locator must not be empty"));
        }
        Ok(())
    }

    pub fn run_summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            fqdn: self.fqdn.clone(),
            environment: self.environment,
            state: self.state,
            exec_time: self.exec_time,
            runtime: self.runtime,
        }
    }

    pub fn report_summary(&self) -> ReportSummary {
        ReportSummary {
            id: self.id.clone(),
            fqdn: self.fqdn.clone(),
            environment: self.environment,
            state: self.state,
            exec_time: self.exec_time,
            runtime: self.runtime,
            counts: self.counts,
        }
    }
}

pub fn validate_fqdn(fqdn: &str) -> Result<(), StoreError> {
    if fqdn.trim().is_empty() {
        return Err(StoreError::validation("fqdn must not be empty"));
    }
    if fqdn.contains('/') || fqdn.contains("..") {
        return Err(StoreError::validation(format!(
            "fqdn '{}' contains path separators",
            fqdn
        )));
    }
    Ok(())
}

pub(crate) fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

/// One row per run, as listed on overview pages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: ReportId,
    pub fqdn: String,
    pub environment: Environment,
    pub state: State,
    pub exec_time: DateTime<Utc>,
    pub runtime: Duration,
}

impl RunSummary {
    /// Human readable age relative to `now`, e.g. `2d3h4m5s`
    pub fn time_since(&self, now: DateTime<Utc>) -> String {
        age(self.exec_time, now)
    }
}

fn age(exec_time: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format_duration((now - exec_time).to_std().unwrap_or(Duration::ZERO))
}

/// A node's report, with resource counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub id: ReportId,
    pub fqdn: String,
    pub environment: Environment,
    pub state: State,
    pub exec_time: DateTime<Utc>,
    pub runtime: Duration,
    pub counts: ResourceCounts,
}

impl ReportSummary {
    /// Same rendering as [`RunSummary::time_since`]
    pub fn time_since(&self, now: DateTime<Utc>) -> String {
        age(self.exec_time, now)
    }
}

/// Per-day run counts. Skipped runs are not counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBucket {
    pub date: NaiveDate,
    pub changed: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl HistoryBucket {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            changed: 0,
            unchanged: 0,
            failed: 0,
        }
    }

    pub fn add(&mut self, state: State, count: u64) {
        match state {
            State::Changed => self.changed += count,
            State::Unchanged => self.unchanged += count,
            State::Failed => self.failed += count,
            State::Skipped => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.changed + self.unchanged + self.failed
    }
}

/// Keep the newest run per (fqdn, environment), newest first.
pub fn latest_per_node(runs: Vec<RunSummary>) -> Vec<RunSummary> {
    let mut newest: HashMap<(String, Environment), RunSummary> = HashMap::new();
    for run in runs {
        let key = (run.fqdn.clone(), run.environment);
        match newest.get(&key) {
            Some(current) if current.exec_time >= run.exec_time => {}
            _ => {
                newest.insert(key, run);
            }
        }
    }

    let mut latest: Vec<RunSummary> = newest.into_values().collect();
    latest.sort_by(|a, b| {
        b.exec_time
            .cmp(&a.exec_time)
            .then_with(|| a.fqdn.cmp(&b.fqdn))
    });
    latest
}

/// Format a duration as `1h2m3s`, dropping leading zero units
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, hours, minutes, seconds) = (
        total / 86_400,
        (total % 86_400) / 3_600,
        (total % 3_600) / 60,
        total % 60,
    );

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{}d", days));
    }
    if days > 0 || hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", seconds));
    out
}
