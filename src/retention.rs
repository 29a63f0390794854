//! Time-based retention across the record store and the blob archive

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Local, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::database::Database;
use crate::error::StoreError;

/// How much history to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Never purge
    Disabled,
    /// Keep runs from the last N local days, counting today
    KeepDays(u32),
    /// Remove everything up to the end of today
    PurgeAll,
}

impl RetentionPolicy {
    /// `0` disables retention, a negative value purges everything
    pub fn from_days(days: i64) -> Self {
        match days {
            0 => Self::Disabled,
            d if d < 0 => Self::PurgeAll,
            d => Self::KeepDays(u32::try_from(d).unwrap_or(u32::MAX)),
        }
    }

    /// Purge boundary for `now`, at local midnight in `now`'s time zone.
    /// Records strictly older than the boundary are removed.
    pub fn cutoff_for<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
        let today = now.date_naive();
        let boundary = match self {
            Self::Disabled => return None,
            Self::KeepDays(days) => today
                .checked_sub_days(Days::new(u64::from(*days)))
                .unwrap_or(NaiveDate::MIN),
            Self::PurgeAll => today
                .checked_add_days(Days::new(1))
                .unwrap_or(NaiveDate::MAX),
        };
        Some(local_midnight(&now.timezone(), boundary))
    }
}

fn local_midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
        // Midnight skipped by a DST jump, read the wall clock as UTC offset-free
        LocalResult::None => tz.from_utc_datetime(&naive).with_timezone(&Utc),
    }
}

/// Time until the next `hour:00` local wall clock strictly after `now`
pub fn until_next_run<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> Duration {
    let tz = now.timezone();
    let hour = hour.min(23);
    let today = now.date_naive();

    let candidates = [
        Some(today),
        today.checked_add_days(Days::new(1)),
        today.checked_add_days(Days::new(2)),
    ];
    for date in candidates.into_iter().flatten() {
        let Some(naive) = date.and_hms_opt(hour, 0, 0) else {
            continue;
        };
        let next = match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t,
            LocalResult::None => continue,
        };
        if next > *now {
            return (next.with_timezone(&Utc) - now.with_timezone(&Utc))
                .to_std()
                .unwrap_or(Duration::ZERO);
        }
    }
    Duration::from_secs(24 * 3600 - u64::from(now.num_seconds_from_midnight()))
}

/// What a purge removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub cutoff: DateTime<Utc>,
    pub records: u64,
    pub blobs: u64,
}

/// Applies one cutoff to records first, then archived payloads
pub struct RetentionCoordinator {
    database: Database,
    blobs: Arc<dyn BlobStore>,
}

impl RetentionCoordinator {
    pub fn new(database: Database, blobs: Arc<dyn BlobStore>) -> Self {
        Self { database, blobs }
    }

    /// Purge relative to the current local time. Returns `None` when the
    /// policy is disabled.
    pub async fn purge(&self, policy: RetentionPolicy) -> Result<Option<PurgeOutcome>, StoreError> {
        self.purge_at(policy, &Local::now()).await
    }

    /// Records are purged before blobs and the first failure stops the
    /// purge, so a surviving record always keeps its payload. A failed blob
    /// purge can leave orphaned payloads until the next run.
    pub async fn purge_at<Tz: TimeZone>(
        &self,
        policy: RetentionPolicy,
        now: &DateTime<Tz>,
    ) -> Result<Option<PurgeOutcome>, StoreError> {
        let Some(cutoff) = policy.cutoff_for(now) else {
            warn!("Retention is disabled (days=0), nothing purged");
            return Ok(None);
        };

        info!(
            cutoff = %cutoff,
            policy = ?policy,
            blob_store = self.blobs.name(),
            "Starting retention purge"
        );

        let records = self.database.purge(cutoff).await.map_err(|e| {
            error!(cutoff = %cutoff, error = %e, "Record purge failed, skipping blob purge");
            e.context("purge records")
        })?;

        let blobs = self.blobs.purge(cutoff).await.map_err(|e| {
            error!(cutoff = %cutoff, records, error = %e, "Blob purge failed");
            e.context("purge blobs")
        })?;

        info!(cutoff = %cutoff, records, blobs, "Retention purge completed");
        Ok(Some(PurgeOutcome {
            cutoff,
            records,
            blobs,
        }))
    }

    /// Purge once a day at `hour` local time until shutdown
    pub async fn run(
        &self,
        policy: RetentionPolicy,
        hour: u32,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if policy == RetentionPolicy::Disabled {
            info!("Retention disabled, scheduled purge not started");
            return;
        }

        info!(policy = ?policy, hour, "Scheduled retention purge started");
        loop {
            let wait = until_next_run(&Local::now(), hour);
            debug!(wait_secs = wait.as_secs(), "Waiting for next retention purge");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.purge(policy).await {
                        error!(error = %e, "Scheduled retention purge failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Retention scheduler shutting down");
                    break;
                }
            }
        }
    }
}
