//! Daily run history, computed the same way for every backend.
//!
//! Backends only provide two primitives: the set of calendar days (UTC) that
//! have runs, and a count of runs in a given state inside a half-open time
//! window. Bucketing, ordering and truncation live here.

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};

use crate::error::StoreError;
use crate::model::{EnvironmentFilter, HistoryBucket, State};

/// Number of most recent days reported by history queries
pub const HISTORY_DAYS: usize = 30;

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Distinct UTC calendar days with at least one matching run
    async fn distinct_dates(&self, filter: &EnvironmentFilter)
    -> Result<Vec<NaiveDate>, StoreError>;

    /// Runs in `state` with `start <= exec_time < end`
    async fn count_state(
        &self,
        state: State,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &EnvironmentFilter,
    ) -> Result<u64, StoreError>;
}

/// `[00:00, next day 00:00)` in UTC for `date`
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(NaiveTime::MIN).and_utc();
    let end = date
        .checked_add_days(Days::new(1))
        .map(|next| next.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (start, end)
}

/// Buckets for the most recent days with runs, newest first
pub async fn collect<S>(
    source: &S,
    filter: &EnvironmentFilter,
) -> Result<Vec<HistoryBucket>, StoreError>
where
    S: HistorySource + ?Sized,
{
    let mut dates = source.distinct_dates(filter).await?;
    dates.sort_unstable_by(|a, b| b.cmp(a));
    dates.dedup();
    dates.truncate(HISTORY_DAYS);

    let mut buckets = Vec::with_capacity(dates.len());
    for date in dates {
        let (start, end) = day_bounds(date);
        let mut bucket = HistoryBucket::new(date);
        for state in State::COUNTED {
            let count = source.count_state(state, start, end, filter).await?;
            bucket.add(state, count);
        }
        buckets.push(bucket);
    }
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Environment;
    use chrono::TimeZone;

    struct InMemory {
        runs: Vec<(DateTime<Utc>, State, Environment)>,
    }

    #[async_trait]
    impl HistorySource for InMemory {
        async fn distinct_dates(
            &self,
            filter: &EnvironmentFilter,
        ) -> Result<Vec<NaiveDate>, StoreError> {
            Ok(self
                .runs
                .iter()
                .filter(|(_, _, env)| filter.matches(*env))
                .map(|(ts, _, _)| ts.date_naive())
                .collect())
        }

        async fn count_state(
            &self,
            state: State,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            filter: &EnvironmentFilter,
        ) -> Result<u64, StoreError> {
            Ok(self
                .runs
                .iter()
                .filter(|(ts, s, env)| {
                    *s == state && *ts >= start && *ts < end && filter.matches(*env)
                })
                .count() as u64)
        }
    }

    #[test]
    fn test_day_bounds_half_open() {
        let (start, end) = day_bounds(NaiveDate::from_ymd_opt(2024, 2, 17).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 17, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 18, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_midnight_run_counts_for_new_day() {
        let source = InMemory {
            runs: vec![
                (
                    Utc.with_ymd_and_hms(2024, 2, 17, 23, 59, 59).unwrap(),
                    State::Changed,
                    Environment::Production,
                ),
                (
                    Utc.with_ymd_and_hms(2024, 2, 18, 0, 0, 0).unwrap(),
                    State::Failed,
                    Environment::Production,
                ),
            ],
        };

        let buckets = collect(&source, &EnvironmentFilter::All).await.unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].date, NaiveDate::from_ymd_opt(2024, 2, 18).unwrap());
        assert_eq!(buckets[0].failed, 1);
        assert_eq!(buckets[0].changed, 0);
        assert_eq!(buckets[1].changed, 1);
        assert_eq!(buckets[1].failed, 0);
    }

    #[tokio::test]
    async fn test_truncates_to_recent_days_and_filters() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut runs: Vec<_> = (0..40)
            .map(|day| {
                (
                    base + chrono::Duration::days(day),
                    State::Unchanged,
                    Environment::Production,
                )
            })
            .collect();
        runs.push((base, State::Failed, Environment::Staging));
        let source = InMemory { runs };

        let buckets = collect(&source, &EnvironmentFilter::All).await.unwrap();
        assert_eq!(buckets.len(), HISTORY_DAYS);
        assert_eq!(buckets[0].date, (base + chrono::Duration::days(39)).date_naive());

        let staging = collect(&source, &EnvironmentFilter::only([Environment::Staging]))
            .await
            .unwrap();
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].failed, 1);
        assert_eq!(staging[0].unchanged, 0);
    }
}
