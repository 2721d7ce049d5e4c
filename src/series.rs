//! Time-range queries over stored block metrics, downsampled for charting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::extract::round_to;
use crate::models::{ChartPoint, ChartSeries, TimeRange};
use crate::storage::{self, DbPool};

pub const DEFAULT_MAX_POINTS: usize = 700;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum AggregationError {
    #[error("metrics store unavailable")]
    StoreUnavailable(#[source] anyhow::Error),
}

#[derive(Clone)]
pub struct SeriesAggregator {
    pool: DbPool,
    max_points: usize,
}

impl SeriesAggregator {
    pub fn new(pool: DbPool, max_points: usize) -> Self {
        Self { pool, max_points }
    }

    pub async fn query(&self, range: TimeRange) -> Result<ChartSeries, AggregationError> {
        self.query_at(range, Utc::now()).await
    }

    pub async fn query_at(
        &self,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<ChartSeries, AggregationError> {
        let cutoff = now - range.window();
        let points = storage::get_chart_points_since(&self.pool, cutoff)
            .await
            .map_err(AggregationError::StoreUnavailable)?;
        let fetched = points.len();
        let points = downsample(points, self.max_points);
        debug!(
            "series {}: {} rows fetched, {} kept",
            range,
            fetched,
            points.len()
        );

        Ok(ChartSeries {
            range,
            percent_change: percentage_change(&points),
            points,
        })
    }
}

/// Reduces `points` (oldest first) to at most `max_points`, always keeping the
/// newest entry. The older entries are sampled at a fixed stride starting from
/// the first one. A `max_points` below 2 leaves only the newest entry.
pub fn downsample<T>(mut points: Vec<T>, max_points: usize) -> Vec<T> {
    if points.len() <= max_points {
        return points;
    }
    let Some(last) = points.pop() else {
        return points;
    };
    if max_points < 2 {
        return vec![last];
    }

    let skip = points.len().div_ceil(max_points - 1);
    let mut sampled: Vec<T> = points
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % skip == 0)
        .map(|(_, p)| p)
        .collect();
    sampled.push(last);
    sampled
}

/// Change from the first to the last price in percent, two decimals. Zero for fewer
/// than two points or a zero starting price.
pub fn percentage_change(points: &[ChartPoint]) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return 0.0;
    };
    if points.len() < 2 || first.price == 0.0 {
        return 0.0;
    }
    round_to((last.price - first.price) / first.price * 100.0, 2)
}

/// Re-runs the series query every `interval` and publishes the result.
///
/// A range change abandons the in-flight query and starts over with the new range.
/// Store failures keep the previously published series and back off exponentially.
/// Returns once either channel's other side is gone.
pub async fn run_series_refresh(
    aggregator: SeriesAggregator,
    mut range_rx: watch::Receiver<TimeRange>,
    series_tx: watch::Sender<Option<ChartSeries>>,
    interval: Duration,
) {
    let mut failures: u32 = 0;

    loop {
        let range = *range_rx.borrow_and_update();

        tokio::select! {
            result = aggregator.query(range) => match result {
                Ok(series) => {
                    failures = 0;
                    if series_tx.send(Some(series)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!("series refresh for {} failed ({} in a row): {:#}", range, failures, err);
                }
            },
            changed = range_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                debug!("time range changed, abandoning {} query", range);
                continue;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_delay(interval, failures)) => {}
            changed = range_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = series_tx.closed() => return,
        }
    }
}

/// A [`run_series_refresh`] task running in the background, plus its latest result.
/// The task stops once every clone is dropped.
#[derive(Clone)]
pub struct LiveSeries {
    range: Arc<watch::Sender<TimeRange>>,
    series: watch::Receiver<Option<ChartSeries>>,
}

impl LiveSeries {
    pub fn spawn(aggregator: SeriesAggregator, range: TimeRange, interval: Duration) -> Self {
        let (range_tx, range_rx) = watch::channel(range);
        let (series_tx, series_rx) = watch::channel(None);
        tokio::spawn(run_series_refresh(aggregator, range_rx, series_tx, interval));
        Self {
            range: Arc::new(range_tx),
            series: series_rx,
        }
    }

    pub fn range(&self) -> TimeRange {
        *self.range.borrow()
    }

    /// Switches the refresh to `range`. Does nothing if it already follows it.
    pub fn follow(&self, range: TimeRange) {
        self.range.send_if_modified(|current| {
            let changed = *current != range;
            *current = range;
            changed
        });
    }

    /// The last published series, if there is one for `range`.
    pub fn published(&self, range: TimeRange) -> Option<ChartSeries> {
        self.series
            .borrow()
            .as_ref()
            .filter(|series| series.range == range)
            .cloned()
    }
}

fn retry_delay(interval: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 2u32.saturating_pow(failures.min(16));
    interval.saturating_mul(factor).min(MAX_RETRY_DELAY.max(interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::block_metrics;
    use crate::models::RawBlock;
    use crate::storage::test_support::temp_db_url;
    use chrono::TimeZone;

    fn point(i: usize, price: f64) -> ChartPoint {
        ChartPoint {
            time: Utc.timestamp_opt(1_700_000_000 + i as i64 * 12, 0).unwrap(),
            price,
            network_load: 50.0,
            transactions: 100,
            value_transferred: 1.0,
            block_number: i as u64,
        }
    }

    #[test]
    fn short_series_is_unchanged() {
        let input: Vec<usize> = (0..700).collect();
        assert_eq!(downsample(input.clone(), 700), input);
    }

    #[test]
    fn long_series_keeps_last_and_samples_on_stride() {
        // 1400 older entries over 699 slots: skip = ceil(1400 / 699) = 3.
        let out = downsample((0..1401).collect::<Vec<usize>>(), 700);
        assert!(out.len() <= 700);
        assert_eq!(*out.last().unwrap(), 1400);
        let (kept, _) = out.split_at(out.len() - 1);
        assert!(kept.iter().all(|i| i % 3 == 0));
        assert_eq!(kept.first(), Some(&0));
        assert_eq!(kept.len(), 467);

        // 1398 older entries: skip = 2, exactly filling the budget.
        let out = downsample((0..1399).collect::<Vec<usize>>(), 700);
        assert_eq!(out.len(), 700);
        assert_eq!(*out.last().unwrap(), 1398);
        assert!(out[..699].iter().all(|i| i % 2 == 0));
    }

    #[test]
    fn stride_rounds_up() {
        // 1000 older entries over 699 slots: skip = 2.
        let out = downsample((0..1001).collect::<Vec<usize>>(), 700);
        assert_eq!(out.len(), 501);
        assert_eq!(out[1], 2);
        assert_eq!(*out.last().unwrap(), 1000);
    }

    #[test]
    fn tiny_limits_keep_only_newest() {
        assert_eq!(downsample(vec![1, 2, 3], 1), vec![3]);
        assert_eq!(downsample(vec![1, 2, 3], 0), vec![3]);
        assert!(downsample(Vec::<u8>::new(), 0).is_empty());
    }

    #[test]
    fn percentage_change_cases() {
        assert_eq!(percentage_change(&[]), 0.0);
        assert_eq!(percentage_change(&[point(0, 10.0)]), 0.0);
        assert_eq!(percentage_change(&[point(0, 10.0), point(1, 15.0)]), 50.0);
        assert_eq!(percentage_change(&[point(0, 20.0), point(1, 99.0), point(2, 15.0)]), -25.0);
        assert_eq!(percentage_change(&[point(0, 0.0), point(1, 15.0)]), 0.0);
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let base = Duration::from_secs(10);
        assert_eq!(retry_delay(base, 0), base);
        assert_eq!(retry_delay(base, 1), Duration::from_secs(20));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(40));
        assert_eq!(retry_delay(base, 10), MAX_RETRY_DELAY);
    }

    async fn seeded_pool(now: DateTime<Utc>, ages_minutes: &[i64]) -> DbPool {
        let pool = storage::init_pool(&temp_db_url()).await.unwrap();
        for (i, age) in ages_minutes.iter().enumerate() {
            let ts = now - chrono::Duration::minutes(*age);
            let block = RawBlock {
                number: Some(format!("{:#x}", i + 1)),
                timestamp: Some(format!("{:#x}", ts.timestamp())),
                base_fee_per_gas: Some(format!("{:#x}", (10 + i as u128) * 1_000_000_000)),
                ..Default::default()
            };
            storage::insert_block_data(&pool, &block_metrics(&block))
                .await
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn query_filters_by_range_window() {
        let now = Utc::now();
        // 3 days, 5 hours, 90 minutes and 1 minute old.
        let pool = seeded_pool(now, &[3 * 24 * 60, 5 * 60, 90, 1]).await;
        let aggregator = SeriesAggregator::new(pool, DEFAULT_MAX_POINTS);

        let two_hours = aggregator.query_at(TimeRange::TwoHours, now).await.unwrap();
        assert_eq!(two_hours.points.len(), 2);
        assert_eq!(two_hours.points[0].block_number, 3);
        assert_eq!(two_hours.percent_change, round_to((13.0 - 12.0) / 12.0 * 100.0, 2));

        let eight_hours = aggregator.query_at(TimeRange::EightHours, now).await.unwrap();
        assert_eq!(eight_hours.points.len(), 3);

        let week = aggregator.query_at(TimeRange::Week, now).await.unwrap();
        assert_eq!(week.points.len(), 4);
        assert_eq!(week.range, TimeRange::Week);
    }

    #[tokio::test]
    async fn empty_window_is_not_an_error() {
        let pool = storage::init_pool(&temp_db_url()).await.unwrap();
        let series = SeriesAggregator::new(pool, DEFAULT_MAX_POINTS)
            .query(TimeRange::Day)
            .await
            .unwrap();
        assert!(series.points.is_empty());
        assert_eq!(series.percent_change, 0.0);
    }

    #[tokio::test]
    async fn closed_store_reports_unavailable() {
        let pool = storage::init_pool(&temp_db_url()).await.unwrap();
        pool.close().await;
        let err = SeriesAggregator::new(pool, DEFAULT_MAX_POINTS)
            .query(TimeRange::Day)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregationError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn refresh_publishes_and_follows_range_changes() {
        let now = Utc::now();
        let pool = seeded_pool(now, &[5 * 60, 30]).await;
        let aggregator = SeriesAggregator::new(pool, DEFAULT_MAX_POINTS);

        let (range_tx, range_rx) = watch::channel(TimeRange::TwoHours);
        let (series_tx, mut series_rx) = watch::channel(None);
        let handle = tokio::spawn(run_series_refresh(
            aggregator,
            range_rx,
            series_tx,
            Duration::from_secs(3600),
        ));

        tokio::time::timeout(Duration::from_secs(5), series_rx.changed())
            .await
            .unwrap()
            .unwrap();
        let first = series_rx.borrow_and_update().clone().unwrap();
        assert_eq!(first.range, TimeRange::TwoHours);
        assert_eq!(first.points.len(), 1);

        // The hour-long sleep is cut short by the range change.
        range_tx.send(TimeRange::EightHours).unwrap();
        tokio::time::timeout(Duration::from_secs(5), series_rx.changed())
            .await
            .unwrap()
            .unwrap();
        let second = series_rx.borrow_and_update().clone().unwrap();
        assert_eq!(second.range, TimeRange::EightHours);
        assert_eq!(second.points.len(), 2);

        drop(range_tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn live_series_publishes_and_switches_range() {
        let now = Utc::now();
        let pool = seeded_pool(now, &[5 * 60, 30]).await;
        let live = LiveSeries::spawn(
            SeriesAggregator::new(pool, DEFAULT_MAX_POINTS),
            TimeRange::TwoHours,
            Duration::from_secs(3600),
        );
        assert_eq!(live.range(), TimeRange::TwoHours);

        let mut series_rx = live.series.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            series_rx.wait_for(|s| s.as_ref().is_some_and(|s| s.range == TimeRange::TwoHours)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(live.published(TimeRange::TwoHours).unwrap().points.len(), 1);
        assert!(live.published(TimeRange::EightHours).is_none());

        live.follow(TimeRange::EightHours);
        tokio::time::timeout(
            Duration::from_secs(5),
            series_rx.wait_for(|s| s.as_ref().is_some_and(|s| s.range == TimeRange::EightHours)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(live.published(TimeRange::EightHours).unwrap().points.len(), 2);
        assert!(live.published(TimeRange::TwoHours).is_none());
    }
}
