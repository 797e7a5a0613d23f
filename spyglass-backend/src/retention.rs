//! Retention and compaction.
//!
//! Light pruning runs hourly and deletes samples past their TTL in small
//! batches. Full optimization is on-demand: each endpoint's sample history
//! is partitioned into age bands and thinned down to key points - bucket
//! extrema, temporal midpoints, global peaks and troughs, and trend-change
//! points - so charts keep their shape while old data shrinks.

use crate::backup;
use serde::Serialize;
use spyglass_db::{Database, DbError, EndpointSample};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

const LIGHT_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
const DELETE_BATCH: u32 = 2000;
const ID_DELETE_BATCH: usize = 1000;
const BATCH_PAUSE: Duration = Duration::from_millis(5);
const ID_BATCH_PAUSE: Duration = Duration::from_millis(2);
const PAGE_PAUSE: Duration = Duration::from_millis(50);

/// Bands holding more rows than this skip extrema detection and fall back
/// to a streaming interval sampler, to bound memory.
const LARGE_BAND_THRESHOLD: i64 = 100_000;
const LARGE_BAND_PAGE: i64 = 10_000;
/// A band with this few points is left untouched.
const MIN_BAND_POINTS: usize = 10;

const GLOBAL_EXTREMA: usize = 10;
const TREND_WINDOW: usize = 3;
const TREND_THRESHOLD: f64 = 0.3;
const MAX_TREND_POINTS: usize = 20;

const DAY: i64 = 86_400;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 30 * DAY;
const HALF_YEAR: i64 = 182 * DAY;
const YEAR: i64 = 365 * DAY;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub sample_ttl: Duration,
    pub activity_ttl: Duration,
    pub session_ttl: Duration,
    /// None for in-memory stores: skips snapshots and file-size accounting.
    pub database_path: Option<PathBuf>,
    pub backup_dir: PathBuf,
}

/// Summary of one full optimization run.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub started_at: i64,
    pub finished_at: i64,
    pub samples_before: i64,
    pub samples_after: i64,
    pub sessions_before: i64,
    pub sessions_after: i64,
    pub activities_before: i64,
    pub activities_after: i64,
    pub samples_deleted: u64,
    pub sessions_deleted: u64,
    pub activities_deleted: u64,
    pub deleted_total: u64,
    pub space_saved_bytes: u64,
    pub space_saved_estimated: bool,
}

pub struct Retention {
    db: Database,
    config: RetentionConfig,
}

impl Retention {
    pub fn new(db: Database, config: RetentionConfig) -> Self {
        Self { db, config }
    }

    /// Hourly light pruning until shutdown. The first pass runs
    /// immediately so a restart never postpones overdue cleanup.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(LIGHT_PRUNE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("retention engine started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.prune_samples(crate::helpers::now()).await {
                        error!("sample pruning failed: {e}");
                    }
                }
            }
        }
        info!("retention engine stopped");
    }

    /// Delete samples past their TTL in batches with brief yields, so the
    /// store never stalls behind one large delete.
    pub async fn prune_samples(&self, now: i64) -> Result<u64, DbError> {
        let cutoff = now - self.config.sample_ttl.as_secs() as i64;
        let mut total = 0u64;
        loop {
            let deleted = self.db.delete_samples_before(cutoff, DELETE_BATCH).await?;
            if deleted == 0 {
                break;
            }
            total += deleted;
            sleep(BATCH_PAUSE).await;
        }
        if total > 0 {
            info!(total, "pruned expired samples");
        }
        Ok(total)
    }

    /// Full tiered optimization across every endpoint, followed by
    /// session/activity pruning and space reclamation.
    pub async fn optimize(&self, now: i64) -> Result<OptimizationReport, DbError> {
        info!("starting full optimization");
        self.write_snapshot(now).await;

        let before = self.db.table_counts().await?;
        let size_before = self.database_file_size();

        let mut samples_deleted = 0u64;
        for endpoint_id in self.db.endpoint_ids().await? {
            match self.optimize_endpoint(endpoint_id, now).await {
                Ok(deleted) => samples_deleted += deleted,
                Err(e) => error!(endpoint_id, "endpoint optimization failed: {e}"),
            }
        }

        let activities_deleted = self
            .drain(
                |cutoff| self.db.delete_activities_before(cutoff, DELETE_BATCH),
                now - self.config.activity_ttl.as_secs() as i64,
            )
            .await?;
        let sessions_deleted = self
            .drain(
                |cutoff| self.db.delete_closed_sessions_before(cutoff, DELETE_BATCH),
                now - self.config.session_ttl.as_secs() as i64,
            )
            .await?;

        let after = self.db.table_counts().await?;
        let deleted_total = samples_deleted + activities_deleted + sessions_deleted;

        // reclaim file space; when that fails, fall back to a rough
        // 200-bytes-per-row estimate
        let (space_saved_bytes, space_saved_estimated) = match self.db.vacuum().await {
            Ok(()) => match (size_before, self.database_file_size()) {
                (Some(pre), Some(post)) => (pre.saturating_sub(post), false),
                _ => (deleted_total * 200, true),
            },
            Err(e) => {
                warn!("vacuum failed, estimating reclaimed space: {e}");
                (deleted_total * 200, true)
            }
        };

        let report = OptimizationReport {
            started_at: now,
            finished_at: crate::helpers::now(),
            samples_before: before.samples,
            samples_after: after.samples,
            sessions_before: before.sessions,
            sessions_after: after.sessions,
            activities_before: before.activities,
            activities_after: after.activities,
            samples_deleted,
            sessions_deleted,
            activities_deleted,
            deleted_total,
            space_saved_bytes,
            space_saved_estimated,
        };
        info!(
            samples = samples_deleted,
            sessions = sessions_deleted,
            activities = activities_deleted,
            space_saved = space_saved_bytes,
            "optimization finished"
        );
        Ok(report)
    }

    /// Pre-optimization snapshot; failure is logged and never blocks the
    /// optimization itself.
    async fn write_snapshot(&self, now: i64) {
        let Some(db_path) = self.config.database_path.clone() else {
            return;
        };
        let backup_dir = self.config.backup_dir.clone();
        let result =
            tokio::task::spawn_blocking(move || backup::write_snapshot(&db_path, &backup_dir, now))
                .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("pre-optimization snapshot failed, continuing: {e}"),
            Err(e) => warn!("snapshot task failed, continuing: {e}"),
        }
    }

    fn database_file_size(&self) -> Option<u64> {
        let path = self.config.database_path.as_ref()?;
        std::fs::metadata(path).ok().map(|meta| meta.len())
    }

    async fn drain<F, Fut>(&self, op: F, cutoff: i64) -> Result<u64, DbError>
    where
        F: Fn(i64) -> Fut,
        Fut: std::future::Future<Output = Result<u64, DbError>>,
    {
        let mut total = 0u64;
        loop {
            let deleted = op(cutoff).await?;
            if deleted == 0 {
                break;
            }
            total += deleted;
            sleep(BATCH_PAUSE).await;
        }
        Ok(total)
    }

    /// Apply the tiered resolution policy to one endpoint:
    /// older than a year is dropped, then daily / hourly / 30-minute key
    /// points by age band, and the most recent week is kept whole.
    async fn optimize_endpoint(&self, endpoint_id: i64, now: i64) -> Result<u64, DbError> {
        let mut deleted = 0u64;

        loop {
            let n = self
                .db
                .delete_samples_before_for(endpoint_id, now - YEAR, DELETE_BATCH)
                .await?;
            if n == 0 {
                break;
            }
            deleted += n;
            sleep(BATCH_PAUSE).await;
        }

        deleted += self
            .optimize_band(endpoint_id, now - YEAR, now - HALF_YEAR, DAY)
            .await?;
        deleted += self
            .optimize_band(endpoint_id, now - HALF_YEAR, now - MONTH, 3600)
            .await?;
        deleted += self
            .optimize_band(endpoint_id, now - MONTH, now - WEEK, 1800)
            .await?;

        Ok(deleted)
    }

    async fn optimize_band(
        &self,
        endpoint_id: i64,
        from: i64,
        to: i64,
        bucket_secs: i64,
    ) -> Result<u64, DbError> {
        let count = self.db.count_samples_in_range(endpoint_id, from, to).await?;
        if count == 0 {
            return Ok(0);
        }
        if count > LARGE_BAND_THRESHOLD {
            return self
                .sample_band_streaming(endpoint_id, from, to, bucket_secs)
                .await;
        }

        let samples = self.db.samples_in_range(endpoint_id, from, to).await?;
        if samples.len() <= MIN_BAND_POINTS {
            return Ok(0);
        }

        let keep = select_key_points(&samples, bucket_secs);
        let delete_ids: Vec<i64> = samples
            .iter()
            .filter(|s| !keep.contains(&s.id))
            .map(|s| s.id)
            .collect();
        let kept = samples.len() - delete_ids.len();
        let deleted = self.delete_ids_batched(delete_ids).await?;
        if deleted > 0 {
            info!(
                endpoint_id,
                bucket_secs,
                kept,
                deleted,
                "thinned age band to key points"
            );
        }
        Ok(deleted)
    }

    async fn delete_ids_batched(&self, ids: Vec<i64>) -> Result<u64, DbError> {
        let mut total = 0u64;
        for chunk in ids.chunks(ID_DELETE_BATCH) {
            total += self.db.delete_samples_by_ids(chunk.to_vec()).await?;
            sleep(ID_BATCH_PAUSE).await;
        }
        Ok(total)
    }

    /// Streaming fallback for oversized bands: page through in timestamp
    /// order keeping each page's edges plus one sample per bucket interval.
    /// Extrema detection is skipped on purpose.
    async fn sample_band_streaming(
        &self,
        endpoint_id: i64,
        from: i64,
        to: i64,
        interval_secs: i64,
    ) -> Result<u64, DbError> {
        info!(endpoint_id, "large band detected, using streaming sampler");
        let mut total = 0u64;
        let mut offset = 0i64;

        loop {
            let page = self
                .db
                .samples_page(endpoint_id, from, to, LARGE_BAND_PAGE, offset)
                .await?;
            if page.is_empty() {
                break;
            }

            let delete_ids = interval_thin_ids(&page, interval_secs);
            let deleted = self.delete_ids_batched(delete_ids).await?;
            total += deleted;

            // deleted rows shift later pages back; advance by what was kept
            offset += page.len() as i64 - deleted as i64;
            if (page.len() as i64) < LARGE_BAND_PAGE {
                break;
            }
            sleep(PAGE_PAUSE).await;
        }
        Ok(total)
    }
}

/// Choose the sample ids an age band keeps: band edges, per-bucket key
/// points, global extrema and trend-change points.
fn select_key_points(samples: &[EndpointSample], bucket_secs: i64) -> HashSet<i64> {
    let mut keep = HashSet::new();
    keep.insert(samples[0].id);
    keep.insert(samples[samples.len() - 1].id);

    for group in group_by_bucket(samples, bucket_secs) {
        for sample in bucket_key_points(group) {
            keep.insert(sample.id);
        }
    }
    for sample in global_extrema(samples, GLOBAL_EXTREMA) {
        keep.insert(sample.id);
    }
    for sample in trend_change_points(samples) {
        keep.insert(sample.id);
    }
    keep
}

/// Split ordered samples into buckets anchored at the first timestamp.
fn group_by_bucket(samples: &[EndpointSample], bucket_secs: i64) -> Vec<&[EndpointSample]> {
    let mut groups = Vec::new();
    let mut start = 0usize;
    for i in 1..samples.len() {
        if samples[i].timestamp - samples[start].timestamp >= bucket_secs {
            groups.push(&samples[start..i]);
            start = i;
        }
    }
    groups.push(&samples[start..]);
    groups
}

/// Key points inside one bucket: the roster maximum, the roster minimum,
/// and the temporal midpoint when it is a distinct row. Tiny buckets are
/// kept whole.
fn bucket_key_points(group: &[EndpointSample]) -> Vec<&EndpointSample> {
    if group.len() <= 3 {
        return group.iter().collect();
    }

    let mut max = &group[0];
    let mut min = &group[0];
    for sample in group {
        if sample.roster_online > max.roster_online {
            max = sample;
        }
        if sample.roster_online < min.roster_online {
            min = sample;
        }
    }

    let mut points = vec![max];
    if min.id != max.id {
        points.push(min);
    }
    let mid = &group[group.len() / 2];
    if mid.id != max.id && mid.id != min.id {
        points.push(mid);
    }
    points
}

/// Up to `max_points` band-wide extrema, half from the top and half from
/// the bottom of the roster counts.
fn global_extrema(samples: &[EndpointSample], max_points: usize) -> Vec<&EndpointSample> {
    if samples.len() <= max_points {
        return samples.iter().collect();
    }

    let mut by_online: Vec<&EndpointSample> = samples.iter().collect();
    by_online.sort_by_key(|s| (s.roster_online, s.id));

    let half = max_points / 2;
    let mut points: Vec<&EndpointSample> = by_online.iter().rev().take(half).copied().collect();
    points.extend(by_online.iter().take(max_points - half).copied());
    points
}

/// Sliding-window change detection: a point is kept when the average of
/// the window after it moves more than 30% relative to the window before
/// it. Near-empty stretches (averages at or below one player) are ignored,
/// and at most 20 change points survive per band.
fn trend_change_points(samples: &[EndpointSample]) -> Vec<&EndpointSample> {
    if samples.len() < 2 * TREND_WINDOW + 1 {
        return Vec::new();
    }

    let mut points = Vec::new();
    for i in TREND_WINDOW..samples.len() - TREND_WINDOW {
        let prev_sum: i64 = samples[i - TREND_WINDOW..i]
            .iter()
            .map(|s| s.roster_online)
            .sum();
        let next_sum: i64 = samples[i + 1..=i + TREND_WINDOW]
            .iter()
            .map(|s| s.roster_online)
            .sum();
        let prev_avg = prev_sum as f64 / TREND_WINDOW as f64;
        let next_avg = next_sum as f64 / TREND_WINDOW as f64;

        if prev_avg > 1.0
            && next_avg > 1.0
            && (next_avg - prev_avg).abs() / prev_avg.max(next_avg) > TREND_THRESHOLD
        {
            points.push(&samples[i]);
            if points.len() >= MAX_TREND_POINTS {
                break;
            }
        }
    }
    points
}

/// Delete candidates for one streamed page: keep the page edges and the
/// first sample of every interval.
fn interval_thin_ids(page: &[EndpointSample], interval_secs: i64) -> Vec<i64> {
    if page.len() <= 2 {
        return Vec::new();
    }
    let mut delete = Vec::new();
    let mut last_kept = page[0].timestamp;
    for sample in &page[1..page.len() - 1] {
        if sample.timestamp - last_kept >= interval_secs {
            last_kept = sample.timestamp;
        } else {
            delete.push(sample.id);
        }
    }
    delete
}
