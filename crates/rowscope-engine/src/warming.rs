//! Shadow-and-swap warming.
//!
//! One job per data source, enforced by a store lease whose value is the
//! job id. A job:
//!
//! 1. takes the lease, or reports the current holder and exits;
//! 2. computes every warm key unrestricted and writes it to the shadow
//!    namespace, renewing the lease as it goes;
//! 3. checks the invalidation epoch has not moved;
//! 4. promotes the shadow namespace in one atomic store operation, guarded
//!    by the same epoch;
//! 5. deletes residual shadow keys, records the outcome and releases the
//!    lease.
//!
//! Cancellation stops new shadow writes; writes already made stay in the
//! shadow namespace. Once step 4 has been issued it runs to completion:
//! the swap is a single store operation and is never interrupted.
//! The lease is released on every exit path.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::StreamExt;
use rowscope_auth::EffectiveFilter;
use rowscope_core::DataSourceId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::EngineResult;
use crate::cache::SecondaryIndexCache;
use crate::dimension::DimensionKey;
use crate::entry::{CacheEntry, entry_id};
use crate::error::EngineError;
use crate::keyspace::Namespace;

// =============================================================================
// Jobs
// =============================================================================

/// Identifier of a warming job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a warming job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a warm request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WarmStart {
    /// A new job was started.
    Started { job_id: JobId },
    /// Another job holds the lease. `job_id` is `None` if the holder is not
    /// a job id (or the lease was released meanwhile).
    AlreadyWarming { job_id: Option<JobId> },
}

impl WarmStart {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Started { job_id } => Some(*job_id),
            Self::AlreadyWarming { job_id } => *job_id,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// Progress counters of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmProgress {
    /// Keys to warm.
    pub total: usize,
    /// Keys done, including reused ones.
    pub completed: usize,
    /// Keys satisfied by shadow entries left by an earlier attempt.
    pub reused: usize,
}

impl WarmProgress {
    /// Completed fraction in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed as f64 / self.total as f64).min(1.0)
    }
}

/// Snapshot of a job for polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingStatus {
    pub job_id: JobId,
    pub data_source: DataSourceId,
    pub state: JobState,
    pub progress: WarmProgress,
    #[serde(with = "time::serde::timestamp")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp::option")]
    pub finished_at: Option<OffsetDateTime>,
    /// Rough time to completion from observed throughput.
    #[serde(with = "humantime_serde")]
    pub eta: Option<Duration>,
    /// Entries moved to production by the swap.
    pub promoted: usize,
    pub error: Option<String>,
}

/// Warming settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmingConfig {
    /// Lease lifetime. The lease is renewed every third of this.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// Maximum concurrent shadow writes per job.
    pub concurrency: usize,

    /// Keep shadow keys when a job fails before the swap, so a later
    /// non-forced job can reuse them.
    pub retain_shadow_on_failure: bool,

    /// How long finished jobs stay queryable.
    #[serde(with = "humantime_serde")]
    pub job_retention: Duration,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            concurrency: 8,
            retain_shadow_on_failure: true,
            job_retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Default)]
struct JobOutcome {
    finished_at: Option<OffsetDateTime>,
    finished: Option<Instant>,
    promoted: usize,
    error: Option<String>,
}

#[derive(Debug)]
struct JobRecord {
    id: JobId,
    data_source: DataSourceId,
    started_at: OffsetDateTime,
    started: Instant,
    total: AtomicUsize,
    completed: AtomicUsize,
    reused: AtomicUsize,
    cancel: CancellationToken,
    state: watch::Sender<JobState>,
    /// Flipped once the lease is released after `state` turned terminal.
    settled: watch::Sender<bool>,
    outcome: Mutex<JobOutcome>,
}

impl JobRecord {
    fn state(&self) -> JobState {
        *self.state.borrow()
    }

    fn status(&self) -> WarmingStatus {
        let progress = WarmProgress {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        };
        let state = self.state();
        let eta = (state == JobState::Running && progress.completed > 0)
            .then(|| {
                let remaining = progress.total.saturating_sub(progress.completed);
                self.started
                    .elapsed()
                    .mul_f64(remaining as f64 / progress.completed as f64)
            });
        let (finished_at, promoted, error) = self
            .outcome
            .lock()
            .map(|o| (o.finished_at, o.promoted, o.error.clone()))
            .unwrap_or_default();

        WarmingStatus {
            job_id: self.id,
            data_source: self.data_source.clone(),
            state,
            progress,
            started_at: self.started_at,
            finished_at,
            eta,
            promoted,
            error,
        }
    }

    fn finish(&self, state: JobState, promoted: usize, error: Option<String>) {
        if let Ok(mut outcome) = self.outcome.lock() {
            outcome.finished_at = Some(OffsetDateTime::now_utc());
            outcome.finished = Some(Instant::now());
            outcome.promoted = promoted;
            outcome.error = error;
        }
        self.state.send_replace(state);
    }

    /// Finished longer than `retention` ago.
    fn expired(&self, retention: Duration) -> bool {
        self.outcome
            .lock()
            .ok()
            .and_then(|o| o.finished)
            .is_some_and(|at| at.elapsed() >= retention)
    }
}

enum JobEnd {
    Promoted(usize),
    Cancelled,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Starts, tracks and cancels warming jobs.
#[derive(Clone)]
pub struct WarmingCoordinator {
    cache: Arc<SecondaryIndexCache>,
    config: WarmingConfig,
    jobs: Arc<DashMap<JobId, Arc<JobRecord>>>,
}

impl fmt::Debug for WarmingCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarmingCoordinator")
            .field("config", &self.config)
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl WarmingCoordinator {
    pub fn new(cache: Arc<SecondaryIndexCache>, config: WarmingConfig) -> Self {
        Self {
            cache,
            config,
            jobs: Arc::new(DashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<SecondaryIndexCache> {
        &self.cache
    }

    /// Start warming `ds`, unless a job already holds its lease.
    ///
    /// With `force`, shadow keys left by an earlier failed attempt are
    /// discarded; otherwise they are reused.
    ///
    /// # Errors
    ///
    /// Returns store errors raised while taking the lease.
    pub async fn start(&self, ds: &DataSourceId, force: bool) -> EngineResult<WarmStart> {
        let store = self.cache.store();
        let lease = self.cache.keyspace().lease(ds);
        let job_id = JobId::new();
        let holder = job_id.to_string();

        if !store
            .try_acquire_lease(&lease, &holder, self.config.lease_ttl)
            .await?
        {
            let current = store.lease_holder(&lease).await?;
            tracing::info!(
                data_source = %ds,
                holder = current.as_deref().unwrap_or("none"),
                "Warming already in progress"
            );
            return Ok(WarmStart::AlreadyWarming {
                job_id: current.as_deref().and_then(|h| h.parse().ok()),
            });
        }

        let epoch = match self.cache.epoch(ds).await {
            Ok(epoch) => epoch,
            Err(err) => {
                let _ = store.release_lease(&lease, &holder).await;
                return Err(err);
            }
        };

        let pruned = self.prune_finished(self.config.job_retention);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned finished warming jobs");
        }

        let (state, _) = watch::channel(JobState::Running);
        let (settled, _) = watch::channel(false);
        let record = Arc::new(JobRecord {
            id: job_id,
            data_source: ds.clone(),
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            state,
            settled,
            outcome: Mutex::new(JobOutcome::default()),
        });
        self.jobs.insert(job_id, record.clone());

        tracing::info!(job_id = %job_id, data_source = %ds, force, "Warming job started");

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run(record, epoch, force).await;
        });

        Ok(WarmStart::Started { job_id })
    }

    /// Current status of a job, `None` if unknown.
    pub fn status(&self, job_id: JobId) -> Option<WarmingStatus> {
        let record = self.jobs.get(&job_id)?.value().clone();
        Some(record.status())
    }

    /// Request cancellation. Returns `false` if the job is unknown or has
    /// already finished.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let Some(record) = self.jobs.get(&job_id).map(|r| r.value().clone()) else {
            return false;
        };
        if record.state().is_terminal() {
            return false;
        }
        tracing::info!(job_id = %job_id, data_source = %record.data_source, "Cancelling warming job");
        record.cancel.cancel();
        true
    }

    /// Wait for a job to finish and give up its lease. `None` if the job
    /// is unknown.
    pub async fn wait(&self, job_id: JobId) -> Option<JobState> {
        let record = self.jobs.get(&job_id)?.value().clone();
        let mut rx = record.settled.subscribe();
        let _ = rx.wait_for(|settled| *settled).await;
        Some(record.state())
    }

    /// Running job for a data source, if this process started one.
    pub fn active_job(&self, ds: &DataSourceId) -> Option<JobId> {
        self.jobs
            .iter()
            .find(|r| r.data_source == *ds && !r.state().is_terminal())
            .map(|r| r.id)
    }

    /// Forget jobs that finished more than `older_than` ago. Returns how
    /// many were removed. Called on every [`start`](Self::start) with the
    /// configured retention.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, record| !record.expired(older_than));
        before.saturating_sub(self.jobs.len())
    }

    async fn run(&self, record: Arc<JobRecord>, epoch: Option<String>, force: bool) {
        let ds = record.data_source.clone();
        let result = self.execute(&record, epoch.as_deref(), force).await;

        let (state, promoted, error) = match result {
            Ok(JobEnd::Promoted(promoted)) => {
                tracing::info!(
                    job_id = %record.id,
                    data_source = %ds,
                    promoted,
                    elapsed_ms = record.started.elapsed().as_millis() as u64,
                    "Warming job succeeded"
                );
                (JobState::Succeeded, promoted, None)
            }
            Ok(JobEnd::Cancelled) => {
                tracing::info!(
                    job_id = %record.id,
                    data_source = %ds,
                    completed = record.completed.load(Ordering::Relaxed),
                    "Warming job cancelled; shadow writes kept"
                );
                (JobState::Cancelled, 0, None)
            }
            Err(err) => {
                tracing::error!(
                    job_id = %record.id,
                    data_source = %ds,
                    category = %err.category(),
                    error = %err,
                    "Warming job failed"
                );
                if !self.config.retain_shadow_on_failure
                    && let Err(clear_err) = self.cache.clear_shadow(&ds).await
                {
                    tracing::warn!(data_source = %ds, error = %clear_err, "Failed to discard shadow keys");
                }
                (JobState::Failed, 0, Some(err.to_string()))
            }
        };

        // Terminal before the lease is free.
        record.finish(state, promoted, error);

        let lease = self.cache.keyspace().lease(&ds);
        match self
            .cache
            .store()
            .release_lease(&lease, &record.id.to_string())
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                job_id = %record.id,
                data_source = %ds,
                "Warming lease was no longer held at release"
            ),
            Err(err) => tracing::warn!(
                job_id = %record.id,
                data_source = %ds,
                error = %err,
                "Failed to release warming lease; it will expire"
            ),
        }
        record.settled.send_replace(true);
    }

    async fn execute(
        &self,
        record: &JobRecord,
        epoch: Option<&str>,
        force: bool,
    ) -> EngineResult<JobEnd> {
        let ds = &record.data_source;
        let store = self.cache.store();
        let lease = self.cache.keyspace().lease(ds);
        let holder = record.id.to_string();

        if force {
            let discarded = self.cache.clear_shadow(ds).await?;
            if discarded > 0 {
                tracing::info!(data_source = %ds, discarded, "Discarded stale shadow keys");
            }
        }

        let keys = self.cache.warehouse().warm_keys(ds).await?;
        record.total.store(keys.len(), Ordering::Relaxed);
        let reusable = if force {
            BTreeSet::new()
        } else {
            self.cache.entry_ids(Namespace::Shadow, ds).await?
        };

        let mut renew = tokio::time::interval(
            (self.config.lease_ttl / 3).max(Duration::from_millis(10)),
        );
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        renew.tick().await;

        let writes = futures_util::stream::iter(keys)
            .map(|key| self.warm_one(record, key, &reusable))
            .buffer_unordered(self.config.concurrency.max(1));
        let mut writes = std::pin::pin!(writes);

        loop {
            tokio::select! {
                biased;
                _ = record.cancel.cancelled() => return Ok(JobEnd::Cancelled),
                _ = renew.tick() => {
                    if !store.renew_lease(&lease, &holder, self.config.lease_ttl).await? {
                        return Err(EngineError::internal("warming lease lost"));
                    }
                }
                next = writes.next() => match next {
                    Some(result) => result?,
                    None => break,
                },
            }
        }

        if record.cancel.is_cancelled() {
            return Ok(JobEnd::Cancelled);
        }

        let current = self.cache.epoch(ds).await?;
        if current.as_deref() != epoch {
            self.cache.clear_shadow(ds).await?;
            return Err(EngineError::swap_failed(
                ds.clone(),
                "data source was invalidated during warming",
            ));
        }

        // Point of no return: the swap is one atomic store operation. It
        // re-checks the epoch itself, so an invalidation landing after the
        // check above still wins.
        let promoted = match self
            .cache
            .promote_shadow(ds, OffsetDateTime::now_utc(), epoch)
            .await
        {
            Ok(promoted) => promoted,
            Err(err) => {
                // Shadow keys written before an invalidation must not be
                // reused by a later job.
                if self.cache.epoch(ds).await?.as_deref() != epoch {
                    self.cache.clear_shadow(ds).await?;
                }
                return Err(err);
            }
        };

        if let Err(err) = self.cache.clear_shadow(ds).await {
            tracing::warn!(data_source = %ds, error = %err, "Failed to delete residual shadow keys");
        }
        Ok(JobEnd::Promoted(promoted))
    }

    async fn warm_one(
        &self,
        record: &JobRecord,
        key: DimensionKey,
        reusable: &BTreeSet<String>,
    ) -> EngineResult<()> {
        let id = entry_id(&key.digest()?, &EffectiveFilter::Unrestricted);
        if reusable.contains(&id) && self.shadow_entry_is_fresh(&key, &id).await? {
            record.reused.fetch_add(1, Ordering::Relaxed);
            record.completed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        key.validate()?;
        let rows = self
            .cache
            .fetch_with_retry(&key, &EffectiveFilter::Unrestricted)
            .await?;
        let entry = CacheEntry::new(
            key,
            EffectiveFilter::Unrestricted,
            rows,
            self.cache.settings().entry_ttl,
            OffsetDateTime::now_utc(),
        );
        self.cache.write_entry(Namespace::Shadow, &entry).await?;
        record.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Whether a shadow entry left by an earlier attempt can be promoted
    /// as-is: it decodes, matches `key`, and is younger than both its own
    /// TTL and the configured entry TTL.
    async fn shadow_entry_is_fresh(&self, key: &DimensionKey, id: &str) -> EngineResult<bool> {
        let store_key = self
            .cache
            .keyspace()
            .entry(Namespace::Shadow, &key.data_source, id);
        let Some(bytes) = self.cache.store().get(&store_key).await? else {
            return Ok(false);
        };
        let entry = match CacheEntry::from_bytes(&store_key, &bytes) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(key = %store_key, error = %err, "Refetching corrupt shadow entry");
                return Ok(false);
            }
        };

        let now = OffsetDateTime::now_utc();
        let fresh = entry.key == *key
            && !entry.is_expired(now)
            && now < entry.created_at() + self.cache.settings().entry_ttl;
        if !fresh {
            tracing::debug!(key = %store_key, "Refetching stale shadow entry");
        }
        Ok(fresh)
    }
}
