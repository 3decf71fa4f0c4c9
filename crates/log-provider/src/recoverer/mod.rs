//! Re-reads logs older than the provider's lookback window to recover work
//! the provider missed.
//!
//! Each pass picks a batch of filters that have fallen behind, scans a bounded
//! range of blocks per filter and queues payloads for work that was neither
//! performed, marked ineligible nor proposed recently. Proposed work IDs are
//! remembered for a TTL, after which garbage collection either forgets them or
//! queues them again if they are still unresolved.

use crate::{
    args::RecovererArgs,
    error::{PayloadError, PollerError, RecovererError},
    filter_store::{UpkeepFilter, UpkeepFilterStore},
    metrics::RecovererMetrics,
    packer::{LogDataPacker, build_payload},
    poller::{LogPoller, PolledLog, UpkeepStateReader, with_cancel},
    primitives::{LogTriggerExtension, TriggerError, UpkeepId, UpkeepPayload, dedup_key},
    tasks::BackgroundTasks,
    transmit::DedupKeyAdded,
};
use alloy_primitives::{Address, B256, Bytes};
use alloy_sol_types::SolEvent;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    task::JoinSet,
    time::{Instant, MissedTickBehavior, interval, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod block_time;

use block_time::{DEFAULT_BLOCK_TIME, estimate_block_time};

/// Filters further behind than this many scan buffers get a burst-sized scan.
const LAGGING_FACTOR: u64 = 100;

/// Blocks eligible for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecoveryWindow {
    start: u64,
    end: u64,
}

impl RecoveryWindow {
    fn contains(&self, block: u64) -> bool {
        (self.start..=self.end).contains(&block)
    }
}

#[derive(Debug, Clone)]
struct VisitedRecord {
    visited_at: Instant,
    payload: UpkeepPayload,
}

struct LogRecovererInner {
    args: RecovererArgs,
    registry_address: Address,
    poller: Arc<dyn LogPoller>,
    states: Arc<dyn UpkeepStateReader>,
    packer: Arc<dyn LogDataPacker>,
    filter_store: Arc<UpkeepFilterStore>,
    block_time_ms: AtomicU64,
    pending: Mutex<Vec<UpkeepPayload>>,
    visited: Mutex<HashMap<String, VisitedRecord>>,
    tasks: Mutex<Option<BackgroundTasks>>,
    metrics: RecovererMetrics,
}

impl fmt::Debug for LogRecovererInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogRecovererInner")
            .field("args", &self.args)
            .field("registry_address", &self.registry_address)
            .field("block_time_ms", &self.block_time_ms)
            .field("pending", &self.pending)
            .field("visited", &self.visited)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct LogRecoverer {
    inner: Arc<LogRecovererInner>,
}

impl LogRecoverer {
    pub fn new(
        args: RecovererArgs,
        registry_address: Address,
        poller: Arc<dyn LogPoller>,
        states: Arc<dyn UpkeepStateReader>,
        packer: Arc<dyn LogDataPacker>,
        filter_store: Arc<UpkeepFilterStore>,
    ) -> Self {
        Self {
            inner: Arc::new(LogRecovererInner {
                args,
                registry_address,
                poller,
                states,
                packer,
                filter_store,
                block_time_ms: AtomicU64::new(DEFAULT_BLOCK_TIME.as_millis() as u64),
                pending: Mutex::new(Vec::new()),
                visited: Mutex::new(HashMap::new()),
                tasks: Mutex::new(None),
                metrics: Default::default(),
            }),
        }
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.inner.block_time_ms.load(Ordering::Relaxed))
    }

    /// Starts the recovery and garbage collection loop.
    pub fn start(&self) -> Result<(), RecovererError> {
        let mut guard = self.inner.tasks.lock();
        if guard.is_some() {
            return Err(RecovererError::AlreadyStarted);
        }
        let mut tasks = BackgroundTasks::new();
        tasks.spawn(self.clone().run(tasks.token()));
        *guard = Some(tasks);
        info!(
            target: "keeper::log_recoverer",
            interval = ?self.inner.args.interval(),
            gc_interval = ?self.inner.args.gc_interval(),
            "log recoverer started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        let tasks = self.inner.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown("log_recoverer").await;
            info!(target: "keeper::log_recoverer", "log recoverer stopped");
        }
    }

    async fn run(self, cancel: CancellationToken) {
        self.update_block_time(&cancel).await;

        let args = &self.inner.args;
        let mut recover_ticker = interval(args.interval());
        recover_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut gc_ticker = interval_at(Instant::now() + args.gc_interval(), args.gc_interval());
        gc_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(target: "keeper::log_recoverer", "recovery loop stopped");
                    return;
                }
                _ = recover_ticker.tick() => {
                    match self.recover(&cancel).await {
                        Ok(()) => {}
                        Err(_) if cancel.is_cancelled() => return,
                        Err(e) => warn!(target: "keeper::log_recoverer", "recovery pass failed: {e}"),
                    }
                }
                _ = gc_ticker.tick() => {
                    if let Err(e) = self.clean(&cancel).await {
                        warn!(target: "keeper::log_recoverer", "visited cleanup failed: {e}");
                    }
                    self.update_block_time(&cancel).await;
                }
            }
        }
    }

    async fn update_block_time(&self, cancel: &CancellationToken) {
        let inner = &self.inner;
        match estimate_block_time(
            inner.poller.as_ref(),
            cancel,
            inner.args.block_time_sample_size,
        )
        .await
        {
            Ok(Some(block_time)) => {
                inner
                    .block_time_ms
                    .store(block_time.as_millis() as u64, Ordering::Relaxed);
                debug!(target: "keeper::log_recoverer", ?block_time, "updated block time");
            }
            Ok(None) => {
                debug!(target: "keeper::log_recoverer", "not enough blocks to estimate block time")
            }
            Err(e) => warn!(target: "keeper::log_recoverer", "failed to estimate block time: {e}"),
        }
    }

    async fn latest_block(&self, cancel: &CancellationToken) -> Result<u64, RecovererError> {
        with_cancel(cancel, self.inner.poller.latest_block())
            .await
            .map_err(|e| match e {
                PollerError::Cancelled => RecovererError::Cancelled,
                e => RecovererError::HeadNotAvailable(e),
            })
    }

    /// Blocks older than the provider's lookback but within the recovery
    /// window. `None` while the chain is shorter than the lookback.
    fn window(&self, latest: u64) -> Option<RecoveryWindow> {
        let args = &self.inner.args;
        let end = latest.checked_sub(args.lookback_blocks)?;
        let block_time_ms = self.inner.block_time_ms.load(Ordering::Relaxed).max(1);
        let window_blocks = args.recovery_window().as_millis() as u64 / block_time_ms;
        let start = latest.saturating_sub(window_blocks).min(end);
        Some(RecoveryWindow { start, end })
    }

    /// Runs one recovery pass over a batch of lagging filters.
    pub async fn recover(&self, cancel: &CancellationToken) -> Result<(), RecovererError> {
        let latest = self.latest_block(cancel).await?;
        let Some(window) = self.window(latest) else {
            debug!(target: "keeper::log_recoverer", latest, "chain shorter than lookback, nothing to recover");
            return Ok(());
        };

        let filters = self.filter_batch(window.end);
        if filters.is_empty() {
            return Ok(());
        }

        let started = std::time::Instant::now();
        let mut set = JoinSet::new();
        for filter in filters {
            let this = self.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let upkeep_id = filter.upkeep_id;
                (upkeep_id, this.recover_filter(&cancel, filter, window).await)
            });
        }
        while let Some(res) = set.join_next().await {
            match res {
                Ok((_, Ok(()))) => {}
                Ok((upkeep_id, Err(e))) => {
                    debug!(target: "keeper::log_recoverer", %upkeep_id, "failed to recover filter: {e}")
                }
                Err(e) => warn!(target: "keeper::log_recoverer", "recovery task failed: {e}"),
            }
        }
        self.inner.metrics.recover_duration.record(started.elapsed());

        if cancel.is_cancelled() {
            return Err(RecovererError::Cancelled);
        }
        Ok(())
    }

    /// Log-trigger filters lagging behind `end`. When there are more than a
    /// batch, the oldest half of the batch is always taken and the rest is
    /// sampled at random so no filter starves.
    fn filter_batch(&self, end: u64) -> Vec<UpkeepFilter> {
        let mut filters = self.inner.filter_store.get_filters(|f| {
            f.last_re_poll_block < end
                && f.config_update_block <= end
                && UpkeepId::from(f.upkeep_id).is_log_trigger()
        });
        filters.sort_by_key(|f| f.last_re_poll_block);

        let batch_size = self.inner.args.batch_size.max(1);
        if filters.len() <= batch_size {
            return filters;
        }
        let oldest = batch_size / 2;
        let mut rest = filters.split_off(oldest);
        rest.shuffle(&mut rand::rng());
        filters.extend(rest.into_iter().take(batch_size - oldest));
        filters
    }

    async fn recover_filter(
        &self,
        cancel: &CancellationToken,
        mut filter: UpkeepFilter,
        window: RecoveryWindow,
    ) -> Result<(), RecovererError> {
        let inner = &self.inner;
        let args = &inner.args;
        let resume = if filter.last_re_poll_block > 0 {
            filter.last_re_poll_block + 1
        } else {
            0
        };
        let start = resume.max(filter.config_update_block).max(window.start);
        let mut end = start + args.logs_buffer_blocks;
        if window.end.saturating_sub(end) > LAGGING_FACTOR * args.logs_buffer_blocks {
            end = start + args.logs_burst_blocks;
        }
        let end = end.min(window.end);
        if start > end {
            return Ok(());
        }

        let upkeep_id = UpkeepId::from(filter.upkeep_id);
        let logs = self.fetch_logs(cancel, &filter, start, end).await?;
        let logs = self
            .drop_performed(cancel, &upkeep_id, logs, start, end)
            .await?;
        let payloads: Vec<_> = logs
            .iter()
            .filter_map(
                |log| match build_payload(inner.packer.as_ref(), filter.upkeep_id, log) {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        debug!(target: "keeper::log_recoverer", %upkeep_id, "dropping log: {e}");
                        None
                    }
                },
            )
            .collect();
        let payloads = self
            .drop_resolved(cancel, upkeep_id, payloads, start, end)
            .await?;

        let found = payloads.len();
        let (added, complete) = self.add_pending(payloads);
        if complete {
            filter.last_re_poll_block = end;
            inner.filter_store.update_filters_with(
                |mut current, update| {
                    current.last_re_poll_block =
                        current.last_re_poll_block.max(update.last_re_poll_block);
                    current
                },
                &[filter],
            );
        }
        debug!(
            target: "keeper::log_recoverer",
            %upkeep_id,
            start,
            end,
            found,
            added,
            complete,
            "recovered upkeep logs"
        );
        Ok(())
    }

    async fn fetch_logs(
        &self,
        cancel: &CancellationToken,
        filter: &UpkeepFilter,
        start: u64,
        end: u64,
    ) -> Result<Vec<PolledLog>, RecovererError> {
        let logs = with_cancel(
            cancel,
            self.inner
                .poller
                .logs_with_sigs(start, end, &filter.event_sigs(), filter.addr),
        )
        .await
        .map_err(|e| match e {
            PollerError::Cancelled => RecovererError::Cancelled,
            source => RecovererError::FetchLogs {
                upkeep_id: filter.upkeep_id,
                source,
            },
        })?;
        Ok(filter.select(logs))
    }

    /// Drops logs whose dedup key the registry already emitted. Keys are
    /// searched a little past `end` since performs land after the log.
    async fn drop_performed(
        &self,
        cancel: &CancellationToken,
        upkeep_id: &UpkeepId,
        logs: Vec<PolledLog>,
        start: u64,
        end: u64,
    ) -> Result<Vec<PolledLog>, RecovererError> {
        if logs.is_empty() {
            return Ok(logs);
        }
        let inner = &self.inner;
        let markers = with_cancel(
            cancel,
            inner.poller.logs_with_sigs(
                start,
                end + inner.args.dedup_trailing_blocks,
                &[DedupKeyAdded::SIGNATURE_HASH],
                inner.registry_address,
            ),
        )
        .await
        .map_err(|e| match e {
            PollerError::Cancelled => RecovererError::Cancelled,
            source => RecovererError::FetchLogs {
                upkeep_id: upkeep_id.to_u256(),
                source,
            },
        })?;
        let performed: HashSet<B256> = markers
            .iter()
            .filter_map(|marker| marker.topics().get(1).copied())
            .collect();
        if performed.is_empty() {
            return Ok(logs);
        }

        Ok(logs
            .into_iter()
            .filter(|log| {
                let Ok(index) = u32::try_from(log.log_index) else {
                    return true;
                };
                let key = dedup_key(
                    upkeep_id,
                    &LogTriggerExtension {
                        tx_hash: log.tx_hash,
                        index,
                        block_hash: log.block_hash,
                        block_number: log.block_number,
                    },
                );
                !performed.contains(&key)
            })
            .collect())
    }

    /// Drops payloads the state store reports as performed or ineligible.
    async fn drop_resolved(
        &self,
        cancel: &CancellationToken,
        upkeep_id: UpkeepId,
        payloads: Vec<UpkeepPayload>,
        start: u64,
        end: u64,
    ) -> Result<Vec<UpkeepPayload>, RecovererError> {
        if payloads.is_empty() {
            return Ok(payloads);
        }
        let resolved = self
            .resolved_work_ids(cancel, &[upkeep_id], start, end)
            .await?;
        Ok(payloads
            .into_iter()
            .filter(|p| !resolved.contains(&p.work_id))
            .collect())
    }

    async fn resolved_work_ids(
        &self,
        cancel: &CancellationToken,
        upkeep_ids: &[UpkeepId],
        start: u64,
        end: u64,
    ) -> Result<HashSet<String>, RecovererError> {
        let (payloads, states) = with_cancel(
            cancel,
            self.inner
                .states
                .select_by_upkeep_ids_and_block_range(upkeep_ids, start, end),
        )
        .await
        .map_err(|e| match e {
            PollerError::Cancelled => RecovererError::Cancelled,
            e => RecovererError::StateReader(e),
        })?;
        Ok(payloads
            .into_iter()
            .zip(states)
            .filter(|(_, state)| state.is_final())
            .map(|(payload, _)| payload.work_id)
            .collect())
    }

    fn is_visited(visited: &HashMap<String, VisitedRecord>, work_id: &str, ttl: Duration) -> bool {
        visited
            .get(work_id)
            .is_some_and(|record| record.visited_at.elapsed() < ttl)
    }

    /// Queues payloads not visited within the TTL. Returns how many were
    /// added and whether none was dropped for exceeding the per-upkeep cap.
    fn add_pending(&self, payloads: Vec<UpkeepPayload>) -> (usize, bool) {
        let inner = &self.inner;
        let ttl = inner.args.visited_ttl();
        let fresh: Vec<_> = {
            let visited = inner.visited.lock();
            payloads
                .into_iter()
                .filter(|p| !Self::is_visited(&visited, &p.work_id, ttl))
                .collect()
        };

        let mut pending = inner.pending.lock();
        let mut added = 0;
        let mut complete = true;
        for payload in fresh {
            if pending.iter().any(|p| p.work_id == payload.work_id) {
                continue;
            }
            let queued = pending
                .iter()
                .filter(|p| p.upkeep_id == payload.upkeep_id)
                .count();
            if queued >= inner.args.max_pending_per_upkeep {
                complete = false;
                inner.metrics.pending_limit_dropped.increment(1);
                continue;
            }
            pending.push(payload);
            added += 1;
        }
        inner.metrics.payloads_recovered.increment(added as u64);
        inner.metrics.pending_payloads.set(pending.len() as f64);
        (added, complete)
    }

    /// Hands out pending payloads, at most the configured number per upkeep,
    /// and marks them visited. Payloads visited within the TTL stay queued.
    pub fn get_recoverables(&self) -> Vec<UpkeepPayload> {
        let inner = &self.inner;
        let ttl = inner.args.visited_ttl();
        let mut pending = inner.pending.lock();
        let mut visited = inner.visited.lock();
        let now = Instant::now();

        let mut per_upkeep: HashMap<UpkeepId, usize> = HashMap::new();
        let mut results = Vec::new();
        let mut remaining = Vec::new();
        for payload in pending.drain(..) {
            if Self::is_visited(&visited, &payload.work_id, ttl) {
                remaining.push(payload);
                continue;
            }
            let count = per_upkeep.entry(payload.upkeep_id).or_default();
            if *count >= inner.args.max_proposals_per_upkeep {
                remaining.push(payload);
                continue;
            }
            *count += 1;
            visited.insert(
                payload.work_id.clone(),
                VisitedRecord {
                    visited_at: now,
                    payload: payload.clone(),
                },
            );
            results.push(payload);
        }
        *pending = remaining;

        inner.metrics.pending_payloads.set(pending.len() as f64);
        inner.metrics.visited_entries.set(visited.len() as f64);
        results
    }

    /// Forgets visited entries older than the TTL. Those still inside the
    /// recovery window and not resolved are queued again. Entries are only
    /// forgotten once the head and their states were read, so a failed pass
    /// is retried on the next tick.
    pub async fn clean(&self, cancel: &CancellationToken) -> Result<(), RecovererError> {
        let inner = &self.inner;
        let ttl = inner.args.visited_ttl();
        let expired: Vec<(String, Instant, UpkeepPayload)> = inner
            .visited
            .lock()
            .iter()
            .filter(|(_, record)| record.visited_at.elapsed() >= ttl)
            .map(|(work_id, record)| (work_id.clone(), record.visited_at, record.payload.clone()))
            .collect();
        if expired.is_empty() {
            return Ok(());
        }

        let latest = self.latest_block(cancel).await?;
        let candidates: Vec<&UpkeepPayload> = match self.window(latest) {
            Some(window) => expired
                .iter()
                .map(|(_, _, payload)| payload)
                .filter(|p| window.contains(p.trigger.log_block_number()))
                .collect(),
            None => Vec::new(),
        };
        let resolved = match (
            candidates.iter().map(|p| p.trigger.log_block_number()).min(),
            candidates.iter().map(|p| p.trigger.log_block_number()).max(),
        ) {
            (Some(min_block), Some(max_block)) => {
                let upkeep_ids: Vec<UpkeepId> = candidates
                    .iter()
                    .map(|p| p.upkeep_id)
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                self.resolved_work_ids(cancel, &upkeep_ids, min_block, max_block)
                    .await?
            }
            _ => HashSet::new(),
        };
        let requeue: Vec<UpkeepPayload> = candidates
            .into_iter()
            .filter(|p| !resolved.contains(&p.work_id))
            .cloned()
            .collect();

        {
            let mut visited = inner.visited.lock();
            for (work_id, visited_at, _) in &expired {
                // entries visited again meanwhile are kept
                if visited
                    .get(work_id)
                    .is_some_and(|record| record.visited_at == *visited_at)
                {
                    visited.remove(work_id);
                }
            }
            inner.metrics.visited_entries.set(visited.len() as f64);
        }
        inner.metrics.visited_expired.increment(expired.len() as u64);

        let (added, _) = self.add_pending(requeue);
        debug!(
            target: "keeper::log_recoverer",
            expired = expired.len(),
            added,
            "re-queued expired visited payloads"
        );
        Ok(())
    }

    /// Rebuilds the check data of a log-trigger payload, provided its log is
    /// still inside the recovery window and its work is unresolved.
    pub async fn get_proposal_data(
        &self,
        cancel: &CancellationToken,
        payload: &UpkeepPayload,
    ) -> Result<Bytes, RecovererError> {
        let inner = &self.inner;
        let upkeep_id = payload.upkeep_id;
        let id = upkeep_id.to_u256();
        if !upkeep_id.is_log_trigger() {
            return Err(RecovererError::NotLogTriggerUpkeep(id));
        }
        let ext = payload
            .trigger
            .log_extension
            .ok_or(PayloadError::Trigger(TriggerError::MissingLogExtension))?;
        let filter = inner
            .filter_store
            .get(&id)
            .ok_or(RecovererError::FilterNotFound(id))?;

        let latest = self.latest_block(cancel).await?;
        let log_block = payload.trigger.log_block_number();
        let window = self.window(latest).unwrap_or(RecoveryWindow { start: 0, end: 0 });
        if latest < inner.args.lookback_blocks
            || !window.contains(log_block)
            || log_block < filter.config_update_block
        {
            return Err(RecovererError::LogBlockNotRecoverable {
                block: log_block,
                start: window.start,
                end: window.end,
            });
        }

        let resolved = self
            .resolved_work_ids(cancel, &[upkeep_id], log_block, log_block)
            .await?;
        if resolved.contains(&payload.work_id) {
            return Err(RecovererError::StateNotRecoverable(payload.work_id.clone()));
        }

        let logs = self.fetch_logs(cancel, &filter, log_block, log_block).await?;
        let log = logs
            .iter()
            .find(|log| {
                log.tx_hash == ext.tx_hash
                    && log.log_index == u64::from(ext.index)
                    && log.block_hash == ext.block_hash
            })
            .ok_or(RecovererError::LogNotFound {
                block: log_block,
                tx_hash: ext.tx_hash,
                log_index: ext.index,
            })?;
        let check_data = inner.packer.pack_log_data(log).map_err(PayloadError::from)?;
        Ok(check_data)
    }

    #[cfg(test)]
    fn pending(&self) -> Vec<UpkeepPayload> {
        self.inner.pending.lock().clone()
    }

    #[cfg(test)]
    fn visited_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.visited.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
