//! Polls logs for registered log-trigger upkeeps and turns them into payloads.
//!
//! Filters are read in partitions on a fixed interval: each tick picks one
//! partition of the registered filters, splits it into batches and queues the
//! batches for a pool of readers. Readers fetch logs from the last polled
//! block (minus a reorg buffer) up to the head and store them in the
//! [`LogEventBuffer`]. [`LogEventProvider::get_latest_payloads`] drains the
//! buffer into payloads.

use crate::{
    args::LogProviderArgs,
    buffer::LogEventBuffer,
    error::{LogProviderError, PollerError, ReadLogsErrors},
    filter_store::{UpkeepFilter, UpkeepFilterStore},
    metrics::LogProviderMetrics,
    packer::{LogDataPacker, build_payload},
    poller::{LogPoller, with_cancel},
    primitives::UpkeepPayload,
    tasks::BackgroundTasks,
};
use alloy_primitives::{Address, U256, keccak256};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Instant};
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod registration;

pub use registration::{FilterOptions, LogTriggerConfig};

struct LogEventProviderInner {
    args: LogProviderArgs,
    poller: Arc<dyn LogPoller>,
    packer: Arc<dyn LogDataPacker>,
    buffer: LogEventBuffer,
    filter_store: Arc<UpkeepFilterStore>,
    tasks: Mutex<Option<BackgroundTasks>>,
    metrics: LogProviderMetrics,
}

impl fmt::Debug for LogEventProviderInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEventProviderInner")
            .field("args", &self.args)
            .field("packer", &self.packer)
            .field("buffer", &self.buffer)
            .field("filter_store", &self.filter_store)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct LogEventProvider {
    inner: Arc<LogEventProviderInner>,
}

impl LogEventProvider {
    pub fn new(
        args: LogProviderArgs,
        poller: Arc<dyn LogPoller>,
        packer: Arc<dyn LogDataPacker>,
        filter_store: Arc<UpkeepFilterStore>,
    ) -> Self {
        let buffer = LogEventBuffer::new(
            args.buffer_size(),
            args.max_logs_per_block,
            args.max_upkeep_logs_per_block,
        );
        Self {
            inner: Arc::new(LogEventProviderInner {
                args,
                poller,
                packer,
                buffer,
                filter_store,
                tasks: Mutex::new(None),
                metrics: Default::default(),
            }),
        }
    }

    /// Filters shared with the recoverer.
    pub fn filter_store(&self) -> &Arc<UpkeepFilterStore> {
        &self.inner.filter_store
    }

    pub fn buffer(&self) -> &LogEventBuffer {
        &self.inner.buffer
    }

    /// Starts the read scheduler and its readers.
    pub fn start(&self) -> Result<(), LogProviderError> {
        let mut guard = self.inner.tasks.lock();
        if guard.is_some() {
            return Err(LogProviderError::AlreadyStarted);
        }
        let args = &self.inner.args;
        let mut tasks = BackgroundTasks::new();
        let (tx, rx) = mpsc::channel(args.read_queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..args.read_workers.max(1) {
            tasks.spawn(self.clone().run_reader(worker, rx.clone(), tasks.token()));
        }
        tasks.spawn(self.clone().run_scheduler(tx, tasks.token()));
        *guard = Some(tasks);

        info!(
            target: "keeper::log_provider",
            workers = args.read_workers.max(1),
            interval = ?args.read_interval(),
            "log event provider started"
        );
        Ok(())
    }

    /// Stops background reads and waits for in-flight reads to finish.
    pub async fn stop(&self) {
        let tasks = self.inner.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown("log_provider").await;
            info!(target: "keeper::log_provider", "log event provider stopped");
        }
    }

    /// Drains buffered logs from the lookback window into payloads.
    pub fn get_latest_payloads(&self) -> Vec<UpkeepPayload> {
        let inner = &self.inner;
        let latest = inner.buffer.latest_block_seen();
        let start = latest.saturating_sub(inner.args.lookback_blocks).max(1);
        let logs = inner
            .buffer
            .dequeue_range(start, latest, inner.args.max_payloads_per_upkeep);

        let payloads: Vec<_> = logs
            .into_iter()
            .filter_map(|fetched| {
                match build_payload(inner.packer.as_ref(), fetched.upkeep_id, &fetched.log) {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(
                            target: "keeper::log_provider",
                            upkeep_id = %fetched.upkeep_id,
                            block = fetched.log.block_number,
                            "dropping log: {e}"
                        );
                        None
                    }
                }
            })
            .collect();
        inner.metrics.payloads_returned.increment(payloads.len() as u64);
        payloads
    }

    /// Reads logs for `upkeep_ids` up to the current head. Without `force`
    /// filters already polled at the head are skipped. Failures of individual
    /// filters are collected and returned together once every filter was
    /// attempted.
    pub async fn read_logs(
        &self,
        cancel: &CancellationToken,
        force: bool,
        upkeep_ids: &[U256],
    ) -> Result<(), LogProviderError> {
        let inner = &self.inner;
        let latest = with_cancel(cancel, inner.poller.latest_block())
            .await
            .map_err(|e| match e {
                PollerError::Cancelled => LogProviderError::Cancelled,
                e => LogProviderError::HeadNotAvailable(e),
            })?;

        let mut filters = Vec::with_capacity(upkeep_ids.len());
        inner.filter_store.range_filters_by_ids(
            |_, filter| {
                if let Some(filter) = filter
                    && filter.config_update_block <= latest
                    && (force || filter.last_poll_block < latest)
                {
                    filters.push(filter);
                }
            },
            upkeep_ids,
        );
        if filters.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let errors = self.read_filters(cancel, latest, &mut filters).await;
        inner.filter_store.update_filters(&filters);
        inner.metrics.read_duration.record(started.elapsed());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LogProviderError::ReadLogs(errors))
        }
    }

    async fn read_filters(
        &self,
        cancel: &CancellationToken,
        latest: u64,
        filters: &mut [UpkeepFilter],
    ) -> ReadLogsErrors {
        let inner = &self.inner;
        let lookback = inner.args.lookback_blocks;
        let mut errors = ReadLogsErrors::default();

        for filter in filters.iter_mut() {
            let (start, reservation) = {
                let mut limiter = filter.block_limiter.lock();
                let stale = filter.last_poll_block == 0
                    || filter.last_poll_block < latest.saturating_sub(lookback);
                let start = if stale {
                    latest.saturating_sub(2 * lookback)
                } else {
                    filter.last_poll_block
                };
                let span = latest.saturating_sub(start);
                let burst = limiter.burst();
                if stale && span > burst {
                    limiter.set_burst(span);
                }
                let reservation = limiter.try_reserve(span);
                limiter.set_burst(burst);
                (start, reservation)
            };
            let reservation = match reservation {
                Ok(reservation) => reservation,
                Err(e) => {
                    debug!(
                        target: "keeper::log_provider",
                        upkeep_id = %filter.upkeep_id,
                        requested = e.requested,
                        available = e.available,
                        "block limit exceeded"
                    );
                    inner.metrics.block_limit_exceeded.increment(1);
                    errors
                        .0
                        .push(LogProviderError::BlockLimitExceeded(filter.upkeep_id));
                    continue;
                }
            };

            let query_start = start
                .saturating_sub(inner.args.reorg_buffer_blocks)
                .max(filter.config_update_block);
            let logs = match with_cancel(
                cancel,
                inner
                    .poller
                    .logs_with_sigs(query_start, latest, &filter.event_sigs(), filter.addr),
            )
            .await
            {
                Ok(logs) => logs,
                Err(PollerError::Cancelled) => {
                    filter.block_limiter.lock().cancel(reservation);
                    errors.0.push(LogProviderError::Cancelled);
                    break;
                }
                Err(source) => {
                    filter.block_limiter.lock().cancel(reservation);
                    inner.metrics.fetch_errors.increment(1);
                    errors.0.push(LogProviderError::FetchLogs {
                        upkeep_id: filter.upkeep_id,
                        source,
                    });
                    continue;
                }
            };

            let logs = filter.select(logs);
            let found = logs.len();
            let added = inner.buffer.enqueue(filter.upkeep_id, logs.iter().cloned());
            inner.metrics.logs_enqueued.increment(added as u64);
            // logs dropped by the buffer caps are read again on the next poll
            if added > 0 || logs.iter().all(|log| inner.buffer.has(&filter.upkeep_id, log)) {
                filter.last_poll_block = latest;
            }
            debug!(
                target: "keeper::log_provider",
                upkeep_id = %filter.upkeep_id,
                start = query_start,
                end = latest,
                found,
                added,
                "read upkeep logs"
            );
        }

        errors
    }

    async fn run_scheduler(self, tx: mpsc::Sender<Vec<U256>>, cancel: CancellationToken) {
        let batch_size = self.inner.args.read_batch_size.max(1);
        let mut ticker = interval(self.inner.args.read_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut partition = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(target: "keeper::log_provider", "read scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let ids = self.partition_ids(partition);
                    partition = partition.wrapping_add(1);
                    for batch in ids.chunks(batch_size) {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            res = tx.send(batch.to_vec()) => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// IDs of the filters in the partition selected by `counter`. Filters are
    /// partitioned by contract address so upkeeps sharing a contract are read
    /// together.
    fn partition_ids(&self, counter: u64) -> Vec<U256> {
        let store = &self.inner.filter_store;
        let partitions = (store.size() / self.inner.args.read_batch_size.max(1)).max(1) as u64;
        let partition = counter % partitions;
        store.get_ids(|f| address_partition(&f.addr, partitions) == partition)
    }

    async fn run_reader(
        self,
        worker: usize,
        jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<U256>>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                job = async { jobs.lock().await.recv().await } => job,
            };
            let Some(ids) = job else {
                return;
            };
            match self.read_logs(&cancel, true, &ids).await {
                Ok(()) => {}
                Err(_) if cancel.is_cancelled() => return,
                Err(e) if e.is_rate_limited() => {
                    debug!(target: "keeper::log_provider", worker, "read rate limited: {e}")
                }
                Err(e) => warn!(target: "keeper::log_provider", worker, "failed to read logs: {e}"),
            }
        }
    }
}

fn address_partition(addr: &Address, partitions: u64) -> u64 {
    let hash = keccak256(addr);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(prefix) % partitions
}
