//! Tracks registry events reporting what happened to transmitted reports.

use crate::{
    args::TransmitArgs,
    error::{PollerError, TransmitError},
    metrics::TransmitMetrics,
    poller::{LogPoller, PolledLog, PollerFilter, with_cancel},
    primitives::{UpkeepId, unpack_trigger, work_id},
};
use alloy_primitives::{Address, B256};
use std::{collections::HashSet, fmt, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod cache;
mod events;

pub use cache::TransmitEventCache;
pub use events::{
    DedupKeyAdded, InsufficientFundsUpkeepReport, ReorgedUpkeepReport, StaleUpkeepReport,
    TRANSMIT_EVENT_SIGS, TransmitEventType, UpkeepPerformed,
};

const FILTER_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// A transmit outcome observed on-chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransmitEvent {
    pub kind: TransmitEventType,
    pub transmit_block: u64,
    pub confirmations: u64,
    pub tx_hash: B256,
    pub upkeep_id: UpkeepId,
    pub work_id: String,
    pub check_block: u64,
}

pub struct TransmitEventProvider {
    args: TransmitArgs,
    registry_address: Address,
    poller: Arc<dyn LogPoller>,
    cache: TransmitEventCache,
    metrics: TransmitMetrics,
}

impl fmt::Debug for TransmitEventProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmitEventProvider")
            .field("args", &self.args)
            .field("registry_address", &self.registry_address)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl TransmitEventProvider {
    pub fn new(args: TransmitArgs, registry_address: Address, poller: Arc<dyn LogPoller>) -> Self {
        Self {
            cache: TransmitEventCache::new(args.cache_size),
            args,
            registry_address,
            poller,
            metrics: Default::default(),
        }
    }

    pub fn filter_name(&self) -> String {
        format!("TransmitEventProvider - {}", self.registry_address)
    }

    /// Subscribes the log source to the registry's transmit events.
    pub async fn register_filter(&self) -> Result<(), TransmitError> {
        self.poller
            .register_filter(PollerFilter {
                name: self.filter_name(),
                event_sigs: TRANSMIT_EVENT_SIGS.to_vec(),
                addresses: vec![self.registry_address],
                topics: Vec::new(),
                retention: FILTER_RETENTION,
            })
            .await
            .map_err(TransmitError::Poller)
    }

    /// Transmit events within the lookback window not returned by earlier
    /// calls.
    pub async fn get_latest_events(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<TransmitEvent>, TransmitError> {
        let latest = with_cancel(cancel, self.poller.latest_block())
            .await
            .map_err(|e| match e {
                PollerError::Cancelled => TransmitError::Cancelled,
                e => TransmitError::HeadNotAvailable(e),
            })?;
        let start = latest.saturating_sub(self.args.lookback_blocks);
        let logs = with_cancel(
            cancel,
            self.poller
                .logs_with_sigs(start, latest, &TRANSMIT_EVENT_SIGS, self.registry_address),
        )
        .await
        .map_err(|e| match e {
            PollerError::Cancelled => TransmitError::Cancelled,
            e => TransmitError::FetchLogs(e),
        })?;

        Ok(self.process_logs(latest, logs))
    }

    fn process_logs(&self, latest: u64, logs: Vec<PolledLog>) -> Vec<TransmitEvent> {
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();

        for log in logs {
            let log_id = format!("{}:{}", log.tx_hash, log.log_index);
            if !seen.insert(log_id.clone()) || self.cache.get(log.block_number, &log_id).is_some()
            {
                continue;
            }
            match Self::parse_event(latest, &log) {
                Ok(event) => fresh.push((log_id, event)),
                Err(e) => {
                    self.metrics.parse_errors.increment(1);
                    debug!(
                        target: "keeper::transmit",
                        tx_hash = %log.tx_hash,
                        log_index = log.log_index,
                        "skipping transmit log: {e}"
                    );
                }
            }
        }

        let events: Vec<_> = fresh
            .into_iter()
            .map(|(log_id, event)| {
                self.cache.add(log_id, event.clone());
                event
            })
            .collect();
        self.metrics.events_returned.increment(events.len() as u64);
        events
    }

    fn parse_event(latest: u64, log: &PolledLog) -> Result<TransmitEvent, TransmitError> {
        let decoded = events::decode_transmit_log(log)?;
        let upkeep_id = UpkeepId::from(decoded.upkeep_id);
        upkeep_id.upkeep_type()?;
        let trigger = unpack_trigger(&upkeep_id, &decoded.trigger)?;
        Ok(TransmitEvent {
            kind: decoded.kind,
            transmit_block: log.block_number,
            confirmations: latest.saturating_sub(log.block_number),
            tx_hash: log.tx_hash,
            upkeep_id,
            work_id: work_id(&upkeep_id, &trigger),
            check_block: trigger.block_number,
        })
    }
}

#[cfg(test)]
mod tests;
