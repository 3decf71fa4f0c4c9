//! Interfaces to the chain-facing services this crate reads from.

use crate::{
    error::PollerError,
    primitives::{UpkeepId, UpkeepPayload, UpkeepState},
};
use alloy_primitives::{Address, B256, Bytes, Log};
use async_trait::async_trait;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

/// A log together with the block and transaction it was emitted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledLog {
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub inner: Log,
}

impl PolledLog {
    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn topics(&self) -> &[B256] {
        self.inner.data.topics()
    }

    pub fn data(&self) -> &Bytes {
        &self.inner.data.data
    }

    /// Logs are identified by block hash, transaction hash and log index.
    pub fn same_log(&self, other: &Self) -> bool {
        self.block_hash == other.block_hash
            && self.tx_hash == other.tx_hash
            && self.log_index == other.log_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolledBlock {
    pub number: u64,
    pub timestamp: u64,
}

/// Subscription registered with the log source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerFilter {
    pub name: String,
    pub event_sigs: Vec<B256>,
    pub addresses: Vec<Address>,
    pub topics: Vec<Vec<B256>>,
    pub retention: Duration,
}

#[async_trait]
pub trait LogPoller: Send + Sync + 'static {
    async fn register_filter(&self, filter: PollerFilter) -> Result<(), PollerError>;

    async fn unregister_filter(&self, name: &str) -> Result<(), PollerError>;

    async fn latest_block(&self) -> Result<u64, PollerError>;

    /// Logs in `start..=end` emitted by `address` whose first topic is one
    /// of `event_sigs`.
    async fn logs_with_sigs(
        &self,
        start: u64,
        end: u64,
        event_sigs: &[B256],
        address: Address,
    ) -> Result<Vec<PolledLog>, PollerError>;

    async fn get_blocks_range(&self, numbers: &[u64]) -> Result<Vec<PolledBlock>, PollerError>;
}

#[async_trait]
pub trait UpkeepStateReader: Send + Sync + 'static {
    /// Returns matching payloads and their states, index aligned.
    async fn select_by_upkeep_ids_and_block_range(
        &self,
        upkeep_ids: &[UpkeepId],
        start: u64,
        end: u64,
    ) -> Result<(Vec<UpkeepPayload>, Vec<UpkeepState>), PollerError>;
}

/// Races `fut` against `cancel`.
pub(crate) async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, PollerError>>,
) -> Result<T, PollerError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PollerError::Cancelled),
        res = fut => res,
    }
}
