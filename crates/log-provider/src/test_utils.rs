use crate::{
    block_limiter::BlockLimiter,
    error::{PackError, PollerError},
    filter_store::UpkeepFilter,
    packer::LogDataPacker,
    poller::{LogPoller, PolledBlock, PolledLog, PollerFilter, UpkeepStateReader},
    primitives::{UpkeepId, UpkeepPayload, UpkeepState, UpkeepType},
};
use alloy_primitives::{Address, B256, Bytes, Log, U256, keccak256};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

pub(crate) struct LogBuilder {
    address: Address,
    topic0: B256,
    topics: Vec<B256>,
    block_number: u64,
    block_hash: Option<B256>,
    timestamp: u64,
    index: u64,
    data: Bytes,
}

/// Log emitted by `address` with event signature `topic0` in `block_number`.
pub(crate) fn make_log(address: Address, topic0: B256, block_number: u64) -> LogBuilder {
    LogBuilder {
        address,
        topic0,
        topics: Vec::new(),
        block_number,
        block_hash: None,
        timestamp: block_number,
        index: 0,
        data: Bytes::new(),
    }
}

impl LogBuilder {
    pub(crate) fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    pub(crate) fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub(crate) fn with_block_hash(mut self, block_hash: B256) -> Self {
        self.block_hash = Some(block_hash);
        self
    }

    /// Indexed topics following the event signature.
    pub(crate) fn with_topics(mut self, topics: Vec<B256>) -> Self {
        self.topics = topics;
        self
    }

    pub(crate) fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }

    pub(crate) fn build(self) -> PolledLog {
        let mut topics = vec![self.topic0];
        topics.extend(self.topics);
        PolledLog {
            block_number: self.block_number,
            block_hash: self
                .block_hash
                .unwrap_or_else(|| block_hash(self.block_number)),
            block_timestamp: self.timestamp,
            tx_hash: keccak256([self.block_number.to_be_bytes(), self.index.to_be_bytes()].concat()),
            log_index: self.index,
            inner: Log::new_unchecked(self.address, topics, self.data),
        }
    }
}

pub(crate) fn block_hash(block_number: u64) -> B256 {
    keccak256(block_number.to_be_bytes())
}

pub(crate) fn log_upkeep_id(seed: u64) -> UpkeepId {
    UpkeepId::generate(UpkeepType::LogTrigger, &seed.to_be_bytes())
}

/// Filter on a contract derived from `id` for event `0xaa..`, no topic selection.
pub(crate) fn make_filter(id: u64) -> UpkeepFilter {
    UpkeepFilter::new(
        U256::from(id),
        Address::with_last_byte(id as u8),
        [B256::with_last_byte(0xaa), B256::ZERO, B256::ZERO, B256::ZERO],
        0,
        BlockLimiter::new(1.0, 100),
        0,
    )
}

#[derive(Debug, Default)]
pub(crate) struct MockLogPoller {
    latest: Mutex<Option<u64>>,
    logs: Mutex<Vec<PolledLog>>,
    logs_error: Mutex<Option<String>>,
    register_error: Mutex<Option<String>>,
    blocks: Mutex<HashMap<u64, u64>>,
    filters: Mutex<Vec<PollerFilter>>,
    queries: Mutex<Vec<(u64, u64, Address)>>,
    latest_calls: AtomicUsize,
}

impl MockLogPoller {
    pub(crate) fn with_latest(latest: u64) -> Self {
        let poller = Self::default();
        poller.set_latest(Some(latest));
        poller
    }

    /// `None` makes `latest_block` fail.
    pub(crate) fn set_latest(&self, latest: Option<u64>) {
        *self.latest.lock() = latest;
    }

    pub(crate) fn add_logs(&self, logs: impl IntoIterator<Item = PolledLog>) {
        self.logs.lock().extend(logs);
    }

    pub(crate) fn fail_logs(&self, err: Option<&str>) {
        *self.logs_error.lock() = err.map(str::to_string);
    }

    pub(crate) fn fail_register(&self, err: Option<&str>) {
        *self.register_error.lock() = err.map(str::to_string);
    }

    /// Blocks `from..=to` spaced `block_time` seconds apart.
    pub(crate) fn add_blocks(&self, from: u64, to: u64, block_time: u64) {
        let mut blocks = self.blocks.lock();
        for number in from..=to {
            blocks.insert(number, number * block_time);
        }
    }

    pub(crate) fn filter_names(&self) -> Vec<String> {
        self.filters.lock().iter().map(|f| f.name.clone()).collect()
    }

    pub(crate) fn filters(&self) -> Vec<PollerFilter> {
        self.filters.lock().clone()
    }

    /// `(start, end, address)` of every log query.
    pub(crate) fn queries(&self) -> Vec<(u64, u64, Address)> {
        self.queries.lock().clone()
    }

    pub(crate) fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LogPoller for MockLogPoller {
    async fn register_filter(&self, filter: PollerFilter) -> Result<(), PollerError> {
        if let Some(err) = self.register_error.lock().clone() {
            return Err(PollerError::Rpc(err));
        }
        let mut filters = self.filters.lock();
        filters.retain(|f| f.name != filter.name);
        filters.push(filter);
        Ok(())
    }

    async fn unregister_filter(&self, name: &str) -> Result<(), PollerError> {
        self.filters.lock().retain(|f| f.name != name);
        Ok(())
    }

    async fn latest_block(&self) -> Result<u64, PollerError> {
        self.latest_calls.fetch_add(1, Ordering::Relaxed);
        self.latest
            .lock()
            .ok_or_else(|| PollerError::Rpc("head not available".to_string()))
    }

    async fn logs_with_sigs(
        &self,
        start: u64,
        end: u64,
        event_sigs: &[B256],
        address: Address,
    ) -> Result<Vec<PolledLog>, PollerError> {
        self.queries.lock().push((start, end, address));
        if let Some(err) = self.logs_error.lock().clone() {
            return Err(PollerError::Rpc(err));
        }
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|log| {
                (start..=end).contains(&log.block_number)
                    && log.address() == address
                    && log.topics().first().is_some_and(|t| event_sigs.contains(t))
            })
            .cloned()
            .collect())
    }

    async fn get_blocks_range(&self, numbers: &[u64]) -> Result<Vec<PolledBlock>, PollerError> {
        let blocks = self.blocks.lock();
        Ok(numbers
            .iter()
            .filter_map(|number| {
                blocks.get(number).map(|timestamp| PolledBlock {
                    number: *number,
                    timestamp: *timestamp,
                })
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockStateReader {
    states: Mutex<HashMap<String, (UpkeepPayload, UpkeepState)>>,
    error: Mutex<Option<String>>,
}

impl MockStateReader {
    pub(crate) fn set_state(&self, payload: UpkeepPayload, state: UpkeepState) {
        self.states
            .lock()
            .insert(payload.work_id.clone(), (payload, state));
    }

    pub(crate) fn fail(&self, err: Option<&str>) {
        *self.error.lock() = err.map(str::to_string);
    }
}

#[async_trait]
impl UpkeepStateReader for MockStateReader {
    async fn select_by_upkeep_ids_and_block_range(
        &self,
        upkeep_ids: &[UpkeepId],
        start: u64,
        end: u64,
    ) -> Result<(Vec<UpkeepPayload>, Vec<UpkeepState>), PollerError> {
        if let Some(err) = self.error.lock().clone() {
            return Err(PollerError::Rpc(err));
        }
        Ok(self
            .states
            .lock()
            .values()
            .filter(|(payload, _)| {
                upkeep_ids.contains(&payload.upkeep_id)
                    && (start..=end).contains(&payload.trigger.log_block_number())
            })
            .cloned()
            .unzip())
    }
}

/// Packs the log index only, fails for logs with index `u64::MAX`.
#[derive(Debug, Default)]
pub(crate) struct MockPacker;

impl LogDataPacker for MockPacker {
    fn pack_log_data(&self, log: &PolledLog) -> Result<Bytes, PackError> {
        if log.log_index == u64::MAX {
            return Err(PackError("unpackable log".to_string()));
        }
        Ok(Bytes::copy_from_slice(&log.log_index.to_be_bytes()))
    }
}

pub(crate) fn new_provider(
    poller: std::sync::Arc<MockLogPoller>,
    args: crate::LogProviderArgs,
) -> crate::LogEventProvider {
    crate::LogEventProvider::new(
        args,
        poller,
        std::sync::Arc::new(MockPacker),
        std::sync::Arc::new(crate::UpkeepFilterStore::new()),
    )
}
