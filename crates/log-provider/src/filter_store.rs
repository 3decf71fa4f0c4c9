use crate::{block_limiter::BlockLimiter, poller::PolledLog};
use alloy_primitives::{Address, B256, U256};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};

/// Log filter and polling progress of one log-triggered upkeep.
#[derive(Debug, Clone)]
pub struct UpkeepFilter {
    pub upkeep_id: U256,
    pub addr: Address,
    /// Event signature followed by the three indexed topic values.
    pub topics: [B256; 4],
    /// Bit `i` requires `topics[i + 1]` to match the log's topic at the same
    /// position.
    pub selector: u8,
    pub block_limiter: Arc<Mutex<BlockLimiter>>,
    pub last_poll_block: u64,
    pub last_re_poll_block: u64,
    /// Block at which the trigger config was last set. Logs before it are
    /// never considered.
    pub config_update_block: u64,
}

impl UpkeepFilter {
    pub fn new(
        upkeep_id: U256,
        addr: Address,
        topics: [B256; 4],
        selector: u8,
        block_limiter: BlockLimiter,
        config_update_block: u64,
    ) -> Self {
        Self {
            upkeep_id,
            addr,
            topics,
            selector,
            block_limiter: Arc::new(Mutex::new(block_limiter)),
            last_poll_block: 0,
            last_re_poll_block: 0,
            config_update_block,
        }
    }

    pub fn event_sigs(&self) -> Vec<B256> {
        vec![self.topics[0]]
    }

    /// Required values for the selected topic positions, `None` where any
    /// value is accepted.
    pub fn selected_topics(&self) -> [Option<B256>; 3] {
        std::array::from_fn(|i| (self.selector & (1 << i) != 0).then_some(self.topics[i + 1]))
    }

    pub fn matches(&self, log: &PolledLog) -> bool {
        if log.address() != self.addr {
            return false;
        }
        let topics = log.topics();
        if topics.first() != Some(&self.topics[0]) {
            return false;
        }
        self.selected_topics()
            .iter()
            .enumerate()
            .all(|(i, wanted)| match wanted {
                Some(value) => topics.get(i + 1) == Some(value),
                None => true,
            })
    }

    /// Keeps the logs this filter cares about.
    pub fn select(&self, logs: Vec<PolledLog>) -> Vec<PolledLog> {
        logs.into_iter().filter(|log| self.matches(log)).collect()
    }
}

/// Active upkeep filters keyed by upkeep ID.
#[derive(Debug, Default)]
pub struct UpkeepFilterStore {
    filters: RwLock<HashMap<U256, UpkeepFilter>>,
}

impl UpkeepFilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces filters.
    pub fn add_active_upkeeps(&self, filters: impl IntoIterator<Item = UpkeepFilter>) {
        let mut store = self.filters.write();
        for filter in filters {
            store.insert(filter.upkeep_id, filter);
        }
    }

    /// Inserts `filter` unless one already exists for its upkeep.
    pub fn add_if_absent(&self, filter: UpkeepFilter) -> bool {
        let mut store = self.filters.write();
        if store.contains_key(&filter.upkeep_id) {
            return false;
        }
        store.insert(filter.upkeep_id, filter);
        true
    }

    pub fn remove_active_upkeeps(&self, upkeep_ids: &[U256]) {
        let mut store = self.filters.write();
        for id in upkeep_ids {
            store.remove(id);
        }
    }

    pub fn has(&self, upkeep_id: &U256) -> bool {
        self.filters.read().contains_key(upkeep_id)
    }

    pub fn get(&self, upkeep_id: &U256) -> Option<UpkeepFilter> {
        self.filters.read().get(upkeep_id).cloned()
    }

    pub fn get_ids(&self, pred: impl Fn(&UpkeepFilter) -> bool) -> Vec<U256> {
        self.filters
            .read()
            .values()
            .filter(|f| pred(f))
            .map(|f| f.upkeep_id)
            .collect()
    }

    pub fn get_filters(&self, pred: impl Fn(&UpkeepFilter) -> bool) -> Vec<UpkeepFilter> {
        self.filters
            .read()
            .values()
            .filter(|f| pred(f))
            .cloned()
            .collect()
    }

    /// Calls `f` with each requested position and a copy of its filter, or
    /// `None` when the upkeep has no filter. `f` runs without the store lock.
    pub fn range_filters_by_ids(
        &self,
        mut f: impl FnMut(usize, Option<UpkeepFilter>),
        upkeep_ids: &[U256],
    ) {
        let snapshot: Vec<_> = {
            let store = self.filters.read();
            upkeep_ids.iter().map(|id| store.get(id).cloned()).collect()
        };
        for (i, filter) in snapshot.into_iter().enumerate() {
            f(i, filter);
        }
    }

    /// Merges polling progress back into the store, keeping the furthest
    /// progress of each field. Upkeeps removed in the meantime are skipped.
    pub fn update_filters(&self, updates: &[UpkeepFilter]) {
        self.update_filters_with(
            |mut current, update| {
                current.last_poll_block = current.last_poll_block.max(update.last_poll_block);
                current.last_re_poll_block =
                    current.last_re_poll_block.max(update.last_re_poll_block);
                current
            },
            updates,
        )
    }

    pub fn update_filters_with(
        &self,
        resolve: impl Fn(UpkeepFilter, &UpkeepFilter) -> UpkeepFilter,
        updates: &[UpkeepFilter],
    ) {
        let mut store = self.filters.write();
        for update in updates {
            if let Some(current) = store.remove(&update.upkeep_id) {
                store.insert(update.upkeep_id, resolve(current, update));
            }
        }
    }

    pub fn size(&self) -> usize {
        self.filters.read().len()
    }
}
