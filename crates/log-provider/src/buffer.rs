//! Fixed-size ring of recent blocks holding logs fetched for upkeeps.
//!
//! A block lives in slot `(number - 1) % size`. Writing a newer block into an
//! occupied slot evicts the older block, writes for blocks older than the slot
//! content are dropped. Logs move from the unvisited to the visited list when
//! dequeued so later enqueues of the same log are recognized as duplicates.

use crate::poller::PolledLog;
use alloy_primitives::U256;
use parking_lot::RwLock;
use std::{collections::HashMap, ops::RangeInclusive};

/// A log fetched on behalf of an upkeep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedLog {
    pub upkeep_id: U256,
    pub log: PolledLog,
}

#[derive(Debug, Clone, Default)]
struct FetchedBlock {
    block_number: u64,
    logs: Vec<FetchedLog>,
    visited: Vec<FetchedLog>,
}

impl FetchedBlock {
    fn reset(&mut self, block_number: u64) {
        self.block_number = block_number;
        self.logs.clear();
        self.visited.clear();
    }

    fn total(&self) -> usize {
        self.logs.len() + self.visited.len()
    }

    /// Whether `log` is already held for `upkeep_id`, and how many logs the
    /// upkeep holds in this block.
    fn has(&self, upkeep_id: &U256, log: &PolledLog) -> (bool, usize) {
        let mut exists = false;
        let mut count = 0;
        for fetched in self.logs.iter().chain(self.visited.iter()) {
            if fetched.upkeep_id != *upkeep_id {
                continue;
            }
            count += 1;
            if fetched.log.same_log(log) {
                exists = true;
            }
        }
        (exists, count)
    }
}

#[derive(Debug)]
struct BufferState {
    blocks: Vec<FetchedBlock>,
    latest_block_seen: u64,
}

#[derive(Debug)]
pub struct LogEventBuffer {
    state: RwLock<BufferState>,
    max_block_logs: usize,
    max_upkeep_logs_per_block: usize,
}

impl LogEventBuffer {
    pub fn new(size: usize, max_block_logs: usize, max_upkeep_logs_per_block: usize) -> Self {
        Self {
            state: RwLock::new(BufferState {
                blocks: vec![FetchedBlock::default(); size.max(1)],
                latest_block_seen: 0,
            }),
            max_block_logs,
            max_upkeep_logs_per_block,
        }
    }

    pub fn size(&self) -> usize {
        self.state.read().blocks.len()
    }

    /// Highest block number offered to [`Self::enqueue`], including blocks
    /// whose logs were all dropped by the caps.
    pub fn latest_block_seen(&self) -> u64 {
        self.state.read().latest_block_seen
    }

    /// Adds logs for `upkeep_id`, returns how many were accepted. Logs from
    /// block zero, from blocks already evicted, duplicates and logs over the
    /// block or per-upkeep caps are dropped.
    pub fn enqueue(&self, upkeep_id: U256, logs: impl IntoIterator<Item = PolledLog>) -> usize {
        let mut state = self.state.write();
        let size = state.blocks.len() as u64;
        let mut max_block = state.latest_block_seen;
        let mut added = 0;

        for log in logs {
            if log.block_number == 0 {
                continue;
            }
            let slot = ((log.block_number - 1) % size) as usize;
            let block = &mut state.blocks[slot];
            if block.block_number < log.block_number {
                block.reset(log.block_number);
            } else if block.block_number > log.block_number {
                // slot already holds a newer block
                continue;
            }
            max_block = max_block.max(log.block_number);
            if block.total() >= self.max_block_logs {
                continue;
            }
            let (exists, upkeep_logs) = block.has(&upkeep_id, &log);
            if exists || upkeep_logs >= self.max_upkeep_logs_per_block {
                continue;
            }
            block.logs.push(FetchedLog { upkeep_id, log });
            added += 1;
        }

        state.latest_block_seen = max_block;
        added
    }

    /// Whether `log` is held for `upkeep_id`, visited or not.
    pub fn has(&self, upkeep_id: &U256, log: &PolledLog) -> bool {
        let state = self.state.read();
        if log.block_number == 0 {
            return false;
        }
        let slot = ((log.block_number - 1) % state.blocks.len() as u64) as usize;
        let block = &state.blocks[slot];
        block.block_number == log.block_number && block.has(upkeep_id, log).0
    }

    /// Unvisited logs in `start..=end`, ascending by block, without consuming
    /// them.
    pub fn peek_range(&self, start: u64, end: u64) -> Vec<FetchedLog> {
        let state = self.state.read();
        let mut results = Vec::new();
        for block_number in Self::window(state.blocks.len(), start, end) {
            let block = &state.blocks[Self::slot(state.blocks.len(), block_number)];
            if block.block_number == block_number {
                results.extend(block.logs.iter().cloned());
            }
        }
        results
    }

    /// Consumes unvisited logs in `start..=end`, newest blocks first, taking at
    /// most `upkeep_limit` logs per upkeep. Taken logs become visited. Results
    /// are ascending by block.
    pub fn dequeue_range(&self, start: u64, end: u64, upkeep_limit: usize) -> Vec<FetchedLog> {
        let mut state = self.state.write();
        let size = state.blocks.len();
        let mut taken_per_upkeep: HashMap<U256, usize> = HashMap::new();
        let mut results = Vec::new();

        for block_number in Self::window(size, start, end).rev() {
            let block = &mut state.blocks[Self::slot(size, block_number)];
            if block.block_number != block_number || block.logs.is_empty() {
                continue;
            }
            let mut remaining = Vec::with_capacity(block.logs.len());
            for fetched in block.logs.drain(..) {
                let taken = taken_per_upkeep.entry(fetched.upkeep_id).or_default();
                if *taken >= upkeep_limit {
                    remaining.push(fetched);
                    continue;
                }
                *taken += 1;
                block.visited.push(fetched.clone());
                results.push(fetched);
            }
            block.logs = remaining;
        }

        results.sort_by_key(|fetched| fetched.log.block_number);
        results
    }

    fn slot(size: usize, block_number: u64) -> usize {
        ((block_number - 1) % size as u64) as usize
    }

    /// Block numbers in `start..=end` that can still be held by a buffer of
    /// `size` blocks ending at `end`.
    fn window(size: usize, start: u64, end: u64) -> RangeInclusive<u64> {
        let lowest = end.saturating_sub(size as u64 - 1);
        start.max(lowest).max(1)..=end
    }
}
