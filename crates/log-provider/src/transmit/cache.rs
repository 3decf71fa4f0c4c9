use super::TransmitEvent;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct CacheBlock {
    block: u64,
    records: HashMap<String, TransmitEvent>,
}

/// Ring of recently seen transmit events keyed by block, slot `block % size`.
/// Writing a newer block into a slot drops what the slot held, writes for an
/// older block are ignored.
#[derive(Debug)]
pub struct TransmitEventCache {
    blocks: RwLock<Vec<CacheBlock>>,
}

impl TransmitEventCache {
    pub fn new(size: usize) -> Self {
        Self {
            blocks: RwLock::new(vec![CacheBlock::default(); size.max(1)]),
        }
    }

    pub fn get(&self, block: u64, log_id: &str) -> Option<TransmitEvent> {
        let blocks = self.blocks.read();
        let slot = &blocks[(block % blocks.len() as u64) as usize];
        if slot.block != block {
            return None;
        }
        slot.records.get(log_id).cloned()
    }

    pub fn add(&self, log_id: String, event: TransmitEvent) {
        let mut blocks = self.blocks.write();
        let size = blocks.len() as u64;
        let slot = &mut blocks[(event.transmit_block % size) as usize];
        if slot.block > event.transmit_block {
            return;
        }
        if slot.block < event.transmit_block || slot.records.is_empty() {
            slot.block = event.transmit_block;
            slot.records.clear();
        }
        slot.records.insert(log_id, event);
    }
}
