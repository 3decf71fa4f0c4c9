use crate::{
    error::{PackError, PayloadError},
    poller::PolledLog,
    primitives::{LogTriggerExtension, Trigger, TriggerError, UpkeepId, UpkeepPayload, UpkeepType},
};
use alloy_primitives::{Bytes, U256};
use alloy_sol_types::SolValue;
use std::fmt::Debug;

mod abi {
    alloy_sol_types::sol! {
        struct Log {
            uint256 index;
            uint256 timestamp;
            bytes32 txHash;
            uint256 blockNumber;
            bytes32 blockHash;
            address source;
            bytes32[] topics;
            bytes data;
        }
    }
}

/// Serializes a log into the check data handed to the upkeep.
pub trait LogDataPacker: Send + Sync + Debug {
    fn pack_log_data(&self, log: &PolledLog) -> Result<Bytes, PackError>;
}

/// ABI encodes the log as the `Log` struct consumed by log-triggered upkeeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbiLogPacker;

impl LogDataPacker for AbiLogPacker {
    fn pack_log_data(&self, log: &PolledLog) -> Result<Bytes, PackError> {
        let encoded = abi::Log {
            index: U256::from(log.log_index),
            timestamp: U256::from(log.block_timestamp),
            txHash: log.tx_hash,
            blockNumber: U256::from(log.block_number),
            blockHash: log.block_hash,
            source: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().clone(),
        }
        .abi_encode();
        Ok(encoded.into())
    }
}

/// Turns a log fetched for `upkeep_id` into a payload. Log-triggered upkeeps
/// get a trigger carrying the log's identity.
pub(crate) fn build_payload(
    packer: &dyn LogDataPacker,
    upkeep_id: U256,
    log: &PolledLog,
) -> Result<UpkeepPayload, PayloadError> {
    let upkeep_id = UpkeepId::from(upkeep_id);
    let mut trigger = Trigger::new(log.block_number, log.block_hash);
    if upkeep_id.upkeep_type()? == UpkeepType::LogTrigger {
        let index =
            u32::try_from(log.log_index).map_err(|_| TriggerError::LogIndexOverflow(log.log_index))?;
        trigger = trigger.with_log_extension(LogTriggerExtension {
            tx_hash: log.tx_hash,
            index,
            block_hash: log.block_hash,
            block_number: log.block_number,
        });
    }
    let check_data = packer.pack_log_data(log)?;
    Ok(UpkeepPayload::new(upkeep_id, trigger, check_data)?)
}
