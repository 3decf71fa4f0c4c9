use super::{UpkeepId, UpkeepIdError, UpkeepType};
use alloy_primitives::{B256, keccak256};
use alloy_sol_types::{SolValue, sol};

sol! {
    struct ConditionalTrigger {
        uint32 blockNum;
        bytes32 blockHash;
    }

    struct LogTrigger {
        bytes32 logBlockHash;
        bytes32 txHash;
        uint32 logIndex;
        uint32 blockNum;
        bytes32 blockHash;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    UpkeepId(#[from] UpkeepIdError),
    #[error("failed to decode trigger: {0}")]
    Decode(#[from] alloy_sol_types::Error),
    #[error("block number {0} does not fit in a packed trigger")]
    BlockNumberOverflow(u64),
    #[error("log index {0} does not fit in a packed trigger")]
    LogIndexOverflow(u64),
    #[error("log trigger is missing its log extension")]
    MissingLogExtension,
}

/// Identifies the log that triggered a log upkeep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LogTriggerExtension {
    pub tx_hash: B256,
    pub index: u32,
    pub block_hash: B256,
    pub block_number: u64,
}

impl LogTriggerExtension {
    /// `block_hash ‖ tx_hash ‖ be32(index)`
    pub fn log_identifier(&self) -> [u8; 68] {
        let mut out = [0u8; 68];
        out[..32].copy_from_slice(self.block_hash.as_slice());
        out[32..64].copy_from_slice(self.tx_hash.as_slice());
        out[64..].copy_from_slice(&self.index.to_be_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Trigger {
    pub block_number: u64,
    pub block_hash: B256,
    pub log_extension: Option<LogTriggerExtension>,
}

impl Trigger {
    pub fn new(block_number: u64, block_hash: B256) -> Self {
        Self {
            block_number,
            block_hash,
            log_extension: None,
        }
    }

    pub fn with_log_extension(mut self, extension: LogTriggerExtension) -> Self {
        self.log_extension = Some(extension);
        self
    }

    /// Block of the triggering log, falling back to the check block for
    /// conditional triggers.
    pub fn log_block_number(&self) -> u64 {
        match self.log_extension {
            Some(ext) if ext.block_number > 0 => ext.block_number,
            _ => self.block_number,
        }
    }
}

/// Hex-encoded hash identifying one unit of work. Log triggers hash the upkeep
/// ID together with the log identifier, conditional triggers hash the ID only.
pub fn work_id(upkeep_id: &UpkeepId, trigger: &Trigger) -> String {
    let hash = match &trigger.log_extension {
        Some(ext) => dedup_key(upkeep_id, ext),
        None => keccak256(upkeep_id.as_b256()),
    };
    hex::encode(hash)
}

/// Key the registry emits once a log trigger has been performed. Shares its
/// preimage with the log trigger work ID.
pub fn dedup_key(upkeep_id: &UpkeepId, extension: &LogTriggerExtension) -> B256 {
    let mut preimage = [0u8; 32 + 68];
    preimage[..32].copy_from_slice(upkeep_id.as_b256().as_slice());
    preimage[32..].copy_from_slice(&extension.log_identifier());
    keccak256(preimage)
}

pub fn pack_trigger(upkeep_id: &UpkeepId, trigger: &Trigger) -> Result<Vec<u8>, TriggerError> {
    let block_num = u32::try_from(trigger.block_number)
        .map_err(|_| TriggerError::BlockNumberOverflow(trigger.block_number))?;
    match upkeep_id.upkeep_type()? {
        UpkeepType::Conditional => Ok(ConditionalTrigger {
            blockNum: block_num,
            blockHash: trigger.block_hash,
        }
        .abi_encode()),
        UpkeepType::LogTrigger => {
            let ext = trigger
                .log_extension
                .ok_or(TriggerError::MissingLogExtension)?;
            Ok(LogTrigger {
                logBlockHash: ext.block_hash,
                txHash: ext.tx_hash,
                logIndex: ext.index,
                blockNum: block_num,
                blockHash: trigger.block_hash,
            }
            .abi_encode())
        }
    }
}

/// Decodes a raw trigger according to the type embedded in `upkeep_id`.
pub fn unpack_trigger(upkeep_id: &UpkeepId, raw: &[u8]) -> Result<Trigger, TriggerError> {
    match upkeep_id.upkeep_type()? {
        UpkeepType::Conditional => {
            let decoded = ConditionalTrigger::abi_decode(raw)?;
            Ok(Trigger::new(decoded.blockNum.into(), decoded.blockHash))
        }
        UpkeepType::LogTrigger => {
            let decoded = LogTrigger::abi_decode(raw)?;
            let block_number = u64::from(decoded.blockNum);
            Ok(
                Trigger::new(block_number, decoded.blockHash).with_log_extension(
                    LogTriggerExtension {
                        tx_hash: decoded.txHash,
                        index: decoded.logIndex,
                        block_hash: decoded.logBlockHash,
                        block_number,
                    },
                ),
            )
        }
    }
}
