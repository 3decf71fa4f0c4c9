use alloy_primitives::{B256, U256, keccak256};
use std::fmt;

/// Bytes `4..15` of a typed ID are zero and byte `15` carries the type tag.
const TYPE_PREFIX: std::ops::Range<usize> = 4..15;
const TYPE_BYTE_INDEX: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UpkeepIdError {
    #[error("unknown upkeep type tag {0}")]
    UnknownType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UpkeepType {
    Conditional = 0,
    LogTrigger = 1,
}

impl TryFrom<u8> for UpkeepType {
    type Error = UpkeepIdError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Conditional),
            1 => Ok(Self::LogTrigger),
            other => Err(UpkeepIdError::UnknownType(other)),
        }
    }
}

/// 256-bit upkeep identifier with an embedded upkeep type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpkeepId(B256);

impl UpkeepId {
    pub const fn new(bytes: B256) -> Self {
        Self(bytes)
    }

    /// Derives a typed ID from `seed`. Used by registries and tests to mint
    /// IDs that carry the expected type tag.
    pub fn generate(kind: UpkeepType, seed: &[u8]) -> Self {
        let hash = keccak256(seed);
        let mut bytes = [0u8; 32];
        bytes[..TYPE_PREFIX.start].copy_from_slice(&hash[..TYPE_PREFIX.start]);
        bytes[TYPE_BYTE_INDEX] = kind as u8;
        bytes[TYPE_BYTE_INDEX + 1..].copy_from_slice(&hash[TYPE_PREFIX.start..TYPE_PREFIX.start + 16]);
        Self(B256::from(bytes))
    }

    pub const fn as_b256(&self) -> &B256 {
        &self.0
    }

    pub fn to_u256(&self) -> U256 {
        U256::from_be_bytes(self.0.0)
    }

    /// Reads the type tag. IDs minted before typing existed have non-zero
    /// bytes in the prefix and are conditional.
    pub fn upkeep_type(&self) -> Result<UpkeepType, UpkeepIdError> {
        if self.0[TYPE_PREFIX].iter().any(|b| *b != 0) {
            return Ok(UpkeepType::Conditional);
        }
        UpkeepType::try_from(self.0[TYPE_BYTE_INDEX])
    }

    pub fn is_log_trigger(&self) -> bool {
        matches!(self.upkeep_type(), Ok(UpkeepType::LogTrigger))
    }
}

impl From<U256> for UpkeepId {
    fn from(id: U256) -> Self {
        Self(B256::from(id))
    }
}

impl From<UpkeepId> for U256 {
    fn from(id: UpkeepId) -> Self {
        id.to_u256()
    }
}

impl fmt::Display for UpkeepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_u256())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_carry_type() {
        let log_id = UpkeepId::generate(UpkeepType::LogTrigger, b"upkeep-1");
        let cond_id = UpkeepId::generate(UpkeepType::Conditional, b"upkeep-1");

        assert_eq!(log_id.upkeep_type(), Ok(UpkeepType::LogTrigger));
        assert!(log_id.is_log_trigger());
        assert_eq!(cond_id.upkeep_type(), Ok(UpkeepType::Conditional));
        assert_ne!(log_id, cond_id);
    }

    #[test]
    fn test_legacy_id_is_conditional() {
        let mut bytes = [0u8; 32];
        bytes[7] = 0xaa;
        bytes[TYPE_BYTE_INDEX] = 0x42;
        let id = UpkeepId::new(B256::from(bytes));

        assert_eq!(id.upkeep_type(), Ok(UpkeepType::Conditional));
    }

    #[test]
    fn test_unknown_type_tag_is_malformed() {
        let mut bytes = [0u8; 32];
        bytes[TYPE_BYTE_INDEX] = 7;
        let id = UpkeepId::new(B256::from(bytes));

        assert_eq!(id.upkeep_type(), Err(UpkeepIdError::UnknownType(7)));
        assert!(!id.is_log_trigger());
    }

    #[test]
    fn test_u256_conversion() {
        let id = UpkeepId::generate(UpkeepType::LogTrigger, b"conversion");
        let as_int = id.to_u256();

        assert_eq!(UpkeepId::from(as_int), id);
        assert_eq!(id.to_string(), as_int.to_string());
    }
}
