use super::{Trigger, UpkeepId, UpkeepIdError, work_id};
use alloy_primitives::Bytes;

/// A unit of work handed to the check pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpkeepPayload {
    pub upkeep_id: UpkeepId,
    pub trigger: Trigger,
    pub work_id: String,
    pub check_data: Bytes,
}

impl UpkeepPayload {
    /// Builds a payload and derives its work ID. Fails for IDs with an unknown
    /// type tag.
    pub fn new(
        upkeep_id: UpkeepId,
        trigger: Trigger,
        check_data: Bytes,
    ) -> Result<Self, UpkeepIdError> {
        upkeep_id.upkeep_type()?;
        Ok(Self {
            work_id: work_id(&upkeep_id, &trigger),
            upkeep_id,
            trigger,
            check_data,
        })
    }
}

/// Resolution of a work item as recorded by the upkeep state store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpkeepState {
    #[default]
    Unknown,
    Performed,
    Ineligible,
}

impl UpkeepState {
    /// Performed and ineligible work never needs to be checked again.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Performed | Self::Ineligible)
    }
}
