//! Identifiers, triggers and payloads shared by the log provider, the
//! recoverer and the transmit event tracker.

mod payload;
mod trigger;
mod upkeep_id;

pub use payload::{UpkeepPayload, UpkeepState};
pub use trigger::{
    LogTriggerExtension, Trigger, TriggerError, dedup_key, pack_trigger, unpack_trigger, work_id,
};
pub use upkeep_id::{UpkeepId, UpkeepIdError, UpkeepType};
