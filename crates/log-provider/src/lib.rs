//! Log-trigger ingestion for keeper automation nodes.
//!
//! - [`LogEventProvider`] polls logs for registered upkeep filters near the
//!   chain head and turns them into [`UpkeepPayload`]s.
//! - [`LogRecoverer`] re-reads older ranges to recover logs the provider
//!   missed.
//! - [`TransmitEventProvider`] reports the on-chain outcome of transmitted
//!   reports.
//!
//! Chain access goes through the [`LogPoller`] and [`UpkeepStateReader`]
//! traits.

pub mod args;
pub mod block_limiter;
pub mod buffer;
pub mod error;
pub mod filter_store;
mod metrics;
pub mod packer;
pub mod poller;
pub mod primitives;
pub mod provider;
pub mod recoverer;
mod tasks;
pub mod transmit;

#[cfg(test)]
mod test_utils;

pub use args::{LogProviderArgs, RecovererArgs, TransmitArgs};
pub use buffer::{FetchedLog, LogEventBuffer};
pub use error::{
    LogProviderError, PackError, PayloadError, PollerError, ReadLogsErrors, RecovererError,
    TransmitError,
};
pub use filter_store::{UpkeepFilter, UpkeepFilterStore};
pub use packer::{AbiLogPacker, LogDataPacker};
pub use poller::{LogPoller, PolledBlock, PolledLog, PollerFilter, UpkeepStateReader};
pub use primitives::{Trigger, UpkeepId, UpkeepPayload, UpkeepState, UpkeepType};
pub use provider::{FilterOptions, LogEventProvider, LogTriggerConfig};
pub use recoverer::LogRecoverer;
pub use transmit::{TransmitEvent, TransmitEventProvider, TransmitEventType};
