use crate::primitives::{TriggerError, UpkeepIdError};
use alloy_primitives::{B256, U256};
use std::fmt;

/// Failure reported by a [`LogPoller`](crate::LogPoller) or an
/// [`UpkeepStateReader`](crate::UpkeepStateReader).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollerError {
    #[error("log source request failed: {0}")]
    Rpc(String),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to pack log data: {0}")]
pub struct PackError(pub String);

/// Reasons a log cannot be turned into a payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error(transparent)]
    UpkeepId(#[from] UpkeepIdError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Pack(#[from] PackError),
}

#[derive(Debug, thiserror::Error)]
pub enum LogProviderError {
    #[error("invalid log trigger config: {0}")]
    InvalidFilterConfig(&'static str),
    #[error("filter for upkeep {0} already exists")]
    FilterAlreadyExists(U256),
    #[error("latest block not available: {0}")]
    HeadNotAvailable(PollerError),
    #[error("block limit exceeded for upkeep {0}")]
    BlockLimitExceeded(U256),
    #[error("failed to fetch logs for upkeep {upkeep_id}: {source}")]
    FetchLogs {
        upkeep_id: U256,
        #[source]
        source: PollerError,
    },
    #[error("log poller filter error: {0}")]
    Poller(PollerError),
    #[error("log provider already started")]
    AlreadyStarted,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    ReadLogs(ReadLogsErrors),
}

impl LogProviderError {
    /// True for rate-limit rejections and aggregates made only of them.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::BlockLimitExceeded(_) => true,
            Self::ReadLogs(errors) => {
                !errors.0.is_empty() && errors.0.iter().all(Self::is_rate_limited)
            }
            _ => false,
        }
    }
}

/// Per-filter failures collected during one read.
#[derive(Debug, Default)]
pub struct ReadLogsErrors(pub Vec<LogProviderError>);

impl ReadLogsErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogProviderError> {
        self.0.iter()
    }

    pub fn is_block_limit_exceeded(&self) -> bool {
        self.0
            .iter()
            .any(|e| matches!(e, LogProviderError::BlockLimitExceeded(_)))
    }
}

impl fmt::Display for ReadLogsErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} filter(s) failed to read logs", self.0.len())?;
        for err in &self.0 {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ReadLogsErrors {}

#[derive(Debug, thiserror::Error)]
pub enum RecovererError {
    #[error("latest block not available: {0}")]
    HeadNotAvailable(PollerError),
    #[error("filter for upkeep {0} not found")]
    FilterNotFound(U256),
    #[error("upkeep {0} is not a log trigger upkeep")]
    NotLogTriggerUpkeep(U256),
    #[error("log block {block} is not recoverable, window is {start}..={end}")]
    LogBlockNotRecoverable { block: u64, start: u64, end: u64 },
    #[error("work {0} is already resolved")]
    StateNotRecoverable(String),
    #[error("log {tx_hash}:{log_index} not found in block {block}")]
    LogNotFound {
        block: u64,
        tx_hash: B256,
        log_index: u32,
    },
    #[error("failed to fetch logs for upkeep {upkeep_id}: {source}")]
    FetchLogs {
        upkeep_id: U256,
        #[source]
        source: PollerError,
    },
    #[error("failed to read upkeep states: {0}")]
    StateReader(PollerError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("log recoverer already started")]
    AlreadyStarted,
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error("latest block not available: {0}")]
    HeadNotAvailable(PollerError),
    #[error("failed to fetch transmit logs: {0}")]
    FetchLogs(PollerError),
    #[error("transmit filter registration failed: {0}")]
    Poller(PollerError),
    #[error("unknown transmit event topic {0}")]
    UnknownEvent(B256),
    #[error("failed to decode transmit event: {0}")]
    Decode(#[from] alloy_sol_types::Error),
    #[error(transparent)]
    InvalidUpkeepId(#[from] UpkeepIdError),
    #[error("failed to unpack trigger: {0}")]
    TriggerUnpack(#[from] TriggerError),
    #[error("operation cancelled")]
    Cancelled,
}
