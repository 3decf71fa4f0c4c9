use crate::{error::TransmitError, poller::PolledLog};
use alloy_primitives::{B256, Bytes, U256};
use alloy_sol_types::{SolEvent, sol};

sol! {
    event UpkeepPerformed(
        uint256 indexed id,
        bool indexed success,
        uint96 totalPayment,
        uint256 gasUsed,
        uint256 gasOverhead,
        bytes trigger
    );

    event StaleUpkeepReport(uint256 indexed id, bytes trigger);

    event ReorgedUpkeepReport(uint256 indexed id, bytes trigger);

    event InsufficientFundsUpkeepReport(uint256 indexed id, bytes trigger);

    event DedupKeyAdded(bytes32 indexed dedupKey);
}

/// Event signatures tracked by the transmit event provider.
pub const TRANSMIT_EVENT_SIGS: [B256; 4] = [
    UpkeepPerformed::SIGNATURE_HASH,
    StaleUpkeepReport::SIGNATURE_HASH,
    ReorgedUpkeepReport::SIGNATURE_HASH,
    InsufficientFundsUpkeepReport::SIGNATURE_HASH,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransmitEventType {
    #[default]
    Unknown,
    Performed,
    StaleReport,
    ReorgReport,
    InsufficientFunds,
}

/// Upkeep ID and raw trigger carried by a transmit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransmitLog {
    pub(crate) kind: TransmitEventType,
    pub(crate) upkeep_id: U256,
    pub(crate) trigger: Bytes,
}

pub(crate) fn decode_transmit_log(log: &PolledLog) -> Result<TransmitLog, TransmitError> {
    let topic0 = log.topics().first().copied().unwrap_or_default();
    let data = &log.inner.data;

    if topic0 == UpkeepPerformed::SIGNATURE_HASH {
        let event = UpkeepPerformed::decode_log_data(data)?;
        Ok(TransmitLog {
            kind: TransmitEventType::Performed,
            upkeep_id: event.id,
            trigger: event.trigger,
        })
    } else if topic0 == StaleUpkeepReport::SIGNATURE_HASH {
        let event = StaleUpkeepReport::decode_log_data(data)?;
        Ok(TransmitLog {
            kind: TransmitEventType::StaleReport,
            upkeep_id: event.id,
            trigger: event.trigger,
        })
    } else if topic0 == ReorgedUpkeepReport::SIGNATURE_HASH {
        let event = ReorgedUpkeepReport::decode_log_data(data)?;
        Ok(TransmitLog {
            kind: TransmitEventType::ReorgReport,
            upkeep_id: event.id,
            trigger: event.trigger,
        })
    } else if topic0 == InsufficientFundsUpkeepReport::SIGNATURE_HASH {
        let event = InsufficientFundsUpkeepReport::decode_log_data(data)?;
        Ok(TransmitLog {
            kind: TransmitEventType::InsufficientFunds,
            upkeep_id: event.id,
            trigger: event.trigger,
        })
    } else {
        Err(TransmitError::UnknownEvent(topic0))
    }
}
