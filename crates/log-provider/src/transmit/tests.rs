use super::*;
use crate::{
    primitives::{LogTriggerExtension, Trigger, TriggerError, pack_trigger},
    test_utils::{MockLogPoller, block_hash, log_upkeep_id},
};
use alloy_primitives::{Bytes, Log, LogData, U256, aliases::U96};
use alloy_sol_types::SolEvent;

const REGISTRY: Address = Address::with_last_byte(0x99);

fn provider(poller: Arc<MockLogPoller>, cache_size: usize) -> TransmitEventProvider {
    TransmitEventProvider::new(
        TransmitArgs {
            lookback_blocks: 200,
            cache_size,
        },
        REGISTRY,
        poller,
    )
}

fn log_trigger(id: &UpkeepId, check_block: u64, log_index: u32) -> (Trigger, Bytes) {
    let trigger = Trigger::new(check_block, block_hash(check_block)).with_log_extension(
        LogTriggerExtension {
            tx_hash: B256::with_last_byte(0x10),
            index: log_index,
            block_hash: block_hash(check_block - 1),
            block_number: check_block,
        },
    );
    let raw = pack_trigger(id, &trigger).unwrap();
    (trigger, raw.into())
}

fn transmit_log(data: LogData, block: u64, tx: u8, index: u64) -> PolledLog {
    PolledLog {
        block_number: block,
        block_hash: block_hash(block),
        block_timestamp: block,
        tx_hash: B256::with_last_byte(tx),
        log_index: index,
        inner: Log {
            address: REGISTRY,
            data,
        },
    }
}

fn performed(id: &UpkeepId, trigger: Bytes) -> LogData {
    UpkeepPerformed {
        id: id.to_u256(),
        success: true,
        totalPayment: U96::from(10),
        gasUsed: U256::from(21_000),
        gasOverhead: U256::from(5_000),
        trigger,
    }
    .encode_log_data()
}

#[tokio::test]
async fn test_register_filter() {
    let poller = Arc::new(MockLogPoller::with_latest(1000));
    let provider = provider(poller.clone(), 16);

    provider.register_filter().await.unwrap();

    let filters = poller.filters();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].name, format!("TransmitEventProvider - {REGISTRY}"));
    assert_eq!(filters[0].event_sigs, TRANSMIT_EVENT_SIGS.to_vec());
    assert_eq!(filters[0].addresses, vec![REGISTRY]);
}

#[tokio::test]
async fn test_get_latest_events() -> eyre::Result<()> {
    let poller = Arc::new(MockLogPoller::with_latest(1000));
    let provider = provider(poller.clone(), 16);
    let id = log_upkeep_id(1);
    let (trigger, raw) = log_trigger(&id, 990, 2);

    poller.add_logs([
        transmit_log(performed(&id, raw.clone()), 995, 1, 0),
        transmit_log(
            StaleUpkeepReport {
                id: id.to_u256(),
                trigger: raw.clone(),
            }
            .encode_log_data(),
            996,
            2,
            0,
        ),
        transmit_log(
            ReorgedUpkeepReport {
                id: id.to_u256(),
                trigger: raw.clone(),
            }
            .encode_log_data(),
            997,
            3,
            0,
        ),
        transmit_log(
            InsufficientFundsUpkeepReport {
                id: id.to_u256(),
                trigger: raw,
            }
            .encode_log_data(),
            998,
            4,
            0,
        ),
    ]);

    let events = provider
        .get_latest_events(&CancellationToken::new())
        .await?;

    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TransmitEventType::Performed,
            TransmitEventType::StaleReport,
            TransmitEventType::ReorgReport,
            TransmitEventType::InsufficientFunds,
        ]
    );
    let first = &events[0];
    assert_eq!(first.upkeep_id, id);
    assert_eq!(first.transmit_block, 995);
    assert_eq!(first.confirmations, 5);
    assert_eq!(first.tx_hash, B256::with_last_byte(1));
    assert_eq!(first.check_block, 990);
    assert_eq!(first.work_id, work_id(&id, &trigger));
    assert!(events.iter().all(|e| e.work_id == first.work_id));
    Ok(())
}

#[tokio::test]
async fn test_events_returned_once() {
    let poller = Arc::new(MockLogPoller::with_latest(1000));
    let provider = provider(poller.clone(), 16);
    let id = log_upkeep_id(1);
    let (_, raw) = log_trigger(&id, 990, 0);
    let log = transmit_log(performed(&id, raw), 995, 1, 0);
    poller.add_logs([log.clone(), log]);

    let cancel = CancellationToken::new();
    assert_eq!(provider.get_latest_events(&cancel).await.unwrap().len(), 1);
    assert!(provider.get_latest_events(&cancel).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_logs_are_skipped() {
    let poller = Arc::new(MockLogPoller::with_latest(1000));
    let provider = provider(poller.clone(), 16);
    let id = log_upkeep_id(1);
    let (_, raw) = log_trigger(&id, 990, 0);
    let mut bad_id = [0u8; 32];
    bad_id[15] = 9;
    let bad_id = UpkeepId::new(B256::from(bad_id));

    poller.add_logs([
        transmit_log(performed(&id, Bytes::from_static(&[1, 2, 3])), 995, 1, 0),
        transmit_log(performed(&bad_id, raw.clone()), 995, 2, 0),
        transmit_log(performed(&id, raw), 996, 3, 0),
    ]);

    let events = provider
        .get_latest_events(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].transmit_block, 996);
}

#[test]
fn test_parse_errors() {
    let id = log_upkeep_id(1);
    let unknown = transmit_log(
        LogData::new_unchecked(vec![B256::with_last_byte(1)], Bytes::new()),
        10,
        1,
        0,
    );
    assert!(matches!(
        TransmitEventProvider::parse_event(10, &unknown),
        Err(TransmitError::UnknownEvent(_))
    ));

    let bad_trigger = transmit_log(performed(&id, Bytes::from_static(&[1])), 10, 1, 0);
    assert!(matches!(
        TransmitEventProvider::parse_event(10, &bad_trigger),
        Err(TransmitError::TriggerUnpack(TriggerError::Decode(_)))
    ));
}

#[tokio::test]
async fn test_source_errors() {
    let poller = Arc::new(MockLogPoller::default());
    let provider = provider(poller.clone(), 16);
    let cancel = CancellationToken::new();

    assert!(matches!(
        provider.get_latest_events(&cancel).await,
        Err(TransmitError::HeadNotAvailable(_))
    ));

    poller.set_latest(Some(1000));
    poller.fail_logs(Some("rpc down"));
    assert!(matches!(
        provider.get_latest_events(&cancel).await,
        Err(TransmitError::FetchLogs(_))
    ));
}
