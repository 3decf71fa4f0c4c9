use super::LogEventProvider;
use crate::{
    block_limiter::BlockLimiter,
    error::LogProviderError,
    filter_store::UpkeepFilter,
    poller::PollerFilter,
};
use alloy_primitives::{Address, B256, U256};
use std::{collections::HashSet, time::Duration};
use tracing::{debug, info};

/// Poller filters are retained for a day.
const FILTER_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Log trigger configuration stored on-chain for an upkeep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogTriggerConfig {
    pub contract_address: Address,
    /// Bit `i` requires `topic{i+1}` to match.
    pub filter_selector: u8,
    pub topic0: B256,
    pub topic1: B256,
    pub topic2: B256,
    pub topic3: B256,
}

impl LogTriggerConfig {
    pub fn validate(&self) -> Result<(), LogProviderError> {
        if self.contract_address.is_zero() {
            return Err(LogProviderError::InvalidFilterConfig(
                "contract address is zero",
            ));
        }
        if self.topic0.is_zero() {
            return Err(LogProviderError::InvalidFilterConfig("topic0 is zero"));
        }
        Ok(())
    }

    fn topics(&self) -> [B256; 4] {
        [self.topic0, self.topic1, self.topic2, self.topic3]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterOptions {
    pub upkeep_id: U256,
    pub trigger_config: LogTriggerConfig,
    /// Block at which the config was set.
    pub update_block: u64,
}

pub(super) fn filter_name(upkeep_id: &U256) -> String {
    format!("KeepersRegistry LogUpkeep - {upkeep_id}")
}

impl LogEventProvider {
    /// Registers the log filter of an upkeep with the log source and starts
    /// tracking it.
    pub async fn register_filter(&self, opts: FilterOptions) -> Result<(), LogProviderError> {
        let inner = &self.inner;
        let config = opts.trigger_config;
        config.validate()?;
        if inner.filter_store.has(&opts.upkeep_id) {
            return Err(LogProviderError::FilterAlreadyExists(opts.upkeep_id));
        }

        let filter = UpkeepFilter::new(
            opts.upkeep_id,
            config.contract_address,
            config.topics(),
            config.filter_selector,
            BlockLimiter::new(
                inner.args.block_rate_limit_per_sec,
                inner.args.block_limit_burst(),
            ),
            opts.update_block,
        );
        inner
            .poller
            .register_filter(poller_filter(&filter))
            .await
            .map_err(LogProviderError::Poller)?;

        if !inner.filter_store.add_if_absent(filter) {
            return Err(LogProviderError::FilterAlreadyExists(opts.upkeep_id));
        }
        inner.metrics.active_filters.increment(1.0);
        info!(
            target: "keeper::log_provider",
            upkeep_id = %opts.upkeep_id,
            address = %config.contract_address,
            update_block = opts.update_block,
            "registered upkeep filter"
        );
        Ok(())
    }

    /// Stops tracking an upkeep. The store entry is kept if the log source
    /// refuses to drop its filter.
    pub async fn unregister_filter(&self, upkeep_id: U256) -> Result<(), LogProviderError> {
        let inner = &self.inner;
        inner
            .poller
            .unregister_filter(&filter_name(&upkeep_id))
            .await
            .map_err(LogProviderError::Poller)?;
        if inner.filter_store.has(&upkeep_id) {
            inner.filter_store.remove_active_upkeeps(&[upkeep_id]);
            inner.metrics.active_filters.decrement(1.0);
        }
        debug!(target: "keeper::log_provider", %upkeep_id, "unregistered upkeep filter");
        Ok(())
    }

    /// Unregisters tracked upkeeps missing from `active_ids` and returns the
    /// active IDs that have no filter yet.
    pub async fn refresh_active_upkeeps(
        &self,
        active_ids: &[U256],
    ) -> Result<Vec<U256>, LogProviderError> {
        let active: HashSet<U256> = active_ids.iter().copied().collect();
        let inactive = self
            .inner
            .filter_store
            .get_ids(|f| !active.contains(&f.upkeep_id));

        let mut first_err = None;
        for id in inactive {
            if let Err(e) = self.unregister_filter(id).await {
                debug!(target: "keeper::log_provider", upkeep_id = %id, "failed to unregister inactive upkeep: {e}");
                first_err.get_or_insert(e);
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        let mut seen = HashSet::new();
        Ok(active_ids
            .iter()
            .filter(|id| seen.insert(**id) && !self.inner.filter_store.has(id))
            .copied()
            .collect())
    }
}

fn poller_filter(filter: &UpkeepFilter) -> PollerFilter {
    let topics = filter
        .selected_topics()
        .iter()
        .flatten()
        .map(|topic| vec![*topic])
        .collect();
    PollerFilter {
        name: filter_name(&filter.upkeep_id),
        event_sigs: filter.event_sigs(),
        addresses: vec![filter.addr],
        topics,
        retention: FILTER_RETENTION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockLogPoller, new_provider};
    use std::sync::Arc;

    fn config(address: u8) -> LogTriggerConfig {
        LogTriggerConfig {
            contract_address: Address::with_last_byte(address),
            topic0: B256::with_last_byte(0xaa),
            ..Default::default()
        }
    }

    fn opts(id: u64, address: u8) -> FilterOptions {
        FilterOptions {
            upkeep_id: U256::from(id),
            trigger_config: config(address),
            update_block: 1,
        }
    }

    #[tokio::test]
    async fn test_register_filter() {
        let poller = Arc::new(MockLogPoller::with_latest(100));
        let provider = new_provider(poller.clone(), Default::default());

        provider.register_filter(opts(1, 1)).await.unwrap();

        assert!(provider.filter_store().has(&U256::from(1)));
        assert_eq!(
            poller.filter_names(),
            vec!["KeepersRegistry LogUpkeep - 1".to_string()]
        );
        let registered = &poller.filters()[0];
        assert_eq!(registered.event_sigs, vec![B256::with_last_byte(0xaa)]);
        assert_eq!(registered.addresses, vec![Address::with_last_byte(1)]);
        assert!(registered.topics.is_empty());
        assert_eq!(registered.retention, FILTER_RETENTION);
    }

    #[tokio::test]
    async fn test_register_selected_topics() {
        let poller = Arc::new(MockLogPoller::with_latest(100));
        let provider = new_provider(poller.clone(), Default::default());
        let mut options = opts(1, 1);
        options.trigger_config.filter_selector = 0b101;
        options.trigger_config.topic1 = B256::with_last_byte(1);
        options.trigger_config.topic3 = B256::with_last_byte(3);

        provider.register_filter(options).await.unwrap();

        assert_eq!(
            poller.filters()[0].topics,
            vec![vec![B256::with_last_byte(1)], vec![B256::with_last_byte(3)]]
        );
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_config() {
        let poller = Arc::new(MockLogPoller::with_latest(100));
        let provider = new_provider(poller.clone(), Default::default());

        let mut zero_address = opts(1, 1);
        zero_address.trigger_config.contract_address = Address::ZERO;
        assert!(matches!(
            provider.register_filter(zero_address).await,
            Err(LogProviderError::InvalidFilterConfig(_))
        ));

        let mut zero_topic = opts(1, 1);
        zero_topic.trigger_config.topic0 = B256::ZERO;
        assert!(matches!(
            provider.register_filter(zero_topic).await,
            Err(LogProviderError::InvalidFilterConfig(_))
        ));
        assert!(poller.filter_names().is_empty());
        assert_eq!(provider.filter_store().size(), 0);
    }

    #[tokio::test]
    async fn test_register_duplicate_fails() {
        let poller = Arc::new(MockLogPoller::with_latest(100));
        let provider = new_provider(poller.clone(), Default::default());

        provider.register_filter(opts(1, 1)).await.unwrap();
        let err = provider.register_filter(opts(1, 2)).await.unwrap_err();

        assert!(matches!(err, LogProviderError::FilterAlreadyExists(id) if id == U256::from(1)));
        assert_eq!(
            provider.filter_store().get(&U256::from(1)).unwrap().addr,
            Address::with_last_byte(1)
        );
    }

    #[tokio::test]
    async fn test_register_poller_failure_is_not_stored() {
        let poller = Arc::new(MockLogPoller::with_latest(100));
        let provider = new_provider(poller.clone(), Default::default());
        poller.fail_register(Some("boom"));

        assert!(matches!(
            provider.register_filter(opts(1, 1)).await,
            Err(LogProviderError::Poller(_))
        ));
        assert!(!provider.filter_store().has(&U256::from(1)));
    }

    #[tokio::test]
    async fn test_unregister_filter() {
        let poller = Arc::new(MockLogPoller::with_latest(100));
        let provider = new_provider(poller.clone(), Default::default());

        provider.register_filter(opts(1, 1)).await.unwrap();
        provider.unregister_filter(U256::from(1)).await.unwrap();

        assert!(!provider.filter_store().has(&U256::from(1)));
        assert!(poller.filter_names().is_empty());
        // unknown upkeeps are a no-op
        provider.unregister_filter(U256::from(9)).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_active_upkeeps() {
        let poller = Arc::new(MockLogPoller::with_latest(100));
        let provider = new_provider(poller.clone(), Default::default());
        provider.register_filter(opts(1, 1)).await.unwrap();
        provider.register_filter(opts(2, 2)).await.unwrap();

        let new_ids = provider
            .refresh_active_upkeeps(&[U256::from(2), U256::from(3), U256::from(3)])
            .await
            .unwrap();

        assert_eq!(new_ids, vec![U256::from(3)]);
        assert!(!provider.filter_store().has(&U256::from(1)));
        assert!(provider.filter_store().has(&U256::from(2)));
        assert_eq!(
            poller.filter_names(),
            vec!["KeepersRegistry LogUpkeep - 2".to_string()]
        );
    }
}
