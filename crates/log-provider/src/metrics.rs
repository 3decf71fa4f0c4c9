use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

#[derive(Metrics, Clone)]
#[metrics(scope = "keeper.log_provider")]
pub(crate) struct LogProviderMetrics {
    /// Number of registered upkeep filters
    pub active_filters: Gauge,
    /// Logs accepted into the buffer
    pub logs_enqueued: Counter,
    /// Logs returned as payloads
    pub payloads_returned: Counter,
    /// Reads rejected by the per-filter block limiter
    pub block_limit_exceeded: Counter,
    /// Failed log fetches
    pub fetch_errors: Counter,
    /// Duration of a read over one batch of filters
    pub read_duration: Histogram,
}

#[derive(Metrics, Clone)]
#[metrics(scope = "keeper.log_recoverer")]
pub(crate) struct RecovererMetrics {
    /// Payloads waiting to be proposed
    pub pending_payloads: Gauge,
    /// Work IDs currently marked visited
    pub visited_entries: Gauge,
    /// Payloads added to the pending queue
    pub payloads_recovered: Counter,
    /// Payloads dropped because the upkeep's pending queue was full
    pub pending_limit_dropped: Counter,
    /// Visited entries removed by garbage collection
    pub visited_expired: Counter,
    /// Duration of one recovery pass
    pub recover_duration: Histogram,
}

#[derive(Metrics, Clone)]
#[metrics(scope = "keeper.transmit")]
pub(crate) struct TransmitMetrics {
    /// Transmit events returned to callers
    pub events_returned: Counter,
    /// Transmit logs that could not be parsed
    pub parse_errors: Counter,
}
