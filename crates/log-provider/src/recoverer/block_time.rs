use crate::{
    error::PollerError,
    poller::{LogPoller, with_cancel},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Used until the chain's block time has been sampled.
pub(crate) const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(1);

/// Averages the block time over the last `sample_size` blocks. Returns `None`
/// when fewer than two blocks with distinct timestamps are available.
pub(crate) async fn estimate_block_time(
    poller: &dyn LogPoller,
    cancel: &CancellationToken,
    sample_size: u64,
) -> Result<Option<Duration>, PollerError> {
    let latest = with_cancel(cancel, poller.latest_block()).await?;
    let start = latest.saturating_sub(sample_size.max(1)).max(1);
    let numbers: Vec<u64> = (start..=latest).collect();
    let blocks = with_cancel(cancel, poller.get_blocks_range(&numbers)).await?;

    let (Some(first), Some(last)) = (
        blocks.iter().min_by_key(|b| b.number),
        blocks.iter().max_by_key(|b| b.number),
    ) else {
        return Ok(None);
    };
    if last.number == first.number || last.timestamp <= first.timestamp {
        return Ok(None);
    }
    let elapsed_ms = (last.timestamp - first.timestamp) * 1000;
    let per_block = elapsed_ms / (last.number - first.number);
    Ok(Some(Duration::from_millis(per_block.max(1))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockLogPoller;

    #[tokio::test]
    async fn test_estimate_block_time() {
        let poller = MockLogPoller::with_latest(500);
        poller.add_blocks(1, 500, 2);

        let block_time = estimate_block_time(&poller, &CancellationToken::new(), 100)
            .await
            .unwrap();
        assert_eq!(block_time, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_estimate_without_blocks() {
        let poller = MockLogPoller::with_latest(500);

        let block_time = estimate_block_time(&poller, &CancellationToken::new(), 100)
            .await
            .unwrap();
        assert_eq!(block_time, None);
    }
}
