//! # Configuration
//!
//! All settings are exposed as CLI flags and can be flattened into a node's
//! command line. A value of `0` for the burst and buffer sizes means "derive
//! from the lookback".
//!
//! | Flag | Default | Description |
//! |------|---------|-------------|
//! | `--log-provider.lookback-blocks` | `200` | Blocks behind head scanned by the provider |
//! | `--log-provider.reorg-buffer-blocks` | `32` | Blocks re-read behind the last poll to catch reorgs |
//! | `--log-provider.block-rate-limit-per-sec` | `1.0` | Block tokens refilled per second per filter |
//! | `--log-provider.block-limit-burst` | `0` | Block token capacity per filter |
//! | `--log-provider.read-interval-ms` | `1000` | Interval between scheduled reads |
//! | `--log-provider.read-batch-size` | `32` | Upkeeps per read job |
//! | `--log-provider.read-workers` | `4` | Concurrent read workers |
//! | `--log-provider.read-queue-size` | `32` | Capacity of the read job queue |
//! | `--log-provider.buffer-size` | `0` | Blocks held in the log buffer |
//! | `--log-provider.max-logs-per-block` | `1000` | Logs held per block across upkeeps |
//! | `--log-provider.max-upkeep-logs-per-block` | `5` | Logs held per block per upkeep |
//! | `--log-provider.max-payloads-per-upkeep` | `5` | Payloads returned per upkeep per call |
//! | `--log-recoverer.interval-ms` | `5000` | Interval between recovery passes |
//! | `--log-recoverer.gc-interval-ms` | `600000` | Interval between visited-set cleanups |
//! | `--log-recoverer.visited-ttl-secs` | `1800` | How long delivered work stays visited |
//! | `--log-recoverer.lookback-blocks` | `200` | Blocks behind head left to the provider |
//! | `--log-recoverer.batch-size` | `10` | Filters recovered per pass |
//! | `--log-recoverer.logs-buffer-blocks` | `200` | Blocks scanned per filter per pass |
//! | `--log-recoverer.logs-burst-blocks` | `500` | Blocks scanned per pass for lagging filters |
//! | `--log-recoverer.max-pending-per-upkeep` | `25` | Pending payloads held per upkeep |
//! | `--log-recoverer.max-proposals-per-upkeep` | `5` | Recoverables returned per upkeep per call |
//! | `--log-recoverer.recovery-window-secs` | `86400` | How far back logs are recovered |
//! | `--log-recoverer.block-time-sample-size` | `100` | Blocks sampled to estimate block time |
//! | `--log-recoverer.dedup-trailing-blocks` | `50` | Blocks after a scan searched for dedup keys |
//! | `--transmit.lookback-blocks` | `200` | Blocks behind head scanned for transmit events |
//! | `--transmit.cache-size` | `1024` | Blocks held in the transmit event cache |

use clap::Args;
use std::time::Duration;

const DEFAULT_LOOKBACK_BLOCKS: u64 = 200;
const DEFAULT_REORG_BUFFER_BLOCKS: u64 = 32;
const DEFAULT_BLOCK_RATE_LIMIT_PER_SEC: f64 = 1.0;
const DEFAULT_BLOCK_LIMIT_BURST: u64 = 0;
const DEFAULT_READ_INTERVAL_MS: u64 = 1000;
const DEFAULT_READ_BATCH_SIZE: usize = 32;
const DEFAULT_READ_WORKERS: usize = 4;
const DEFAULT_READ_QUEUE_SIZE: usize = 32;
const DEFAULT_BUFFER_SIZE: usize = 0;
const DEFAULT_MAX_LOGS_PER_BLOCK: usize = 1000;
const DEFAULT_MAX_UPKEEP_LOGS_PER_BLOCK: usize = 5;
const DEFAULT_MAX_PAYLOADS_PER_UPKEEP: usize = 5;

const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 5000;
const DEFAULT_GC_INTERVAL_MS: u64 = 600_000;
const DEFAULT_VISITED_TTL_SECS: u64 = 1800;
const DEFAULT_RECOVERY_BATCH_SIZE: usize = 10;
const DEFAULT_LOGS_BUFFER_BLOCKS: u64 = 200;
const DEFAULT_LOGS_BURST_BLOCKS: u64 = 500;
const DEFAULT_MAX_PENDING_PER_UPKEEP: usize = 25;
const DEFAULT_MAX_PROPOSALS_PER_UPKEEP: usize = 5;
const DEFAULT_RECOVERY_WINDOW_SECS: u64 = 86_400;
const DEFAULT_BLOCK_TIME_SAMPLE_SIZE: u64 = 100;
const DEFAULT_DEDUP_TRAILING_BLOCKS: u64 = 50;

const DEFAULT_TRANSMIT_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Args)]
pub struct LogProviderArgs {
    #[arg(
        id = "log-provider.lookback-blocks",
        long = "log-provider.lookback-blocks",
        default_value_t = DEFAULT_LOOKBACK_BLOCKS
    )]
    pub lookback_blocks: u64,
    #[arg(
        long = "log-provider.reorg-buffer-blocks",
        default_value_t = DEFAULT_REORG_BUFFER_BLOCKS
    )]
    pub reorg_buffer_blocks: u64,
    #[arg(
        long = "log-provider.block-rate-limit-per-sec",
        default_value_t = DEFAULT_BLOCK_RATE_LIMIT_PER_SEC
    )]
    pub block_rate_limit_per_sec: f64,
    #[arg(long = "log-provider.block-limit-burst", default_value_t = DEFAULT_BLOCK_LIMIT_BURST)]
    pub block_limit_burst: u64,
    #[arg(long = "log-provider.read-interval-ms", default_value_t = DEFAULT_READ_INTERVAL_MS)]
    pub read_interval_ms: u64,
    #[arg(long = "log-provider.read-batch-size", default_value_t = DEFAULT_READ_BATCH_SIZE)]
    pub read_batch_size: usize,
    #[arg(long = "log-provider.read-workers", default_value_t = DEFAULT_READ_WORKERS)]
    pub read_workers: usize,
    #[arg(long = "log-provider.read-queue-size", default_value_t = DEFAULT_READ_QUEUE_SIZE)]
    pub read_queue_size: usize,
    #[arg(long = "log-provider.buffer-size", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
    #[arg(
        long = "log-provider.max-logs-per-block",
        default_value_t = DEFAULT_MAX_LOGS_PER_BLOCK
    )]
    pub max_logs_per_block: usize,
    #[arg(
        long = "log-provider.max-upkeep-logs-per-block",
        default_value_t = DEFAULT_MAX_UPKEEP_LOGS_PER_BLOCK
    )]
    pub max_upkeep_logs_per_block: usize,
    #[arg(
        long = "log-provider.max-payloads-per-upkeep",
        default_value_t = DEFAULT_MAX_PAYLOADS_PER_UPKEEP
    )]
    pub max_payloads_per_upkeep: usize,
}

impl LogProviderArgs {
    pub fn block_limit_burst(&self) -> u64 {
        if self.block_limit_burst == 0 {
            self.lookback_blocks
        } else {
            self.block_limit_burst
        }
    }

    pub fn buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            self.lookback_blocks as usize
        } else {
            self.buffer_size
        }
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms.max(1))
    }
}

impl Default for LogProviderArgs {
    fn default() -> Self {
        Self {
            lookback_blocks: DEFAULT_LOOKBACK_BLOCKS,
            reorg_buffer_blocks: DEFAULT_REORG_BUFFER_BLOCKS,
            block_rate_limit_per_sec: DEFAULT_BLOCK_RATE_LIMIT_PER_SEC,
            block_limit_burst: DEFAULT_BLOCK_LIMIT_BURST,
            read_interval_ms: DEFAULT_READ_INTERVAL_MS,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            read_workers: DEFAULT_READ_WORKERS,
            read_queue_size: DEFAULT_READ_QUEUE_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_logs_per_block: DEFAULT_MAX_LOGS_PER_BLOCK,
            max_upkeep_logs_per_block: DEFAULT_MAX_UPKEEP_LOGS_PER_BLOCK,
            max_payloads_per_upkeep: DEFAULT_MAX_PAYLOADS_PER_UPKEEP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RecovererArgs {
    #[arg(long = "log-recoverer.interval-ms", default_value_t = DEFAULT_RECOVERY_INTERVAL_MS)]
    pub interval_ms: u64,
    #[arg(long = "log-recoverer.gc-interval-ms", default_value_t = DEFAULT_GC_INTERVAL_MS)]
    pub gc_interval_ms: u64,
    #[arg(long = "log-recoverer.visited-ttl-secs", default_value_t = DEFAULT_VISITED_TTL_SECS)]
    pub visited_ttl_secs: u64,
    #[arg(
        id = "log-recoverer.lookback-blocks",
        long = "log-recoverer.lookback-blocks",
        default_value_t = DEFAULT_LOOKBACK_BLOCKS
    )]
    pub lookback_blocks: u64,
    #[arg(long = "log-recoverer.batch-size", default_value_t = DEFAULT_RECOVERY_BATCH_SIZE)]
    pub batch_size: usize,
    #[arg(
        long = "log-recoverer.logs-buffer-blocks",
        default_value_t = DEFAULT_LOGS_BUFFER_BLOCKS
    )]
    pub logs_buffer_blocks: u64,
    #[arg(
        long = "log-recoverer.logs-burst-blocks",
        default_value_t = DEFAULT_LOGS_BURST_BLOCKS
    )]
    pub logs_burst_blocks: u64,
    #[arg(
        long = "log-recoverer.max-pending-per-upkeep",
        default_value_t = DEFAULT_MAX_PENDING_PER_UPKEEP
    )]
    pub max_pending_per_upkeep: usize,
    #[arg(
        long = "log-recoverer.max-proposals-per-upkeep",
        default_value_t = DEFAULT_MAX_PROPOSALS_PER_UPKEEP
    )]
    pub max_proposals_per_upkeep: usize,
    #[arg(
        long = "log-recoverer.recovery-window-secs",
        default_value_t = DEFAULT_RECOVERY_WINDOW_SECS
    )]
    pub recovery_window_secs: u64,
    #[arg(
        long = "log-recoverer.block-time-sample-size",
        default_value_t = DEFAULT_BLOCK_TIME_SAMPLE_SIZE
    )]
    pub block_time_sample_size: u64,
    #[arg(
        long = "log-recoverer.dedup-trailing-blocks",
        default_value_t = DEFAULT_DEDUP_TRAILING_BLOCKS
    )]
    pub dedup_trailing_blocks: u64,
}

impl RecovererArgs {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }

    pub fn visited_ttl(&self) -> Duration {
        Duration::from_secs(self.visited_ttl_secs)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_secs)
    }
}

impl Default for RecovererArgs {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            visited_ttl_secs: DEFAULT_VISITED_TTL_SECS,
            lookback_blocks: DEFAULT_LOOKBACK_BLOCKS,
            batch_size: DEFAULT_RECOVERY_BATCH_SIZE,
            logs_buffer_blocks: DEFAULT_LOGS_BUFFER_BLOCKS,
            logs_burst_blocks: DEFAULT_LOGS_BURST_BLOCKS,
            max_pending_per_upkeep: DEFAULT_MAX_PENDING_PER_UPKEEP,
            max_proposals_per_upkeep: DEFAULT_MAX_PROPOSALS_PER_UPKEEP,
            recovery_window_secs: DEFAULT_RECOVERY_WINDOW_SECS,
            block_time_sample_size: DEFAULT_BLOCK_TIME_SAMPLE_SIZE,
            dedup_trailing_blocks: DEFAULT_DEDUP_TRAILING_BLOCKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct TransmitArgs {
    #[arg(
        id = "transmit.lookback-blocks",
        long = "transmit.lookback-blocks",
        default_value_t = DEFAULT_LOOKBACK_BLOCKS
    )]
    pub lookback_blocks: u64,
    #[arg(long = "transmit.cache-size", default_value_t = DEFAULT_TRANSMIT_CACHE_SIZE)]
    pub cache_size: usize,
}

impl Default for TransmitArgs {
    fn default() -> Self {
        Self {
            lookback_blocks: DEFAULT_LOOKBACK_BLOCKS,
            cache_size: DEFAULT_TRANSMIT_CACHE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        provider: LogProviderArgs,
        #[command(flatten)]
        recoverer: RecovererArgs,
        #[command(flatten)]
        transmit: TransmitArgs,
    }

    #[test]
    fn test_defaults_match_cli() {
        let cli = TestCli::parse_from(["keeper"]);

        assert_eq!(cli.provider, LogProviderArgs::default());
        assert_eq!(cli.recoverer, RecovererArgs::default());
        assert_eq!(cli.transmit, TransmitArgs::default());
    }

    #[test]
    fn test_derived_values() {
        let cli = TestCli::parse_from([
            "keeper",
            "--log-provider.lookback-blocks",
            "50",
            "--log-provider.buffer-size",
            "80",
            "--log-recoverer.visited-ttl-secs",
            "60",
        ]);

        assert_eq!(cli.provider.block_limit_burst(), 50);
        assert_eq!(cli.provider.buffer_size(), 80);
        assert_eq!(cli.recoverer.visited_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_lookback_flags_are_independent() {
        let cli = TestCli::parse_from([
            "keeper",
            "--log-provider.lookback-blocks",
            "10",
            "--log-recoverer.lookback-blocks",
            "20",
            "--transmit.lookback-blocks",
            "30",
        ]);

        assert_eq!(cli.provider.lookback_blocks, 10);
        assert_eq!(cli.recoverer.lookback_blocks, 20);
        assert_eq!(cli.transmit.lookback_blocks, 30);
    }
}
