//! Per-filter token bucket bounding how many blocks a filter may scan.

use tokio::time::Instant;

/// Blocks reserved by a successful [`BlockLimiter::try_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    blocks: u64,
}

impl Reservation {
    pub fn blocks(&self) -> u64 {
        self.blocks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("requested {requested} blocks, {available} available")]
pub struct BlockLimitError {
    pub requested: u64,
    pub available: u64,
}

/// Tokens refill continuously at `rate_per_sec` up to `burst`. A bucket that
/// has never been drawn from starts full. Cancelled reservations return their
/// tokens even if that leaves the bucket above `burst`.
#[derive(Debug, Clone)]
pub struct BlockLimiter {
    rate_per_sec: f64,
    burst: u64,
    available: f64,
    last_refill: Option<Instant>,
}

impl BlockLimiter {
    pub fn new(rate_per_sec: f64, burst: u64) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(0.0),
            burst,
            available: burst as f64,
            last_refill: None,
        }
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Changes the bucket capacity. Raising it lets idle time accrue up to the
    /// new capacity on the next reservation, lowering it settles the refill
    /// accrued so far.
    pub fn set_burst(&mut self, burst: u64) {
        self.set_burst_at(burst, Instant::now());
    }

    pub fn set_burst_at(&mut self, burst: u64, now: Instant) {
        if burst < self.burst {
            self.refill(now);
        }
        self.burst = burst;
    }

    /// Takes `blocks` tokens without waiting.
    pub fn try_reserve(&mut self, blocks: u64) -> Result<Reservation, BlockLimitError> {
        self.try_reserve_at(blocks, Instant::now())
    }

    pub fn try_reserve_at(
        &mut self,
        blocks: u64,
        now: Instant,
    ) -> Result<Reservation, BlockLimitError> {
        self.refill(now);
        let requested = blocks as f64;
        if requested > self.available {
            return Err(BlockLimitError {
                requested: blocks,
                available: self.available as u64,
            });
        }
        self.available -= requested;
        Ok(Reservation { blocks })
    }

    /// Returns the tokens of a reservation whose work was abandoned.
    pub fn cancel(&mut self, reservation: Reservation) {
        self.available += reservation.blocks as f64;
    }

    fn refill(&mut self, now: Instant) {
        let capacity = self.burst as f64;
        self.available = match self.last_refill {
            None => capacity,
            Some(_) if self.available >= capacity => self.available,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                (self.available + elapsed * self.rate_per_sec).min(capacity)
            }
        };
        self.last_refill = Some(now);
    }
}
