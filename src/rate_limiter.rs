//! Quota-aware rate limiter for Gmail API
//!
//! Gmail API budgets requests in "quota units" per user per second
//! (250 by default). The operations this tool performs have very uneven
//! costs:
//! - metadata and body fetches (messages.get): 5 units
//! - batch modify used for trashing (messages.batchModify): 50 units
//! - sending an unsubscribe mail (messages.send): 100 units
//! - creating a block filter (settings.filters.create): 5 units
//!
//! A token bucket shared by every API call keeps bursts of cheap reads
//! fast while spacing out the expensive sends and trashes.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Gmail API quota costs for the operations this tool performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCost {
    /// messages.get and messages.list
    /// Cost: 5 quota units
    Read,
    /// messages.batchModify (bulk trash)
    /// Cost: 50 quota units
    Trash,
    /// messages.send (unsubscribe mails)
    /// Cost: 100 quota units
    Send,
    /// settings.filters.create (block filters)
    /// Cost: 5 quota units
    Filter,
    /// Custom cost for special operations
    Custom(u32),
}

impl QuotaCost {
    /// Get the quota unit cost for this operation type
    pub fn units(&self) -> u32 {
        match self {
            QuotaCost::Read => 5,
            QuotaCost::Trash => 50,
            QuotaCost::Send => 100,
            QuotaCost::Filter => 5,
            QuotaCost::Custom(units) => *units,
        }
    }
}

/// Token bucket rate limiter for Gmail API quota management
///
/// Tokens represent available quota units, refilled at `refill_rate` per
/// second up to `max_units` of burst capacity; each operation consumes
/// tokens according to its cost and waits when the bucket runs dry.
#[derive(Debug)]
pub struct QuotaRateLimiter {
    inner: Arc<Mutex<RateLimiterState>>,
}

#[derive(Debug)]
struct RateLimiterState {
    /// Current available quota units (tokens)
    available_units: f64,
    /// Maximum quota units that can be stored (burst capacity)
    max_units: f64,
    /// Quota units added per second
    refill_rate: f64,
    /// Last time we refilled the bucket
    last_refill: Instant,
    /// Total units consumed (for stats)
    total_consumed: u64,
    /// Total operations performed (for stats)
    total_operations: u64,
}

impl RateLimiterState {
    /// Credit the bucket for time elapsed since the last refill
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available_units = (self.available_units + elapsed * self.refill_rate).min(self.max_units);
        self.last_refill = now;
    }

    fn consume(&mut self, units: f64) {
        self.available_units -= units;
        self.total_consumed += units as u64;
        self.total_operations += 1;
    }
}

impl QuotaRateLimiter {
    /// Create a new rate limiter with Gmail's default quota limits
    ///
    /// Default settings:
    /// - 250 quota units per second refill rate
    /// - 500 unit burst capacity (2 seconds worth)
    pub fn new() -> Self {
        Self::with_config(250.0, 500.0)
    }

    /// Create a rate limiter with custom configuration
    ///
    /// # Arguments
    /// * `refill_rate` - Quota units added per second
    /// * `max_units` - Maximum burst capacity
    pub fn with_config(refill_rate: f64, max_units: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateLimiterState {
                available_units: max_units, // Start with full bucket
                max_units,
                refill_rate,
                last_refill: Instant::now(),
                total_consumed: 0,
                total_operations: 0,
            })),
        }
    }

    /// Acquire quota units for an operation, waiting if necessary
    pub async fn acquire(&self, cost: QuotaCost) -> QuotaPermit {
        let units_needed = cost.units() as f64;

        loop {
            let wait_time = {
                let mut state = self.inner.lock().await;
                state.refill();

                trace!(
                    "Quota state: {:.1}/{:.1} units available, requesting {:.0}",
                    state.available_units,
                    state.max_units,
                    units_needed
                );

                if state.available_units >= units_needed {
                    state.consume(units_needed);
                    debug!(
                        "Acquired {} quota units, {:.1} remaining",
                        units_needed, state.available_units
                    );
                    return QuotaPermit { _private: () };
                }

                // Calculate how long to wait for enough quota
                let units_deficit = units_needed - state.available_units;
                Duration::from_secs_f64(units_deficit / state.refill_rate)
            };

            // Wait outside the lock to allow other operations to proceed
            debug!(
                "Quota exhausted, waiting {:.2}s for {} units",
                wait_time.as_secs_f64(),
                units_needed
            );
            tokio::time::sleep(wait_time).await;
        }
    }

    /// Try to acquire quota units without waiting
    ///
    /// Returns `Some(QuotaPermit)` if quota was available, `None` otherwise
    pub async fn try_acquire(&self, cost: QuotaCost) -> Option<QuotaPermit> {
        let units_needed = cost.units() as f64;
        let mut state = self.inner.lock().await;
        state.refill();

        if state.available_units >= units_needed {
            state.consume(units_needed);
            Some(QuotaPermit { _private: () })
        } else {
            None
        }
    }

    /// Get current statistics about quota usage
    pub async fn stats(&self) -> QuotaStats {
        let state = self.inner.lock().await;
        QuotaStats {
            available_units: state.available_units as u32,
            max_units: state.max_units as u32,
            refill_rate: state.refill_rate as u32,
            total_consumed: state.total_consumed,
            total_operations: state.total_operations,
        }
    }

    /// Check current available quota without consuming any
    pub async fn available(&self) -> f64 {
        let mut state = self.inner.lock().await;
        state.refill();
        state.available_units
    }
}

impl Default for QuotaRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for QuotaRateLimiter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A permit representing acquired quota
///
/// Currently just a marker type returned from `acquire()`.
#[derive(Debug)]
pub struct QuotaPermit {
    _private: (),
}

/// Statistics about quota usage
#[derive(Debug, Clone)]
pub struct QuotaStats {
    /// Currently available quota units
    pub available_units: u32,
    /// Maximum burst capacity
    pub max_units: u32,
    /// Refill rate (units per second)
    pub refill_rate: u32,
    /// Total quota units consumed since creation
    pub total_consumed: u64,
    /// Total operations performed
    pub total_operations: u64,
}
