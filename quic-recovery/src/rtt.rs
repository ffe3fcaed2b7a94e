//! # RTT Estimation (RFC 9002 Section 5)
//!
//! Calculates smoothed RTT and RTT variance for loss and probe timeout
//! calculations.

#![forbid(unsafe_code)]

use serde::Serialize;
use tracing::trace;

use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, Result};
use crate::types::{
    TimeMillis, DEFAULT_INITIAL_RTT_MS, MAX_ACK_DELAY_MS, MIN_RTT_FLOOR_MS, TIMER_GRANULARITY_MS,
};

/// Largest accepted PTO backoff exponent: `1u64 << count` must stay
/// representable.
pub const MAX_PTO_EXPONENT: u32 = 62;

/// RTT Estimator (RFC 9002 Section 5)
///
/// Tracks smoothed RTT (SRTT) and RTT variance (RTTVAR) using
/// exponentially weighted moving averages over caller-timed samples.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT (SRTT)
    smoothed_rtt: TimeMillis,

    /// RTT variance (RTTVAR)
    rtt_variation: TimeMillis,

    /// Minimum RTT observed; may sit below the reporting floor
    min_rtt: TimeMillis,

    /// Latest RTT sample
    latest_rtt: TimeMillis,

    /// Number of samples folded in so far
    sample_count: u64,

    /// Construction-time estimate, kept for `reset`
    initial_rtt: TimeMillis,

    /// Peer's maximum ACK delay, added into every PTO
    max_ack_delay: TimeMillis,
}

impl RttEstimator {
    /// Create a new RTT estimator with an initial RTT estimate in ms.
    pub fn new(initial_rtt: TimeMillis) -> Self {
        Self {
            smoothed_rtt: initial_rtt,
            rtt_variation: initial_rtt / 2.0,
            min_rtt: initial_rtt,
            latest_rtt: initial_rtt,
            sample_count: 0,
            initial_rtt,
            max_ack_delay: MAX_ACK_DELAY_MS,
        }
    }

    /// Create an estimator from a [`RecoveryConfig`].
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_ack_delay: config.max_ack_delay,
            ..Self::new(config.initial_rtt)
        }
    }

    /// Update RTT estimates with a new sample (RFC 9002 Section 5.3).
    ///
    /// `sample` is the measured round trip in ms and must be positive.
    /// `ack_delay` is the delay the peer reported in its ACK frame, in ms;
    /// it is subtracted from the sample only when it does not exceed
    /// `max_ack_delay` and never below `min_rtt`.
    pub fn update_rtt(&mut self, sample: TimeMillis, ack_delay: TimeMillis) -> Result<()> {
        if !sample.is_finite() || sample <= 0.0 {
            return Err(RecoveryError::InvalidRttSample(sample));
        }

        self.latest_rtt = sample;
        if sample < self.min_rtt {
            self.min_rtt = sample;
        }

        // RFC 9002 Section 5.3: adjust for the peer's ACK delay, but not
        // below min_rtt, and ignore delays above the advertised maximum.
        let mut adjusted = sample;
        if ack_delay > 0.0 && ack_delay <= self.max_ack_delay {
            adjusted = (sample - ack_delay).max(self.min_rtt);
        }

        if self.sample_count == 0 {
            // First RTT sample
            self.smoothed_rtt = adjusted;
            self.rtt_variation = adjusted / 2.0;
        } else {
            // Subsequent samples: exponentially weighted moving averages
            // RTTVAR = (3/4) * RTTVAR + (1/4) * |SRTT - adjusted|
            // SRTT   = (7/8) * SRTT + (1/8) * adjusted
            self.rtt_variation =
                0.75 * self.rtt_variation + 0.25 * (self.smoothed_rtt - adjusted).abs();
            self.smoothed_rtt = 0.875 * self.smoothed_rtt + 0.125 * adjusted;
        }
        self.sample_count += 1;

        trace!(
            sample,
            ack_delay,
            smoothed_rtt = self.smoothed_rtt,
            rtt_variation = self.rtt_variation,
            "rtt sample folded"
        );
        Ok(())
    }

    /// Calculate the Probe Timeout duration (RFC 9002 Section 6.2).
    ///
    /// PTO = (SRTT + max(4*RTTVAR, kGranularity) + max_ack_delay) * 2^pto_count
    pub fn calculate_pto(&self, pto_count: u32) -> Result<TimeMillis> {
        if pto_count > MAX_PTO_EXPONENT {
            return Err(RecoveryError::InvalidPtoCount(pto_count));
        }
        let base = self.smoothed_rtt
            + (4.0 * self.rtt_variation).max(TIMER_GRANULARITY_MS)
            + self.max_ack_delay;
        Ok(base * (1u64 << pto_count) as f64)
    }

    /// Return every field to its construction default.
    pub fn reset(&mut self) {
        *self = Self {
            max_ack_delay: self.max_ack_delay,
            ..Self::new(self.initial_rtt)
        };
    }

    /// Get smoothed RTT in ms.
    pub fn smoothed_rtt(&self) -> TimeMillis {
        self.smoothed_rtt
    }

    /// Get RTT variance in ms.
    pub fn rtt_variation(&self) -> TimeMillis {
        self.rtt_variation
    }

    /// Get the minimum RTT observed, clamped to the 1 ms reporting floor.
    pub fn min_rtt(&self) -> TimeMillis {
        self.min_rtt.max(MIN_RTT_FLOOR_MS)
    }

    /// Get the latest RTT sample in ms.
    pub fn latest_rtt(&self) -> TimeMillis {
        self.latest_rtt
    }

    /// Number of samples folded in so far.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Snapshot for statistics export.
    pub fn stats(&self) -> RttStats {
        RttStats {
            smoothed_rtt: self.smoothed_rtt,
            rtt_variation: self.rtt_variation,
            min_rtt: self.min_rtt(),
            latest_rtt: self.latest_rtt,
            sample_count: self.sample_count,
        }
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT_MS)
    }
}

/// Point-in-time RTT statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RttStats {
    pub smoothed_rtt: TimeMillis,
    pub rtt_variation: TimeMillis,
    pub min_rtt: TimeMillis,
    pub latest_rtt: TimeMillis,
    pub sample_count: u64,
}

// ============================================================================
// Unit Tests
// ============================================================================
