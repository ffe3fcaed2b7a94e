//! Recovery configuration.
//!
//! Defaults follow the RECOMMENDED values of RFC 9002 Appendix A; all knobs
//! are serde-serializable so callers can load them from their own config
//! layers.

use serde::{Deserialize, Serialize};

use crate::types::{TimeMillis, DEFAULT_INITIAL_RTT_MS, MAX_ACK_DELAY_MS};

/// Tuning knobs for a [`Recovery`](crate::recovery::Recovery) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Initial RTT estimate before any samples (RFC 9002 Appendix A.2).
    pub initial_rtt: TimeMillis,

    /// Reordering threshold in packets (RFC 9002 Section 6.1.1).
    ///
    /// A packet is declared lost when at least this many higher-numbered
    /// packets have been acknowledged.
    pub packet_threshold: u64,

    /// Reordering threshold in time, as a multiplier of
    /// `max(smoothed_rtt, latest_rtt)` (RFC 9002 Section 6.1.2).
    pub time_threshold: f64,

    /// Maximum time the local endpoint delays ACKs for ack-eliciting
    /// packets (RFC 9002 Section 6.2).
    pub max_ack_delay: TimeMillis,

    /// Number of ack-eliciting receipts that force an immediate ACK
    /// (RFC 9000 Section 13.2.2).
    pub ack_frequency_threshold: u32,

    /// Per-packet retransmission cap; packets at the cap drop out of
    /// retransmission scheduling.
    pub max_retransmissions: u32,

    /// How long received-packet and retransmission records are retained by
    /// [`Recovery::cleanup`](crate::recovery::Recovery::cleanup), in ms.
    pub cleanup_retention: TimeMillis,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_rtt: DEFAULT_INITIAL_RTT_MS,
            packet_threshold: 3,
            time_threshold: 9.0 / 8.0,
            max_ack_delay: MAX_ACK_DELAY_MS,
            ack_frequency_threshold: 2,
            max_retransmissions: 5,
            cleanup_retention: 300_000.0,
        }
    }
}

impl RecoveryConfig {
    /// Validate the configuration.
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.initial_rtt.is_finite() || self.initial_rtt <= 0.0 {
            errors.push(format!(
                "initial_rtt must be a positive number of milliseconds, got {}",
                self.initial_rtt
            ));
        }
        if self.packet_threshold == 0 {
            errors.push("packet_threshold must be at least 1".to_string());
        }
        if !self.time_threshold.is_finite() || self.time_threshold < 1.0 {
            errors.push(format!(
                "time_threshold must be >= 1.0, got {}",
                self.time_threshold
            ));
        }
        if !self.max_ack_delay.is_finite() || self.max_ack_delay < 0.0 {
            errors.push(format!(
                "max_ack_delay must be non-negative, got {}",
                self.max_ack_delay
            ));
        }
        if self.max_retransmissions == 0 {
            errors.push("max_retransmissions must be at least 1".to_string());
        }
        if !self.cleanup_retention.is_finite() || self.cleanup_retention <= 0.0 {
            errors.push(format!(
                "cleanup_retention must be positive, got {}",
                self.cleanup_retention
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
