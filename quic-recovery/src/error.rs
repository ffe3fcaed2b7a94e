//! Error types for recovery operations.
//!
//! The three variants below are programmer errors: they abort the current
//! operation and nothing else. Every other anomalous input (duplicate ACKs,
//! duplicate receipts, loss-marking of unknown packets) is a documented
//! silent no-op, because a QUIC endpoint must assume an adversarial network.

use thiserror::Error;

/// Recovery errors.
///
/// Statistics and advice queries never fail; only the state-mutating entry
/// points validate their inputs.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum RecoveryError {
    /// An RTT sample must be a positive, finite number of milliseconds
    /// (RFC 9002 Section 5.1: samples are measured, never zero or negative).
    #[error("invalid RTT sample: {0} ms")]
    InvalidRttSample(f64),

    /// The PTO backoff exponent left the representable range; `1 << count`
    /// must fit a `u64` (RFC 9002 Section 6.2).
    #[error("invalid PTO count: {0}")]
    InvalidPtoCount(u32),

    /// Packet numbers are 62-bit integers (RFC 9000 Section 12.3).
    #[error("invalid packet number: {0} exceeds 2^62 - 1")]
    InvalidPacketNumber(u64),
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, RecoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            RecoveryError::InvalidRttSample(-1.0).to_string(),
            "invalid RTT sample: -1 ms"
        );
        assert_eq!(
            RecoveryError::InvalidPtoCount(63).to_string(),
            "invalid PTO count: 63"
        );
        assert_eq!(
            RecoveryError::InvalidPacketNumber(1 << 62).to_string(),
            format!("invalid packet number: {} exceeds 2^62 - 1", 1u64 << 62)
        );
    }
}
