//! # Local ACK Accounting (RFC 9000 Section 13.2, RFC 9002 Section 6.2)
//!
//! Tracks received packet numbers, decides when an ACK must go out, and
//! builds the ACK frames summarizing what this endpoint has received.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, Result};
use crate::types::{
    AckFrame, AckRange, PacketNumber, TimeMillis, MAX_ACK_DELAY_MS, MAX_PACKET_NUMBER,
};

/// Ack-eliciting receipts that force an immediate ACK
/// (RFC 9000 Section 13.2.2: every second ack-eliciting packet).
pub const ACK_FREQUENCY_THRESHOLD: u32 = 2;

/// Received-packet bookkeeping for ACK generation.
#[derive(Debug, Clone)]
pub struct AckManager {
    max_ack_delay: TimeMillis,
    ack_frequency_threshold: u32,

    /// Receive time per packet number; doubles as the duplicate filter.
    received: BTreeMap<PacketNumber, TimeMillis>,

    /// Numbers not yet covered by an emitted ACK frame.
    pending_ack: BTreeSet<PacketNumber>,

    largest_received: Option<PacketNumber>,
    largest_received_time: TimeMillis,

    /// Ack-eliciting packets received since the last ACK was emitted.
    ack_eliciting_received: u32,

    /// Whether an ACK is owed to the peer.
    ack_pending: bool,

    /// Deadline for the delayed ACK (0 = none armed).
    ack_timeout: TimeMillis,
}

impl AckManager {
    pub fn new() -> Self {
        Self {
            max_ack_delay: MAX_ACK_DELAY_MS,
            ack_frequency_threshold: ACK_FREQUENCY_THRESHOLD,
            received: BTreeMap::new(),
            pending_ack: BTreeSet::new(),
            largest_received: None,
            largest_received_time: 0.0,
            ack_eliciting_received: 0,
            ack_pending: false,
            ack_timeout: 0.0,
        }
    }

    /// Create a manager from a [`RecoveryConfig`].
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_ack_delay: config.max_ack_delay,
            ack_frequency_threshold: config.ack_frequency_threshold,
            ..Self::new()
        }
    }

    /// Record receipt of a packet. Duplicates are silent no-ops.
    ///
    /// Every ack-eliciting receipt re-arms the delayed-ACK deadline at
    /// `recv_time + max_ack_delay`.
    pub fn on_packet_received(
        &mut self,
        packet_number: PacketNumber,
        recv_time: TimeMillis,
        ack_eliciting: bool,
    ) -> Result<()> {
        if packet_number > MAX_PACKET_NUMBER {
            return Err(RecoveryError::InvalidPacketNumber(packet_number));
        }
        if self.received.contains_key(&packet_number) {
            trace!(packet_number, "duplicate receipt ignored");
            return Ok(());
        }

        self.received.insert(packet_number, recv_time);
        self.pending_ack.insert(packet_number);

        if self.largest_received.map_or(true, |l| packet_number > l) {
            self.largest_received = Some(packet_number);
            self.largest_received_time = recv_time;
        }

        if ack_eliciting {
            self.ack_eliciting_received += 1;
            self.ack_pending = true;
            self.ack_timeout = recv_time + self.max_ack_delay;
        }

        trace!(packet_number, recv_time, ack_eliciting, "packet received");
        Ok(())
    }

    /// Whether an ACK should go out right now: the ack-eliciting frequency
    /// threshold was reached, or the delayed-ACK deadline passed.
    pub fn should_send_ack_immediately(&self, now: TimeMillis) -> bool {
        self.ack_eliciting_received >= self.ack_frequency_threshold
            || (self.ack_pending && now >= self.ack_timeout)
    }

    /// Build an ACK frame covering every pending number, or `None` when
    /// nothing is pending.
    ///
    /// Ranges are coalesced and emitted in descending order of their upper
    /// endpoints. Emitting resets the pending state; the received set is
    /// preserved for duplicate suppression.
    pub fn generate_ack_frame(&mut self, now: TimeMillis) -> Option<AckFrame> {
        if self.pending_ack.is_empty() {
            return None;
        }
        let largest_acked = self.largest_received?;

        let ack_delay_ms = (now - self.largest_received_time).max(0.0);
        let ack_delay = (ack_delay_ms * 1000.0).round() as u64;

        let mut ranges: Vec<AckRange> = Vec::new();
        for &n in &self.pending_ack {
            match ranges.last_mut() {
                Some(last) if n == last.end + 1 => last.end = n,
                _ => ranges.push(AckRange::new(n, n)),
            }
        }
        ranges.reverse();

        self.pending_ack.clear();
        self.ack_eliciting_received = 0;
        self.ack_pending = false;
        self.ack_timeout = 0.0;

        debug!(largest_acked, ack_delay, ranges = ranges.len(), "ack frame generated");
        Some(AckFrame {
            largest_acked,
            ack_delay,
            ack_ranges: ranges,
        })
    }

    /// External confirmation of an ACK that actually went out: drop those
    /// numbers from the pending set.
    pub fn on_ack_sent(&mut self, ranges: &[AckRange]) {
        self.pending_ack
            .retain(|&n| !ranges.iter().any(|r| r.contains(n)));
    }

    /// Every packet number in `[0, largest_received]` never seen.
    pub fn detect_missing_packets(&self) -> Vec<PacketNumber> {
        let Some(largest) = self.largest_received else {
            return Vec::new();
        };

        let mut missing = Vec::new();
        let mut expected: PacketNumber = 0;
        for (&n, _) in self.received.range(..=largest) {
            missing.extend(expected..n);
            expected = n + 1;
        }
        missing.extend(expected..=largest);
        missing
    }

    /// Drop received and pending records whose receive time is strictly
    /// below `cutoff`; a record stamped exactly at the cutoff survives.
    pub fn cleanup_old_records(&mut self, cutoff: TimeMillis) {
        self.received.retain(|_, &mut t| t >= cutoff);
        let received = &self.received;
        self.pending_ack.retain(|n| received.contains_key(n));
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.largest_received
    }

    pub fn largest_received_time(&self) -> TimeMillis {
        self.largest_received_time
    }

    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Delayed-ACK deadline (0 = none armed).
    pub fn ack_timeout(&self) -> TimeMillis {
        self.ack_timeout
    }

    pub fn ack_eliciting_received(&self) -> u32 {
        self.ack_eliciting_received
    }

    pub fn pending_count(&self) -> usize {
        self.pending_ack.len()
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn reset(&mut self) {
        *self = Self {
            max_ack_delay: self.max_ack_delay,
            ack_frequency_threshold: self.ack_frequency_threshold,
            ..Self::new()
        };
    }
}

impl Default for AckManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod receive_tests {
        use super::*;

        #[test]
        fn test_receipt_tracks_largest() {
            let mut manager = AckManager::new();
            manager.on_packet_received(5, 1000.0, true).unwrap();
            manager.on_packet_received(3, 1001.0, true).unwrap();

            assert_eq!(manager.largest_received(), Some(5));
            assert_eq!(manager.largest_received_time(), 1000.0);
            assert_eq!(manager.received_count(), 2);
        }

        #[test]
        fn test_duplicate_receipt_is_noop() {
            let mut manager = AckManager::new();
            manager.on_packet_received(1, 1000.0, true).unwrap();
            manager.on_packet_received(1, 1005.0, true).unwrap();

            assert_eq!(manager.ack_eliciting_received(), 1);
            assert_eq!(manager.received_count(), 1);
            assert_eq!(manager.ack_timeout(), 1025.0);
        }

        #[test]
        fn test_packet_number_above_ceiling_rejected() {
            let mut manager = AckManager::new();
            let n = MAX_PACKET_NUMBER + 1;
            assert_eq!(
                manager.on_packet_received(n, 1000.0, true),
                Err(RecoveryError::InvalidPacketNumber(n))
            );
        }

        #[test]
        fn test_non_eliciting_receipt_does_not_arm_deadline() {
            let mut manager = AckManager::new();
            manager.on_packet_received(1, 1000.0, false).unwrap();

            assert!(!manager.ack_pending());
            assert_eq!(manager.ack_timeout(), 0.0);
            assert_eq!(manager.pending_count(), 1);
        }
    }

    mod elicitation_tests {
        use super::*;

        #[test]
        fn test_frequency_threshold_forces_immediate_ack() {
            let mut manager = AckManager::new();
            manager.on_packet_received(1, 1000.0, true).unwrap();
            assert!(!manager.should_send_ack_immediately(1001.0));

            manager.on_packet_received(2, 1002.0, true).unwrap();
            assert!(manager.should_send_ack_immediately(1002.0));
        }

        #[test]
        fn test_delayed_ack_deadline() {
            let mut manager = AckManager::new();
            manager.on_packet_received(1, 1000.0, true).unwrap();

            assert!(!manager.should_send_ack_immediately(1024.9));
            assert!(manager.should_send_ack_immediately(1025.0));
        }

        #[test]
        fn test_each_eliciting_receipt_rearms_deadline() {
            let mut manager = AckManager::new();
            manager.on_packet_received(1, 1000.0, true).unwrap();
            assert_eq!(manager.ack_timeout(), 1025.0);

            manager.on_packet_received(2, 1010.0, true).unwrap();
            assert_eq!(manager.ack_timeout(), 1035.0);
            assert_eq!(manager.ack_eliciting_received(), 2);
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_coalesced_descending_ranges() {
            // Receive {1,2,3,7,8,9} then build the frame 5ms after the
            // largest arrived
            let mut manager = AckManager::new();
            for (i, n) in [1u64, 2, 3, 7, 8, 9].iter().enumerate() {
                manager
                    .on_packet_received(*n, 1000.0 + i as f64, true)
                    .unwrap();
            }

            let frame = manager.generate_ack_frame(1010.0).unwrap();
            assert_eq!(frame.largest_acked, 9);
            assert_eq!(frame.ack_delay, 5000);
            assert_eq!(
                frame.ack_ranges,
                vec![AckRange::new(7, 9), AckRange::new(1, 3)]
            );
        }

        #[test]
        fn test_range_invariants_on_scattered_input() {
            let mut manager = AckManager::new();
            for &n in &[0u64, 2, 3, 5, 9, 10, 11, 20] {
                manager.on_packet_received(n, 1000.0, true).unwrap();
            }

            let frame = manager.generate_ack_frame(1001.0).unwrap();
            for range in &frame.ack_ranges {
                assert!(range.start <= range.end);
            }
            for pair in frame.ack_ranges.windows(2) {
                // Strictly descending upper endpoints, pairwise disjoint
                assert!(pair[0].start > pair[1].end + 1);
            }
        }

        #[test]
        fn test_empty_pending_yields_none() {
            let mut manager = AckManager::new();
            assert!(manager.generate_ack_frame(1000.0).is_none());
        }

        #[test]
        fn test_generation_resets_pending_but_keeps_received() {
            let mut manager = AckManager::new();
            manager.on_packet_received(1, 1000.0, true).unwrap();
            manager.on_packet_received(2, 1001.0, true).unwrap();

            manager.generate_ack_frame(1002.0).unwrap();
            assert_eq!(manager.pending_count(), 0);
            assert_eq!(manager.ack_eliciting_received(), 0);
            assert!(!manager.ack_pending());
            assert_eq!(manager.ack_timeout(), 0.0);
            assert!(manager.generate_ack_frame(1003.0).is_none());

            // The received set still suppresses duplicates
            manager.on_packet_received(2, 1004.0, true).unwrap();
            assert_eq!(manager.pending_count(), 0);
        }

        #[test]
        fn test_ack_delay_clamped_at_zero() {
            let mut manager = AckManager::new();
            manager.on_packet_received(1, 1000.0, true).unwrap();

            // A caller clock quirk must not produce a negative delay
            let frame = manager.generate_ack_frame(999.0).unwrap();
            assert_eq!(frame.ack_delay, 0);
        }

        #[test]
        fn test_on_ack_sent_removes_only_given_ranges() {
            let mut manager = AckManager::new();
            for n in 1..=6u64 {
                manager.on_packet_received(n, 1000.0, true).unwrap();
            }

            manager.on_ack_sent(&[AckRange::new(1, 3)]);
            assert_eq!(manager.pending_count(), 3);

            let frame = manager.generate_ack_frame(1001.0).unwrap();
            assert_eq!(frame.ack_ranges, vec![AckRange::new(4, 6)]);
        }
    }

    mod gap_tests {
        use super::*;

        #[test]
        fn test_detect_missing_packets() {
            let mut manager = AckManager::new();
            for &n in &[1u64, 2, 4, 5] {
                manager.on_packet_received(n, 1000.0, true).unwrap();
            }

            assert_eq!(manager.detect_missing_packets(), vec![0, 3]);
        }

        #[test]
        fn test_no_receipts_means_no_gaps() {
            let manager = AckManager::new();
            assert!(manager.detect_missing_packets().is_empty());
        }

        #[test]
        fn test_only_packet_zero_means_no_gaps() {
            let mut manager = AckManager::new();
            manager.on_packet_received(0, 1000.0, true).unwrap();
            assert!(manager.detect_missing_packets().is_empty());
        }
    }

    mod cleanup_tests {
        use super::*;

        #[test]
        fn test_cutoff_is_strictly_less_than() {
            let mut manager = AckManager::new();
            manager.on_packet_received(1, 999.0, true).unwrap();
            manager.on_packet_received(2, 1000.0, true).unwrap();
            manager.on_packet_received(3, 1001.0, true).unwrap();

            manager.cleanup_old_records(1000.0);

            // The record stamped exactly at the cutoff survives
            assert_eq!(manager.received_count(), 2);
            assert_eq!(manager.pending_count(), 2);
            assert_eq!(manager.detect_missing_packets(), vec![0, 1]);
        }

        #[test]
        fn test_reset() {
            let mut manager = AckManager::new();
            manager.on_packet_received(1, 1000.0, true).unwrap();
            manager.reset();

            assert_eq!(manager.received_count(), 0);
            assert_eq!(manager.largest_received(), None);
            assert!(!manager.ack_pending());
        }
    }
}
