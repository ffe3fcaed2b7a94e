//! # Retransmission Policy (RFC 9002 Sections 6.2-6.3)
//!
//! Maps lost and probed packets onto retransmission records with capped
//! per-packet attempts and exponential backoff, and runs the full
//! inbound-ACK pipeline across the tracker, RTT estimator, and loss
//! detector.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::loss::{LossDetector, LossTimeoutAction};
use crate::rtt::RttEstimator;
use crate::tracker::SentPacketTracker;
use crate::types::{AckFrame, PacketNumber, Payload, TimeMillis};

/// Per-packet retransmission cap.
pub const MAX_RETRANSMISSIONS: u32 = 5;

/// Exponential backoff base.
pub const BACKOFF_BASE: u32 = 2;

/// Fraction of sent packets that may be retransmitted before the path is
/// considered a retransmission storm.
const STORM_RATE_THRESHOLD: f64 = 0.5;

/// A probe packet selected on PTO expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord<P> {
    pub packet_number: PacketNumber,
    /// The original payload handle, to be re-enqueued by the caller.
    pub payload: P,
    /// Retransmission attempts charged to this packet so far.
    pub retransmission_count: u32,
}

/// A lost packet eligible for retransmission.
#[derive(Debug, Clone, PartialEq)]
pub struct RetransmissionRecord<P> {
    pub packet_number: PacketNumber,
    pub payload: P,
    /// Attempts charged so far (below the cap).
    pub attempts: u32,
    /// Backoff multiplier the caller should apply: `2^attempts`.
    pub backoff_multiplier: u32,
}

/// What an expired recovery timer produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PtoOutcome<P> {
    /// The loss timer fired: these packets crossed a threshold.
    LossDetected(Vec<PacketNumber>),
    /// The PTO fired: send these probes.
    Probes(Vec<ProbeRecord<P>>),
}

/// Summary of an inbound ACK, the event stream a congestion controller
/// would consume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckEvents {
    /// Packets newly acknowledged by this frame.
    pub newly_acked: Vec<PacketNumber>,
    /// Packets the frame's arrival exposed as lost.
    pub lost: Vec<PacketNumber>,
    /// Whether any newly acknowledged packet was ack-eliciting.
    pub ack_eliciting_acked: bool,
}

/// Retransmission bookkeeping.
#[derive(Debug, Clone)]
pub struct RetransmissionManager {
    max_retransmissions: u32,

    /// Attempts charged per packet, capped at `max_retransmissions`.
    attempts: BTreeMap<PacketNumber, u32>,

    /// Last time a retransmission was charged per packet.
    last_retransmission_time: BTreeMap<PacketNumber, TimeMillis>,

    /// Total attempts charged over the connection's lifetime.
    total_retransmissions: u64,
}

impl RetransmissionManager {
    pub fn new() -> Self {
        Self {
            max_retransmissions: MAX_RETRANSMISSIONS,
            attempts: BTreeMap::new(),
            last_retransmission_time: BTreeMap::new(),
            total_retransmissions: 0,
        }
    }

    /// Create a manager from a [`RecoveryConfig`].
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_retransmissions: config.max_retransmissions,
            ..Self::new()
        }
    }

    /// Run the inbound-ACK pipeline.
    ///
    /// Folds the frame into the tracker, samples RTT from the newest-acked
    /// packet (adjusted by the peer-reported delay), resets the PTO backoff,
    /// runs a loss-detection pass at `ack_time`, and charges a
    /// retransmission attempt for every packet that pass declared lost.
    pub fn on_ack_received<P: Payload>(
        &mut self,
        frame: &AckFrame,
        ack_time: TimeMillis,
        tracker: &mut SentPacketTracker<P>,
        rtt: &mut RttEstimator,
        loss: &mut LossDetector,
    ) -> Result<AckEvents> {
        let outcome = tracker.on_ack_received(&frame.ack_ranges, ack_time);

        if outcome.newly_acked.contains(&frame.largest_acked) {
            if let Some(sent_time) = tracker.sent_time(frame.largest_acked) {
                let sample = ack_time - sent_time;
                if sample > 0.0 {
                    rtt.update_rtt(sample, frame.ack_delay as f64 / 1000.0)?;
                } else {
                    // Same-millisecond ACK: nothing measurable, skip the sample
                    trace!(sample, "rtt sample skipped");
                }
            }
        }

        let mut events = AckEvents {
            newly_acked: outcome.newly_acked,
            lost: Vec::new(),
            ack_eliciting_acked: outcome.ack_eliciting_acked,
        };
        if !events.newly_acked.is_empty() {
            loss.on_ack_received();
            let result = loss.detect_lost_packets(tracker, rtt, ack_time);
            for &n in &result.lost {
                self.register_attempt(n, ack_time);
            }
            events.lost = result.lost;
        }
        Ok(events)
    }

    /// Handle an expired recovery timer.
    ///
    /// Delegates to the loss detector; when the PTO path fires, each probe
    /// is charged a retransmission attempt and stamped with `now`. A packet
    /// at the attempt cap is dropped from probing.
    pub fn on_pto_timeout<P: Payload + Clone>(
        &mut self,
        now: TimeMillis,
        tracker: &mut SentPacketTracker<P>,
        rtt: &RttEstimator,
        loss: &mut LossDetector,
    ) -> PtoOutcome<P> {
        match loss.on_loss_detection_timeout(tracker, rtt, now) {
            LossTimeoutAction::DetectLoss(result) => {
                for &n in &result.lost {
                    self.register_attempt(n, now);
                }
                PtoOutcome::LossDetected(result.lost)
            }
            LossTimeoutAction::SendProbes(numbers) => {
                let mut probes = Vec::new();
                for n in numbers {
                    let Some(record) = tracker.sent_packet(n) else {
                        continue;
                    };
                    let payload = record.payload.clone();
                    if let Some(count) = self.register_attempt(n, now) {
                        probes.push(ProbeRecord {
                            packet_number: n,
                            payload,
                            retransmission_count: count,
                        });
                    }
                }
                PtoOutcome::Probes(probes)
            }
        }
    }

    /// Charge a retransmission attempt against a packet.
    ///
    /// Returns the new attempt count, or `None` when the packet already sits
    /// at the cap and drops out of retransmission scheduling.
    fn register_attempt(&mut self, packet_number: PacketNumber, now: TimeMillis) -> Option<u32> {
        let count = self.attempts.entry(packet_number).or_insert(0);
        if *count >= self.max_retransmissions {
            debug!(packet_number, "retransmission cap reached, dropping packet");
            return None;
        }
        *count += 1;
        self.total_retransmissions += 1;
        self.last_retransmission_time.insert(packet_number, now);
        trace!(packet_number, attempts = *count, "retransmission attempt charged");
        Some(*count)
    }

    /// Lost packets still eligible for retransmission, with the backoff
    /// multiplier the caller should apply to its resend pacing.
    pub fn get_packets_for_retransmission<P: Payload + Clone>(
        &self,
        tracker: &SentPacketTracker<P>,
    ) -> Vec<RetransmissionRecord<P>> {
        tracker
            .get_packets_for_retransmission()
            .into_iter()
            .filter_map(|record| {
                let attempts = self
                    .attempts
                    .get(&record.packet_number)
                    .copied()
                    .unwrap_or(0);
                if attempts >= self.max_retransmissions {
                    return None;
                }
                Some(RetransmissionRecord {
                    packet_number: record.packet_number,
                    payload: record.payload.clone(),
                    attempts,
                    backoff_multiplier: BACKOFF_BASE.pow(attempts),
                })
            })
            .collect()
    }

    /// Suggested delay before retransmission attempt `attempt`:
    /// `smoothed_rtt * 2^attempt`, with the exponent clamped at zero so
    /// out-of-range inputs still yield a positive delay.
    pub fn calculate_retransmission_delay(
        &self,
        rtt: &RttEstimator,
        attempt: i32,
    ) -> TimeMillis {
        rtt.smoothed_rtt() * f64::from(BACKOFF_BASE).powi(attempt.max(0))
    }

    /// Lifetime retransmissions per sent packet number.
    pub fn retransmission_rate<P: Payload>(&self, tracker: &SentPacketTracker<P>) -> f64 {
        match tracker.largest_sent() {
            Some(largest) => self.total_retransmissions as f64 / (largest + 1) as f64,
            None => 0.0,
        }
    }

    /// Whether more than half of all sent packet numbers have been
    /// retransmitted.
    pub fn is_in_retransmission_storm<P: Payload>(
        &self,
        tracker: &SentPacketTracker<P>,
    ) -> bool {
        self.retransmission_rate(tracker) > STORM_RATE_THRESHOLD
    }

    /// Drop retransmission stamps strictly below `cutoff`; a stamp exactly
    /// at the cutoff survives.
    pub fn purge_old(&mut self, cutoff: TimeMillis) {
        self.last_retransmission_time.retain(|_, &mut t| t >= cutoff);
    }

    pub fn total_retransmissions(&self) -> u64 {
        self.total_retransmissions
    }

    /// Number of packets with at least one charged attempt.
    pub fn tracked_packets(&self) -> usize {
        self.attempts.len()
    }

    /// Last time an attempt was charged against a packet.
    pub fn last_retransmission_time(&self, packet_number: PacketNumber) -> Option<TimeMillis> {
        self.last_retransmission_time.get(&packet_number).copied()
    }

    pub fn reset(&mut self) {
        self.attempts.clear();
        self.last_retransmission_time.clear();
        self.total_retransmissions = 0;
    }
}

impl Default for RetransmissionManager {
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
    use crate::types::AckRange;
    use bytes::Bytes;

    fn payload() -> Bytes {
        Bytes::from_static(b"probe data")
    }

    struct Harness {
        tracker: SentPacketTracker<Bytes>,
        rtt: RttEstimator,
        loss: LossDetector,
        manager: RetransmissionManager,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                tracker: SentPacketTracker::new(),
                rtt: RttEstimator::default(),
                loss: LossDetector::new(),
                manager: RetransmissionManager::new(),
            }
        }

        fn send(&mut self, range: std::ops::RangeInclusive<u64>, base_time: f64) {
            for n in range {
                self.tracker
                    .on_packet_sent(n, payload(), base_time + n as f64, true)
                    .unwrap();
            }
        }

        fn ack(&mut self, frame: &AckFrame, ack_time: f64) -> AckEvents {
            self.manager
                .on_ack_received(
                    frame,
                    ack_time,
                    &mut self.tracker,
                    &mut self.rtt,
                    &mut self.loss,
                )
                .unwrap()
        }
    }

    fn frame(largest: u64, ack_delay: u64, ranges: &[(u64, u64)]) -> AckFrame {
        AckFrame {
            largest_acked: largest,
            ack_delay,
            ack_ranges: ranges.iter().map(|&(s, e)| AckRange::new(s, e)).collect(),
        }
    }

    mod ack_pipeline_tests {
        use super::*;

        #[test]
        fn test_rtt_sampled_from_newest_acked() {
            let mut h = Harness::new();
            h.send(1..=10, 1000.0);

            // Packet 10 went out at 1010; acked at 1200 -> 190ms sample
            let events = h.ack(&frame(10, 0, &[(7, 10)]), 1200.0);
            assert_eq!(events.newly_acked, vec![7, 8, 9, 10]);
            assert!(events.ack_eliciting_acked);
            assert_eq!(h.rtt.sample_count(), 1);
            assert_eq!(h.rtt.latest_rtt(), 190.0);
        }

        #[test]
        fn test_ack_delay_microseconds_converted() {
            let mut h = Harness::new();
            h.send(1..=1, 1000.0);

            // 10_000us = 10ms of peer delay on a 101ms sample
            h.ack(&frame(1, 10_000, &[(1, 1)]), 1102.0);
            assert_eq!(h.rtt.latest_rtt(), 101.0);
            // adjusted = max(101 - 10, min_rtt=101) = 101
            assert_eq!(h.rtt.smoothed_rtt(), 101.0);
        }

        #[test]
        fn test_no_rtt_sample_without_largest_acked() {
            let mut h = Harness::new();
            h.send(1..=5, 1000.0);

            // The frame claims largest 9, which was never sent
            let events = h.ack(&frame(9, 0, &[(4, 5)]), 1200.0);
            assert_eq!(events.newly_acked, vec![4, 5]);
            assert_eq!(h.rtt.sample_count(), 0);
        }

        #[test]
        fn test_duplicate_frame_is_inert() {
            let mut h = Harness::new();
            h.send(1..=10, 1000.0);
            h.ack(&frame(10, 0, &[(7, 10)]), 1200.0);

            let before = h.loss.pto_count();
            let events = h.ack(&frame(10, 0, &[(7, 10)]), 1300.0);
            assert!(events.newly_acked.is_empty());
            assert!(events.lost.is_empty());
            assert_eq!(h.rtt.sample_count(), 1);
            assert_eq!(h.loss.pto_count(), before);
        }

        #[test]
        fn test_losses_detected_and_charged_at_ack_time() {
            let mut h = Harness::new();
            h.send(1..=10, 1000.0);

            let events = h.ack(&frame(10, 0, &[(7, 10)]), 1200.0);
            assert_eq!(events.lost, vec![1, 2, 3, 4, 5, 6]);
            assert_eq!(h.manager.total_retransmissions(), 6);
            assert_eq!(h.manager.last_retransmission_time(3), Some(1200.0));
        }

        #[test]
        fn test_ack_resets_pto_backoff() {
            let mut h = Harness::new();
            h.send(1..=2, 1000.0);
            h.manager
                .on_pto_timeout(5000.0, &mut h.tracker, &h.rtt, &mut h.loss);
            assert_eq!(h.loss.pto_count(), 1);

            h.ack(&frame(2, 0, &[(2, 2)]), 6000.0);
            assert_eq!(h.loss.pto_count(), 0);
        }
    }

    mod probe_tests {
        use super::*;

        #[test]
        fn test_probes_charged_and_stamped() {
            let mut h = Harness::new();
            h.send(1..=3, 1000.0);

            let outcome = h
                .manager
                .on_pto_timeout(5000.0, &mut h.tracker, &h.rtt, &mut h.loss);
            let PtoOutcome::Probes(probes) = outcome else {
                panic!("expected probes");
            };
            assert_eq!(probes.len(), 2);
            assert_eq!(probes[0].packet_number, 1);
            assert_eq!(probes[0].retransmission_count, 1);
            assert_eq!(probes[0].payload, payload());
            assert_eq!(h.manager.total_retransmissions(), 2);
            assert_eq!(h.manager.last_retransmission_time(1), Some(5000.0));
        }

        #[test]
        fn test_probe_at_cap_is_dropped() {
            let mut h = Harness::new();
            h.send(1..=1, 1000.0);

            for _ in 0..MAX_RETRANSMISSIONS {
                h.manager
                    .on_pto_timeout(5000.0, &mut h.tracker, &h.rtt, &mut h.loss);
            }
            let outcome = h
                .manager
                .on_pto_timeout(9000.0, &mut h.tracker, &h.rtt, &mut h.loss);
            assert_eq!(outcome, PtoOutcome::Probes(vec![]));
            assert_eq!(h.manager.total_retransmissions(), 5);
        }

        #[test]
        fn test_due_loss_timer_yields_loss_outcome() {
            let mut h = Harness::new();
            h.rtt.update_rtt(100.0, 0.0).unwrap();
            h.tracker.on_packet_sent(1, payload(), 1000.0, true).unwrap();
            h.tracker.on_packet_sent(2, payload(), 1100.0, true).unwrap();
            h.tracker.on_ack_received(&[AckRange::new(2, 2)], 1105.0);
            h.loss.detect_lost_packets(&mut h.tracker, &h.rtt, 1106.0);
            assert!(h.loss.loss_time() > 0.0);

            let outcome = h
                .manager
                .on_pto_timeout(1300.0, &mut h.tracker, &h.rtt, &mut h.loss);
            assert_eq!(outcome, PtoOutcome::LossDetected(vec![1]));
            assert_eq!(h.manager.total_retransmissions(), 1);
        }
    }

    mod scheduling_tests {
        use super::*;

        #[test]
        fn test_retransmission_records_carry_backoff() {
            let mut h = Harness::new();
            h.send(1..=10, 1000.0);
            h.ack(&frame(10, 0, &[(7, 10)]), 1200.0);

            let records = h.manager.get_packets_for_retransmission(&h.tracker);
            assert_eq!(records.len(), 6);
            assert_eq!(records[0].packet_number, 1);
            assert_eq!(records[0].attempts, 1);
            assert_eq!(records[0].backoff_multiplier, 2);
        }

        #[test]
        fn test_capped_packets_leave_scheduling() {
            let mut h = Harness::new();
            h.send(1..=1, 1000.0);
            h.tracker.on_packet_lost(1);
            for t in 0..MAX_RETRANSMISSIONS {
                h.manager.register_attempt(1, 2000.0 + t as f64);
            }

            assert!(h.manager.get_packets_for_retransmission(&h.tracker).is_empty());
            assert_eq!(h.manager.register_attempt(1, 9000.0), None);
        }

        #[test]
        fn test_retransmission_delay_backoff() {
            let mut h = Harness::new();
            h.rtt.update_rtt(100.0, 0.0).unwrap();

            assert_eq!(h.manager.calculate_retransmission_delay(&h.rtt, 0), 100.0);
            assert_eq!(h.manager.calculate_retransmission_delay(&h.rtt, 3), 800.0);
            // Out-of-range exponents clamp to zero, staying positive
            assert_eq!(h.manager.calculate_retransmission_delay(&h.rtt, -4), 100.0);
        }
    }

    mod storm_tests {
        use super::*;

        #[test]
        fn test_storm_threshold() {
            let mut h = Harness::new();
            h.send(0..=9, 1000.0);

            for n in 0..5u64 {
                h.manager.register_attempt(n, 2000.0);
            }
            // 5 retransmissions over 10 packet numbers: exactly at the edge
            assert!(!h.manager.is_in_retransmission_storm(&h.tracker));

            h.manager.register_attempt(5, 2001.0);
            assert!(h.manager.is_in_retransmission_storm(&h.tracker));
        }

        #[test]
        fn test_no_storm_before_any_send() {
            let h = Harness::new();
            assert_eq!(h.manager.retransmission_rate(&h.tracker), 0.0);
            assert!(!h.manager.is_in_retransmission_storm(&h.tracker));
        }

        #[test]
        fn test_purge_boundary_is_strict() {
            let mut h = Harness::new();
            h.manager.register_attempt(1, 999.0);
            h.manager.register_attempt(2, 1000.0);

            h.manager.purge_old(1000.0);
            assert_eq!(h.manager.last_retransmission_time(1), None);
            assert_eq!(h.manager.last_retransmission_time(2), Some(1000.0));
        }

        #[test]
        fn test_reset() {
            let mut h = Harness::new();
            h.manager.register_attempt(1, 1000.0);
            h.manager.reset();

            assert_eq!(h.manager.total_retransmissions(), 0);
            assert_eq!(h.manager.tracked_packets(), 0);
        }
    }
}
