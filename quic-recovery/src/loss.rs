//! # Loss Detection (RFC 9002 Section 6)
//!
//! Declares packets lost by packet threshold or time threshold, maintains
//! the loss/PTO timer, and escalates through probe timeouts. The detector
//! holds no packet state of its own: the tracker and RTT estimator are
//! borrowed per call.

#![forbid(unsafe_code)]

use tracing::{debug, warn};

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::rtt::{RttEstimator, MAX_PTO_EXPONENT};
use crate::tracker::SentPacketTracker;
use crate::types::{PacketNumber, Payload, TimeMillis};

/// Packet reordering threshold (RFC 9002 Section 6.1.1, RECOMMENDED value).
pub const PACKET_THRESHOLD: u64 = 3;

/// Time reordering threshold as a multiplier of
/// `max(smoothed_rtt, latest_rtt)` (RFC 9002 Section 6.1.2).
pub const TIME_THRESHOLD: f64 = 9.0 / 8.0;

/// Floor applied to the loss delay, in ms.
pub const MIN_TIME_THRESHOLD_MS: TimeMillis = 1.0;

/// Consecutive PTOs that signal persistent congestion
/// (RFC 9002 Section 7.6).
pub const PERSISTENT_CONGESTION_PTO_COUNT: u32 = 3;

/// Maximum probe packets selected per PTO (RFC 9002 Section 6.2.4).
pub const MAX_PTO_PROBES: usize = 2;

/// Result of a loss-detection pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossDetectionResult {
    /// Packets declared lost in this pass, lowest numbers first.
    pub lost: Vec<PacketNumber>,
    /// Earliest future time a surviving packet crosses the time threshold
    /// (0 = no pending time-based loss).
    pub next_loss_time: TimeMillis,
}

/// Action to take when the loss detection timer fires.
#[derive(Debug, Clone, PartialEq)]
pub enum LossTimeoutAction {
    /// The loss timer expired: these packets crossed a threshold.
    DetectLoss(LossDetectionResult),
    /// The PTO expired: probe the path with these packets.
    SendProbes(Vec<PacketNumber>),
}

/// Loss Detection state machine (RFC 9002 Section 6).
#[derive(Debug, Clone)]
pub struct LossDetector {
    packet_threshold: u64,
    time_threshold: f64,

    /// Consecutive PTO firings without an intervening ACK.
    pto_count: u32,

    /// Deadline of the earliest pending time-threshold loss (0 = none).
    loss_time: TimeMillis,
}

impl LossDetector {
    pub fn new() -> Self {
        Self {
            packet_threshold: PACKET_THRESHOLD,
            time_threshold: TIME_THRESHOLD,
            pto_count: 0,
            loss_time: 0.0,
        }
    }

    /// Create a detector from a [`RecoveryConfig`].
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            packet_threshold: config.packet_threshold,
            time_threshold: config.time_threshold,
            ..Self::new()
        }
    }

    /// Time threshold for declaring a packet lost (RFC 9002 Section 6.1.2):
    /// `time_threshold * max(latest_rtt, smoothed_rtt)`, floored at 1 ms.
    pub fn loss_delay(&self, rtt: &RttEstimator) -> TimeMillis {
        (self.time_threshold * rtt.latest_rtt().max(rtt.smoothed_rtt())).max(MIN_TIME_THRESHOLD_MS)
    }

    /// Run a loss-detection pass over the tracker.
    ///
    /// Marks every in-flight packet below `largest_acked` that crossed the
    /// packet or time threshold, and records when the next survivor will
    /// cross the time threshold.
    pub fn detect_lost_packets<P: Payload>(
        &mut self,
        tracker: &mut SentPacketTracker<P>,
        rtt: &RttEstimator,
        now: TimeMillis,
    ) -> LossDetectionResult {
        if tracker.largest_acked().is_none() {
            self.loss_time = 0.0;
            return LossDetectionResult::default();
        }

        let loss_delay = self.loss_delay(rtt);
        let lost = tracker.detect_lost_packets(self.packet_threshold, loss_delay, now);
        let next_loss_time = tracker
            .earliest_loss_candidate_sent_time()
            .map_or(0.0, |sent| sent + loss_delay);
        self.loss_time = next_loss_time;

        if !lost.is_empty() {
            debug!(
                lost = lost.len(),
                loss_delay, next_loss_time, "loss detection pass declared packets lost"
            );
        }
        LossDetectionResult {
            lost,
            next_loss_time,
        }
    }

    /// Deadline for the loss detection timer (RFC 9002 Section 6.2.1).
    ///
    /// A pending time-threshold loss wins; otherwise the PTO deadline is
    /// anchored at the last ack-eliciting send. Returns 0 when no
    /// ack-eliciting packets are outstanding (timer disarmed).
    pub fn calculate_loss_detection_timeout<P: Payload>(
        &self,
        tracker: &SentPacketTracker<P>,
        rtt: &RttEstimator,
        now: TimeMillis,
    ) -> Result<TimeMillis> {
        if self.loss_time > 0.0 && self.loss_time > now {
            return Ok(self.loss_time);
        }
        if tracker.outstanding_ack_eliciting() == 0 {
            return Ok(0.0);
        }

        let base_pto = rtt.calculate_pto(self.pto_count)?;
        let last_eliciting = tracker.time_of_last_sent_ack_eliciting();
        if last_eliciting == 0.0 {
            Ok(now + base_pto)
        } else {
            Ok(last_eliciting + base_pto)
        }
    }

    /// Handle an expired loss detection timer (RFC 9002 Section 6.2.1).
    ///
    /// If a time-threshold loss is due, run a detection pass. Otherwise the
    /// PTO fired: escalate the backoff and select probe packets (the two
    /// oldest in-flight ack-eliciting packets).
    pub fn on_loss_detection_timeout<P: Payload>(
        &mut self,
        tracker: &mut SentPacketTracker<P>,
        rtt: &RttEstimator,
        now: TimeMillis,
    ) -> LossTimeoutAction {
        if self.loss_time > 0.0 && now >= self.loss_time {
            return LossTimeoutAction::DetectLoss(self.detect_lost_packets(tracker, rtt, now));
        }

        if self.pto_count < MAX_PTO_EXPONENT {
            self.pto_count += 1;
        }
        let probes = tracker.oldest_ack_eliciting_in_flight(MAX_PTO_PROBES);
        if self.is_in_persistent_congestion() {
            warn!(
                pto_count = self.pto_count,
                "probe timeout fired under persistent congestion"
            );
        } else {
            debug!(pto_count = self.pto_count, probes = probes.len(), "probe timeout fired");
        }
        LossTimeoutAction::SendProbes(probes)
    }

    /// An ACK that newly acknowledged packets arrived: the path is alive,
    /// so the PTO backoff resets (RFC 9002 Section 6.2.1).
    pub fn on_ack_received(&mut self) {
        self.pto_count = 0;
    }

    /// Whether consecutive PTO firings indicate sustained path failure.
    pub fn is_in_persistent_congestion(&self) -> bool {
        self.pto_count >= PERSISTENT_CONGESTION_PTO_COUNT
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    /// Deadline of the earliest pending time-threshold loss (0 = none).
    pub fn loss_time(&self) -> TimeMillis {
        self.loss_time
    }

    pub fn reset(&mut self) {
        self.pto_count = 0;
        self.loss_time = 0.0;
    }
}

impl Default for LossDetector {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
