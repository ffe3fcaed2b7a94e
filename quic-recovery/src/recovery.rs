//! # Recovery Facade (RFC 9002)
//!
//! Pure state machine: accepts packet events and time, produces
//! retransmission and acknowledgment actions. No I/O, no timers, no
//! clock - the caller drives every entry point with a monotonic `now` and
//! arms a platform timer from [`Recovery::next_timeout`].

#![forbid(unsafe_code)]

use core::fmt;

use serde::Serialize;
use tracing::debug;

use crate::ack::AckManager;
use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::loss::LossDetector;
use crate::retransmit::{
    AckEvents, ProbeRecord, PtoOutcome, RetransmissionManager, RetransmissionRecord,
};
use crate::rtt::{RttEstimator, RttStats};
use crate::tracker::SentPacketTracker;
use crate::types::{AckFrame, PacketNumber, Payload, TimeMillis};

/// Fraction of sent packets retransmitted above which the advice degrades
/// to a high loss rate.
const HIGH_LOSS_RATE_THRESHOLD: f64 = 0.1;

/// An action the caller must carry out after a timer fired.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction<P> {
    /// Retransmit these lost packets.
    RetransmitLost { packets: Vec<PacketNumber> },
    /// Send these probe packets to test the path.
    PtoProbe { probes: Vec<ProbeRecord<P>> },
    /// Send this ACK frame to the peer.
    SendAck { frame: AckFrame },
}

/// Coarse path-health advice for the congestion layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionAdvice {
    Normal,
    HighLossRate,
    RetransmissionStorm,
    PersistentCongestion,
}

impl fmt::Display for CongestionAdvice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CongestionAdvice::Normal => "normal",
            CongestionAdvice::HighLossRate => "high_loss_rate",
            CongestionAdvice::RetransmissionStorm => "retransmission_storm",
            CongestionAdvice::PersistentCongestion => "persistent_congestion",
        };
        f.write_str(s)
    }
}

/// Sent-packet tracking statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub largest_sent: Option<PacketNumber>,
    pub largest_acked: Option<PacketNumber>,
    pub outstanding_ack_eliciting: usize,
    pub sent_records: usize,
    pub acked_packets: usize,
    pub lost_packets: usize,
    pub bytes_in_flight: usize,
}

/// Loss-detection statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LossStats {
    pub pto_count: u32,
    pub loss_time: TimeMillis,
    pub persistent_congestion: bool,
}

/// ACK-accounting statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AckStats {
    pub largest_received: Option<PacketNumber>,
    pub pending_acks: usize,
    pub ack_eliciting_received: u32,
    pub received_records: usize,
}

/// Retransmission statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetransmitStats {
    pub total_retransmissions: u64,
    pub tracked_packets: usize,
    pub retransmission_rate: f64,
    pub in_storm: bool,
}

/// Point-in-time snapshot across every recovery component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub rtt: RttStats,
    pub packet_tracker: TrackerStats,
    pub loss_detection: LossStats,
    pub ack_manager: AckStats,
    pub retransmission: RetransmitStats,
    /// Armed timer deadline (0 = disarmed).
    pub next_timeout: TimeMillis,
}

/// The recovery core of one connection: RTT estimation, sent-packet
/// tracking, loss/PTO detection, local ACK accounting, and retransmission
/// policy behind a single entry point.
///
/// Share-nothing: one instance per connection, driven from one event loop.
#[derive(Debug, Clone)]
pub struct Recovery<P> {
    config: RecoveryConfig,
    rtt: RttEstimator,
    tracker: SentPacketTracker<P>,
    loss: LossDetector,
    ack_manager: AckManager,
    retransmit: RetransmissionManager,

    /// Deadline the caller should arm a timer for (0 = disarmed).
    next_timeout: TimeMillis,

    /// Time of the last send or ACK reception; anchors `next_timeout`.
    last_event_time: TimeMillis,
}

impl<P: Payload + Clone> Recovery<P> {
    /// Create a recovery core with RFC 9002 default tuning (333 ms initial
    /// RTT).
    pub fn new() -> Self {
        Self::with_config(RecoveryConfig::default())
    }

    /// Create a recovery core with a custom initial RTT in ms.
    pub fn with_initial_rtt(initial_rtt: TimeMillis) -> Self {
        Self::with_config(RecoveryConfig {
            initial_rtt,
            ..RecoveryConfig::default()
        })
    }

    /// Create a recovery core from a full configuration. Callers should run
    /// [`RecoveryConfig::validate`] first.
    pub fn with_config(config: RecoveryConfig) -> Self {
        Self {
            rtt: RttEstimator::from_config(&config),
            tracker: SentPacketTracker::new(),
            loss: LossDetector::from_config(&config),
            ack_manager: AckManager::from_config(&config),
            retransmit: RetransmissionManager::from_config(&config),
            next_timeout: 0.0,
            last_event_time: 0.0,
            config,
        }
    }

    /// Record an outbound packet and re-arm the recovery timer.
    pub fn on_packet_sent(
        &mut self,
        packet_number: PacketNumber,
        payload: P,
        sent_time: TimeMillis,
        ack_eliciting: bool,
    ) -> Result<()> {
        self.tracker
            .on_packet_sent(packet_number, payload, sent_time, ack_eliciting)?;
        self.last_event_time = sent_time;
        self.rearm()
    }

    /// Record an inbound data packet for ACK accounting.
    pub fn on_packet_received(
        &mut self,
        packet_number: PacketNumber,
        recv_time: TimeMillis,
        ack_eliciting: bool,
    ) -> Result<()> {
        self.ack_manager
            .on_packet_received(packet_number, recv_time, ack_eliciting)
    }

    /// Process a peer ACK frame: fold, sample RTT, detect losses, and
    /// re-arm the recovery timer. The returned events are what a congestion
    /// controller would consume.
    pub fn on_ack_received(&mut self, frame: &AckFrame, ack_time: TimeMillis) -> Result<AckEvents> {
        let events = self.retransmit.on_ack_received(
            frame,
            ack_time,
            &mut self.tracker,
            &mut self.rtt,
            &mut self.loss,
        )?;
        self.last_event_time = ack_time;
        self.rearm()?;
        Ok(events)
    }

    /// Handle a fired timer.
    ///
    /// Runs the recovery timer first (loss pass or PTO probes), then the
    /// delayed-ACK deadline. Actions come back in that order.
    pub fn on_timeout(&mut self, now: TimeMillis) -> Result<Vec<RecoveryAction<P>>> {
        let mut actions = Vec::new();

        if self.next_timeout > 0.0 && now >= self.next_timeout {
            match self
                .retransmit
                .on_pto_timeout(now, &mut self.tracker, &self.rtt, &mut self.loss)
            {
                PtoOutcome::LossDetected(packets) => {
                    actions.push(RecoveryAction::RetransmitLost { packets });
                }
                PtoOutcome::Probes(probes) => {
                    actions.push(RecoveryAction::PtoProbe { probes });
                }
            }
            self.last_event_time = now;
            self.rearm()?;
        }

        if self.ack_manager.ack_pending()
            && self.ack_manager.ack_timeout() > 0.0
            && now >= self.ack_manager.ack_timeout()
        {
            if let Some(frame) = self.ack_manager.generate_ack_frame(now) {
                actions.push(RecoveryAction::SendAck { frame });
            }
        }

        if !actions.is_empty() {
            debug!(now, actions = actions.len(), "timeout actions dispatched");
        }
        Ok(actions)
    }

    /// Whether an ACK should go out right now rather than waiting for the
    /// delayed-ACK deadline.
    pub fn should_send_ack_immediately(&self, now: TimeMillis) -> bool {
        self.ack_manager.should_send_ack_immediately(now)
    }

    /// Build an ACK frame covering everything pending, or `None`.
    pub fn generate_ack_frame(&mut self, now: TimeMillis) -> Option<AckFrame> {
        self.ack_manager.generate_ack_frame(now)
    }

    /// External confirmation that an ACK covering `ranges` went out.
    pub fn on_ack_sent(&mut self, ranges: &[crate::types::AckRange]) {
        self.ack_manager.on_ack_sent(ranges);
    }

    /// Lost packets still eligible for retransmission.
    pub fn get_packets_for_retransmission(&self) -> Vec<RetransmissionRecord<P>> {
        self.retransmit.get_packets_for_retransmission(&self.tracker)
    }

    /// Armed timer deadline (0 = disarmed). The caller arms a platform
    /// timer for this instant and calls [`Recovery::on_timeout`] when it
    /// fires.
    pub fn next_timeout(&self) -> TimeMillis {
        self.next_timeout
    }

    /// Sweep stores: acknowledged sent-records, received-records and
    /// retransmission stamps older than the retention window.
    pub fn cleanup(&mut self, now: TimeMillis) {
        self.tracker.cleanup_acked_packets();
        let cutoff = now - self.config.cleanup_retention;
        self.ack_manager.cleanup_old_records(cutoff);
        self.retransmit.purge_old(cutoff);
        debug!(now, cutoff, "cleanup sweep");
    }

    /// Return every component to its construction state.
    pub fn reset(&mut self) {
        *self = Self::with_config(self.config.clone());
    }

    /// Snapshot statistics across every component.
    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            rtt: self.rtt.stats(),
            packet_tracker: TrackerStats {
                largest_sent: self.tracker.largest_sent(),
                largest_acked: self.tracker.largest_acked(),
                outstanding_ack_eliciting: self.tracker.outstanding_ack_eliciting(),
                sent_records: self.tracker.sent_count(),
                acked_packets: self.tracker.acked_count(),
                lost_packets: self.tracker.lost_count(),
                bytes_in_flight: self.tracker.bytes_in_flight(),
            },
            loss_detection: LossStats {
                pto_count: self.loss.pto_count(),
                loss_time: self.loss.loss_time(),
                persistent_congestion: self.loss.is_in_persistent_congestion(),
            },
            ack_manager: AckStats {
                largest_received: self.ack_manager.largest_received(),
                pending_acks: self.ack_manager.pending_count(),
                ack_eliciting_received: self.ack_manager.ack_eliciting_received(),
                received_records: self.ack_manager.received_count(),
            },
            retransmission: RetransmitStats {
                total_retransmissions: self.retransmit.total_retransmissions(),
                tracked_packets: self.retransmit.tracked_packets(),
                retransmission_rate: self.retransmit.retransmission_rate(&self.tracker),
                in_storm: self.retransmit.is_in_retransmission_storm(&self.tracker),
            },
            next_timeout: self.next_timeout,
        }
    }

    /// Coarse path-health advice, worst condition first.
    pub fn congestion_advice(&self) -> CongestionAdvice {
        if self.loss.is_in_persistent_congestion() {
            CongestionAdvice::PersistentCongestion
        } else if self.retransmit.is_in_retransmission_storm(&self.tracker) {
            CongestionAdvice::RetransmissionStorm
        } else if self.retransmit.retransmission_rate(&self.tracker) > HIGH_LOSS_RATE_THRESHOLD {
            CongestionAdvice::HighLossRate
        } else {
            CongestionAdvice::Normal
        }
    }

    /// Healthy means neither persistent congestion nor a retransmission
    /// storm; an elevated loss rate alone degrades advice but not health.
    pub fn is_connection_healthy(&self) -> bool {
        !self.loss.is_in_persistent_congestion()
            && !self.retransmit.is_in_retransmission_storm(&self.tracker)
    }

    // ========================================================================
    // Component views
    // ========================================================================

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn tracker(&self) -> &SentPacketTracker<P> {
        &self.tracker
    }

    pub fn loss_detector(&self) -> &LossDetector {
        &self.loss
    }

    pub fn ack_manager(&self) -> &AckManager {
        &self.ack_manager
    }

    pub fn retransmission_manager(&self) -> &RetransmissionManager {
        &self.retransmit
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Recompute the recovery timer from the last send/ACK event.
    fn rearm(&mut self) -> Result<()> {
        self.next_timeout =
            self.loss
                .calculate_loss_detection_timeout(&self.tracker, &self.rtt, self.last_event_time)?;
        Ok(())
    }
}

impl<P: Payload + Clone> Default for Recovery<P> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests (end-to-end scenarios over the facade)
// ============================================================================
