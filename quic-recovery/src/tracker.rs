//! # Sent Packet Tracking (RFC 9002 Section 2, Appendix A.1)
//!
//! Records every in-flight sent packet, folds peer ACK ranges into it, and
//! marks losses. Status transitions are exactly-once and monotonic:
//! in-flight -> acknowledged and in-flight -> lost are both terminal.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::error::{RecoveryError, Result};
use crate::types::{AckRange, PacketNumber, Payload, TimeMillis, MAX_PACKET_NUMBER};

/// Lifecycle status of a sent packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Sent, neither acknowledged nor declared lost.
    InFlight,
    /// Acknowledged by the peer (terminal).
    Acked,
    /// Declared lost (terminal).
    Lost,
}

/// A sent packet record.
#[derive(Debug, Clone)]
pub struct SentPacket<P> {
    /// Packet number (immutable).
    pub packet_number: PacketNumber,

    /// Opaque payload handle; the core never inspects contents.
    pub payload: P,

    /// Payload size in bytes, captured at send time.
    pub size: usize,

    /// Caller-supplied send timestamp.
    pub sent_time: TimeMillis,

    /// Whether receipt should provoke a peer ACK (RFC 9002 Section 2).
    pub ack_eliciting: bool,

    /// Current lifecycle status.
    pub state: PacketState,
}

/// Outcome of folding an ACK frame into the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Packet numbers newly transitioned to acknowledged, ascending per range.
    pub newly_acked: Vec<PacketNumber>,
    /// Whether any newly acknowledged packet was ack-eliciting.
    pub ack_eliciting_acked: bool,
}

/// Tracks sent packets for loss detection and RTT sampling.
///
/// Packet numbers are dense and monotonic, so an ordered map gives cheap
/// range folds and ascending loss scans.
#[derive(Debug, Clone)]
pub struct SentPacketTracker<P> {
    /// Primary store, keyed by packet number.
    sent: BTreeMap<PacketNumber, SentPacket<P>>,

    /// Acknowledged numbers; survives `cleanup_acked_packets` so `is_acked`
    /// keeps answering after the sweep.
    acked: BTreeSet<PacketNumber>,

    /// Numbers declared lost.
    lost: BTreeSet<PacketNumber>,

    largest_sent: Option<PacketNumber>,
    largest_acked: Option<PacketNumber>,

    /// Exact count of in-flight ack-eliciting records.
    outstanding_ack_eliciting: usize,

    /// Send time of the most recent ack-eliciting packet (0 = none yet).
    time_of_last_sent_ack_eliciting: TimeMillis,
}

impl<P: Payload> SentPacketTracker<P> {
    pub fn new() -> Self {
        Self {
            sent: BTreeMap::new(),
            acked: BTreeSet::new(),
            lost: BTreeSet::new(),
            largest_sent: None,
            largest_acked: None,
            outstanding_ack_eliciting: 0,
            time_of_last_sent_ack_eliciting: 0.0,
        }
    }

    /// Record a sent packet.
    ///
    /// A resend at an already-used number overwrites the prior record and
    /// releases whatever the old record contributed to the counters.
    pub fn on_packet_sent(
        &mut self,
        packet_number: PacketNumber,
        payload: P,
        sent_time: TimeMillis,
        ack_eliciting: bool,
    ) -> Result<()> {
        if packet_number > MAX_PACKET_NUMBER {
            return Err(RecoveryError::InvalidPacketNumber(packet_number));
        }

        let size = payload.size_in_bytes();
        let record = SentPacket {
            packet_number,
            payload,
            size,
            sent_time,
            ack_eliciting,
            state: PacketState::InFlight,
        };

        if let Some(prev) = self.sent.insert(packet_number, record) {
            if prev.state == PacketState::InFlight && prev.ack_eliciting {
                self.outstanding_ack_eliciting -= 1;
            }
            self.acked.remove(&packet_number);
            self.lost.remove(&packet_number);
        }

        self.largest_sent = Some(self.largest_sent.map_or(packet_number, |l| l.max(packet_number)));
        if ack_eliciting {
            self.outstanding_ack_eliciting += 1;
            self.time_of_last_sent_ack_eliciting = sent_time;
        }

        trace!(packet_number, sent_time, ack_eliciting, size, "packet sent");
        Ok(())
    }

    /// Fold inclusive ACK ranges into the tracker.
    ///
    /// Duplicate and reordered ACKs are silently correct: re-acknowledged
    /// numbers yield no entries in `newly_acked`, lower-numbered ranges never
    /// reduce `largest_acked`, and a packet already declared lost stays lost.
    pub fn on_ack_received(&mut self, ranges: &[AckRange], ack_time: TimeMillis) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let mut max_acked: Option<PacketNumber> = None;

        for range in ranges {
            if range.start > range.end {
                continue;
            }
            let end = range.end.min(MAX_PACKET_NUMBER);
            let in_range: Vec<PacketNumber> = self
                .sent
                .range(range.start..=end)
                .filter(|(_, r)| r.state == PacketState::InFlight)
                .map(|(&n, _)| n)
                .collect();

            for n in in_range {
                if let Some(record) = self.sent.get_mut(&n) {
                    record.state = PacketState::Acked;
                    self.acked.insert(n);
                    outcome.newly_acked.push(n);
                    if record.ack_eliciting {
                        self.outstanding_ack_eliciting -= 1;
                        outcome.ack_eliciting_acked = true;
                    }
                    max_acked = Some(max_acked.map_or(n, |m| m.max(n)));
                }
            }
        }

        if let Some(m) = max_acked {
            self.largest_acked = Some(self.largest_acked.map_or(m, |l| l.max(m)));
        }

        trace!(
            newly_acked = outcome.newly_acked.len(),
            ack_time,
            largest_acked = ?self.largest_acked,
            "ack ranges folded"
        );
        outcome
    }

    /// Mark a packet lost.
    ///
    /// A no-op when the number is unknown, already acknowledged, or already
    /// lost; the outstanding counter is decremented exactly once.
    pub fn on_packet_lost(&mut self, packet_number: PacketNumber) {
        let Some(record) = self.sent.get_mut(&packet_number) else {
            return;
        };
        if record.state != PacketState::InFlight {
            return;
        }
        record.state = PacketState::Lost;
        self.lost.insert(packet_number);
        if record.ack_eliciting {
            self.outstanding_ack_eliciting -= 1;
        }
        debug!(packet_number, "packet declared lost");
    }

    /// Declare in-flight packets below `largest_acked` lost by packet or
    /// time threshold (RFC 9002 Section 6.1), lowest numbers first.
    pub fn detect_lost_packets(
        &mut self,
        packet_threshold: u64,
        loss_delay: TimeMillis,
        now: TimeMillis,
    ) -> Vec<PacketNumber> {
        let Some(largest_acked) = self.largest_acked else {
            return Vec::new();
        };

        let lost: Vec<PacketNumber> = self
            .sent
            .range(..=largest_acked)
            .filter(|(_, r)| r.state == PacketState::InFlight)
            .filter(|(&n, r)| {
                largest_acked - n >= packet_threshold || now - r.sent_time >= loss_delay
            })
            .map(|(&n, _)| n)
            .collect();

        for &n in &lost {
            self.on_packet_lost(n);
        }
        lost
    }

    /// Earliest send time among in-flight packets at or below
    /// `largest_acked` — the candidates for a future time-threshold loss.
    pub fn earliest_loss_candidate_sent_time(&self) -> Option<TimeMillis> {
        let largest_acked = self.largest_acked?;
        self.sent
            .range(..=largest_acked)
            .filter(|(_, r)| r.state == PacketState::InFlight)
            .map(|(_, r)| r.sent_time)
            .fold(None, |acc, t| Some(acc.map_or(t, |a: TimeMillis| a.min(t))))
    }

    /// Up to `limit` oldest in-flight ack-eliciting packet numbers, by send
    /// time ascending (ties broken by packet number). Used for PTO probes.
    pub fn oldest_ack_eliciting_in_flight(&self, limit: usize) -> Vec<PacketNumber> {
        let mut candidates: Vec<(TimeMillis, PacketNumber)> = self
            .sent
            .values()
            .filter(|r| r.state == PacketState::InFlight && r.ack_eliciting)
            .map(|r| (r.sent_time, r.packet_number))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates.truncate(limit);
        candidates.into_iter().map(|(_, n)| n).collect()
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn largest_sent(&self) -> Option<PacketNumber> {
        self.largest_sent
    }

    pub fn largest_acked(&self) -> Option<PacketNumber> {
        self.largest_acked
    }

    /// Exact count of in-flight ack-eliciting packets.
    pub fn outstanding_ack_eliciting(&self) -> usize {
        self.outstanding_ack_eliciting
    }

    /// Send time of the most recent ack-eliciting packet (0 = none yet).
    pub fn time_of_last_sent_ack_eliciting(&self) -> TimeMillis {
        self.time_of_last_sent_ack_eliciting
    }

    pub fn is_acked(&self, packet_number: PacketNumber) -> bool {
        self.acked.contains(&packet_number)
    }

    pub fn is_lost(&self, packet_number: PacketNumber) -> bool {
        self.lost.contains(&packet_number)
    }

    /// Whether any sent record has not been acknowledged (lost counts as
    /// unacknowledged).
    pub fn has_unacked(&self) -> bool {
        self.sent.values().any(|r| r.state != PacketState::Acked)
    }

    /// Send time of a tracked packet.
    pub fn sent_time(&self, packet_number: PacketNumber) -> Option<TimeMillis> {
        self.sent.get(&packet_number).map(|r| r.sent_time)
    }

    /// Look up a tracked record.
    pub fn sent_packet(&self, packet_number: PacketNumber) -> Option<&SentPacket<P>> {
        self.sent.get(&packet_number)
    }

    /// All tracked records, ascending by packet number.
    pub fn get_sent_packets(&self) -> Vec<&SentPacket<P>> {
        self.sent.values().collect()
    }

    /// In-flight records only, ascending by packet number.
    pub fn get_unacked_packets(&self) -> Vec<&SentPacket<P>> {
        self.sent
            .values()
            .filter(|r| r.state == PacketState::InFlight)
            .collect()
    }

    /// Lost records only, ascending by packet number.
    pub fn get_packets_for_retransmission(&self) -> Vec<&SentPacket<P>> {
        self.sent
            .values()
            .filter(|r| r.state == PacketState::Lost)
            .collect()
    }

    /// Total bytes across in-flight records.
    pub fn bytes_in_flight(&self) -> usize {
        self.sent
            .values()
            .filter(|r| r.state == PacketState::InFlight)
            .map(|r| r.size)
            .sum()
    }

    /// Number of records in the primary store.
    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    /// Number of packets ever acknowledged.
    pub fn acked_count(&self) -> usize {
        self.acked.len()
    }

    /// Number of packets ever declared lost.
    pub fn lost_count(&self) -> usize {
        self.lost.len()
    }

    /// Remove acknowledged records from the primary store. The acknowledged
    /// set is kept so `is_acked` still answers.
    pub fn cleanup_acked_packets(&mut self) {
        self.sent.retain(|_, r| r.state != PacketState::Acked);
    }
}

impl<P: Payload> Default for SentPacketTracker<P> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
