//! # quic-recovery: QUIC Loss Detection and Recovery Core (RFC 9002)
//!
//! The loss-detection and recovery core of a QUIC endpoint: RTT estimation,
//! sent-packet tracking, loss/PTO detection, local ACK accounting, and the
//! retransmission policy that sits on top of them.
//!
//! ## Design Principles
//!
//! 1. **Pure State Machine**: No I/O, sockets, or event loops. The core
//!    consumes packet events and produces retransmission/ACK decisions.
//!
//! 2. **Caller-Owned Clock**: Every entry point takes a monotonic `now` in
//!    milliseconds; the core never reads wall-clock time. State transitions
//!    are fully deterministic under replay, and tests drive virtual time.
//!
//! 3. **Share-Nothing**: One [`Recovery`] instance per connection, driven
//!    from a single event loop. Nothing is shared across connections.
//!
//! 4. **Opaque Payloads**: Packets are carried by a [`Payload`] handle
//!    exposing only a byte size; contents are never inspected.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Caller's Event Loop              │
//! └────────────────┬────────────────────────┘
//!                  │ sends, receipts, ACKs, timer firings (+ now)
//!                  ▼
//! ┌─────────────────────────────────────────┐
//! │            Recovery Facade               │ (Orchestrates)
//! ├─────────────────────────────────────────┤
//! │ • Sequences the components per event     │
//! │ • Maintains the next timer deadline      │
//! │ • Exposes statistics and health advice   │
//! └──┬─────────┬──────────┬─────────┬───────┘
//!    ▼         ▼          ▼         ▼
//! ┌──────┐ ┌────────┐ ┌───────┐ ┌────────────┐
//! │ RTT  │ │ Packet │ │ Loss  │ │ ACK        │
//! │ Est. │ │Tracker │ │ Det.  │ │ Manager    │
//! └──────┘ └────────┘ └───────┘ └────────────┘
//!        ▲ borrowed per call by ▲
//!        └── Retransmission Manager
//! ```
//!
//! ## Module Guide
//!
//! - [`rtt`] - Smoothed RTT / variance estimation and PTO calculation
//!   (RFC 9002 Sections 5-6.2)
//! - [`tracker`] - Sent-packet records with exactly-once
//!   {in-flight -> acked | lost} transitions (RFC 9002 Appendix A.1)
//! - [`loss`] - Packet/time-threshold loss declaration and PTO escalation
//!   (RFC 9002 Section 6)
//! - [`ack`] - Received-packet accounting and ACK-frame construction
//!   (RFC 9000 Section 13.2)
//! - [`retransmit`] - Capped, backed-off retransmission scheduling
//! - [`recovery`] - The [`Recovery`] facade tying it all together
//!
//! ## Usage Example
//!
//! ```rust
//! use bytes::Bytes;
//! use quic_recovery::{AckFrame, AckRange, Recovery};
//!
//! let mut recovery: Recovery<Bytes> = Recovery::new();
//!
//! // Outbound packet at t = 1000ms
//! recovery.on_packet_sent(0, Bytes::from_static(b"hello"), 1000.0, true)?;
//!
//! // Peer acknowledges it 120ms later
//! let frame = AckFrame {
//!     largest_acked: 0,
//!     ack_delay: 0,
//!     ack_ranges: vec![AckRange::new(0, 0)],
//! };
//! let events = recovery.on_ack_received(&frame, 1120.0)?;
//! assert_eq!(events.newly_acked, vec![0]);
//!
//! // Arm a platform timer for the next deadline (0 = disarmed)
//! let _deadline = recovery.next_timeout();
//! # Ok::<(), quic_recovery::RecoveryError>(())
//! ```

#![forbid(unsafe_code)]

/// Received-packet accounting and ACK generation (RFC 9000 Section 13.2)
pub mod ack;

/// Recovery tuning knobs with RFC 9002 defaults
pub mod config;

/// Error types for recovery operations
pub mod error;

/// Loss declaration and PTO scheduling (RFC 9002 Section 6)
pub mod loss;

/// The recovery facade: single entry point per connection
pub mod recovery;

/// Retransmission attempts, caps, and backoff
pub mod retransmit;

/// RTT estimation (RFC 9002 Section 5)
pub mod rtt;

/// Sent-packet tracking (RFC 9002 Appendix A.1)
pub mod tracker;

/// Core types: packet numbers, time, payloads, ACK frames
pub mod types;

// ============================================================================
// Re-export Core Types for Convenience
// ============================================================================

pub use ack::AckManager;
pub use config::RecoveryConfig;
pub use error::{RecoveryError, Result};
pub use loss::{LossDetectionResult, LossDetector, LossTimeoutAction};
pub use recovery::{
    AckStats, CongestionAdvice, LossStats, Recovery, RecoveryAction, RecoveryStats,
    RetransmitStats, TrackerStats,
};
pub use retransmit::{
    AckEvents, ProbeRecord, PtoOutcome, RetransmissionManager, RetransmissionRecord,
};
pub use rtt::{RttEstimator, RttStats};
pub use tracker::{AckOutcome, PacketState, SentPacket, SentPacketTracker};
pub use types::{AckFrame, AckRange, PacketNumber, Payload, TimeMillis};
