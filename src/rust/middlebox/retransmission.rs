// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Retransmission bookkeeping for one direction. Once the middlebox has acknowledged data on behalf of the receiver
// (or has rewritten it), the sender considers that data delivered, so the middlebox itself must make sure the
// rewritten copy reaches the far endpoint: every emitted segment is shadowed here until the receiver acknowledges
// it, and the head of the shadow queue is re-emitted when the retransmission timer fires.
//
// The timeout estimator follows RFC 6298.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::middlebox::{packet::PacketView, seq_number::SeqNumber};
use ::std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// RFC 6298's suggested value for the lower bound on the retransmission timeout is 1 second; like most
/// implementations we use a fraction of that.
const RTO_LOWER_BOUND_SEC: f64 = 0.100;

/// Default upper bound on the retransmission timeout (RFC 6298 suggests >= 60 seconds).
const RTO_UPPER_BOUND_SEC: f64 = 60.0;

/// Default number of unanswered retransmissions before the flow is declared dead.
const DEFAULT_RETRANSMIT_LIMIT: usize = 5;

//======================================================================================================================
// Structures
//======================================================================================================================

/// TCP Retransmission Timeout (RTO) Calculator.
#[derive(Debug)]
pub struct RtoCalculator {
    /// Smoothed round-trip time.
    srtt: f64,

    /// Round-trip time variation.
    rttvar: f64,

    /// Retransmission timeout.
    rto: f64,

    /// Upper bound on the retransmission timeout.
    upper_bound: f64,

    /// Whether a RTT sample has been received yet.
    received_sample: bool,
}

/// One emitted segment awaiting acknowledgment by the far endpoint.
#[derive(Debug)]
pub struct ShadowSegment {
    /// Sequence number of the segment in the sender's original stream.
    pub orig_seq: SeqNumber,

    /// Sequence number the segment was emitted with.
    pub modified_seq: SeqNumber,

    /// Payload length the segment was emitted with. FIN and SYN count for one.
    pub modified_len: u32,

    /// When the segment was first emitted. Cleared on retransmission so the sample cannot be attributed to the
    /// wrong transmission (Karn's algorithm).
    sent_at: Option<Instant>,

    /// The emitted packet, kept for re-emission.
    packet: PacketView,
}

/// Retransmission Timing
#[derive(Debug)]
pub struct RetransmissionTiming {
    /// Timeout estimator.
    rto: RtoCalculator,

    /// Shadow queue of emitted, unacknowledged segments, ordered by modified sequence number.
    queue: VecDeque<ShadowSegment>,

    /// When the head of the shadow queue must be re-emitted. Unarmed when the queue is empty.
    deadline: Option<Instant>,

    /// Consecutive expirations without forward progress.
    expirations: usize,

    /// Number of unanswered retransmissions before the flow is declared dead.
    retransmit_limit: usize,

    /// Set when the retransmit limit was exhausted.
    dead: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RtoCalculator {
    /// Initializes an RTO calculator. RFC 6298 recommends an initial timeout of 1 second; the smoothed values are
    /// not used until the first sample arrives.
    pub fn new(upper_bound: Duration) -> Self {
        Self {
            srtt: 1.0,
            rttvar: 0.0,
            rto: 1.0,
            upper_bound: upper_bound.as_secs_f64(),
            received_sample: false,
        }
    }

    /// Adds an RTT sample to the calculator.
    pub fn add_sample(&mut self, rtt: Duration) {
        // RFC 6298's suggested smoothing factors.
        const ALPHA: f64 = 0.125;
        const BETA: f64 = 0.25;
        // Clock granularity in seconds.
        const GRANULARITY: f64 = 0.001;

        let rtt: f64 = rtt.as_secs_f64();

        if !self.received_sample {
            // Initial sample formula from RFC 6298 Section 2.2.
            self.srtt = rtt;
            self.rttvar = rtt / 2.;
            self.received_sample = true;
        } else {
            // Subsequent sample formula from RFC 6298 Section 2.3.
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (self.srtt - rtt).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
        }

        let rto: f64 = self.srtt + GRANULARITY.max(4.0 * self.rttvar);
        self.update_rto(rto);
    }

    /// Updates the stored RTO value while keeping it within bounds (RFC 6298 Section 2.4).
    fn update_rto(&mut self, new_rto: f64) {
        self.rto = new_rto.clamp(RTO_LOWER_BOUND_SEC, self.upper_bound.min(RTO_UPPER_BOUND_SEC));
    }

    /// Performs an exponential back off of the RTO (doubles the current timeout).
    pub fn back_off(&mut self) {
        self.update_rto(self.rto * 2.0);
    }

    /// Gets the current RTO value.
    pub fn rto(&self) -> Duration {
        Duration::from_secs_f64(self.rto)
    }
}

impl RetransmissionTiming {
    /// Re-arms the record for a new flow.
    pub fn initialize(&mut self, max_rto: Duration, retransmit_limit: usize) {
        self.rto = RtoCalculator::new(max_rto);
        self.queue.clear();
        self.deadline = None;
        self.expirations = 0;
        self.retransmit_limit = retransmit_limit;
        self.dead = false;
    }

    /// Shadows an emitted segment and arms the retransmission timer if it is not already running.
    pub fn on_segment_sent(
        &mut self,
        orig_seq: SeqNumber,
        modified_seq: SeqNumber,
        modified_len: u32,
        packet: PacketView,
        now: Instant,
    ) {
        if let Some(back) = self.queue.back() {
            debug_assert!(back.modified_seq <= modified_seq);
        }
        self.queue.push_back(ShadowSegment {
            orig_seq,
            modified_seq,
            modified_len,
            sent_at: Some(now),
            packet,
        });
        if self.deadline.is_none() {
            self.deadline = Some(now + self.rto.rto());
        }
    }

    /// Consumes an acknowledgment from the far endpoint: drops every shadowed segment it fully covers, feeds RTT
    /// samples to the estimator, and re-arms or disarms the timer.
    pub fn signal_ack(&mut self, ack: SeqNumber, now: Instant) {
        let mut progress: bool = false;

        while let Some(head) = self.queue.front() {
            if head.modified_seq + SeqNumber::from(head.modified_len) > ack {
                break;
            }
            let head: ShadowSegment = self.queue.pop_front().expect("just peeked at the head");
            if let Some(sent_at) = head.sent_at {
                self.rto.add_sample(now - sent_at);
            }
            progress = true;
        }

        if progress {
            self.expirations = 0;
            self.deadline = match self.queue.front() {
                Some(_) => Some(now + self.rto.rto()),
                None => None,
            };
        }
    }

    /// Checks the retransmission timer. When it has expired, returns a copy of the head segment's packet for
    /// re-emission, backing the timeout off; when the retransmit limit is exhausted, marks the flow dead instead.
    pub fn check_timeout(&mut self, now: Instant) -> Option<PacketView> {
        let deadline: Instant = self.deadline?;
        if now < deadline {
            return None;
        }

        if self.expirations >= self.retransmit_limit {
            self.dead = true;
            self.deadline = None;
            return None;
        }
        self.expirations += 1;

        self.rto.back_off();
        self.deadline = Some(now + self.rto.rto());

        let head: &mut ShadowSegment = self.queue.front_mut()?;
        // The next acknowledgment of this segment can no longer be used as an RTT sample.
        head.sent_at = None;
        Some(head.packet.clone())
    }

    /// Looks up the shadowed copy of the segment that was first emitted for original sequence number `orig_seq`.
    /// When the sender retransmits a segment whose emitted form was edited, that copy is what goes back on the
    /// wire, so the far endpoint sees the same bytes on every transmission.
    pub fn replay(&self, orig_seq: SeqNumber) -> Option<PacketView> {
        self.queue
            .iter()
            .find(|segment| segment.orig_seq == orig_seq)
            .map(|segment| segment.packet.clone())
    }

    /// Whether the retransmit limit was exhausted.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Whether any emitted segment is still unacknowledged.
    pub fn in_flight(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Number of shadowed segments.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// When the head of the shadow queue must be re-emitted.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The current timeout estimate.
    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    /// The shadowed segments, oldest first.
    pub fn segments(&self) -> impl Iterator<Item = &ShadowSegment> {
        self.queue.iter()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for RetransmissionTiming {
    fn default() -> Self {
        Self {
            rto: RtoCalculator::new(Duration::from_secs_f64(RTO_UPPER_BOUND_SEC)),
            queue: VecDeque::new(),
            deadline: None,
            expirations: 0,
            retransmit_limit: DEFAULT_RETRANSMIT_LIMIT,
            dead: false,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
