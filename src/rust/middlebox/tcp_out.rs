// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Outbound half of the interception pipeline for one direction. Packets that already traversed TcpIn and the upper
// elements come through process(): the segment's journaled length change is committed into the byte-stream
// maintainer, the sequence number is rewritten, the packet is shadowed for retransmission and its checksums are
// finalized. A sender-side retransmission of an already-edited segment is replaced by the shadowed copy of its
// first transmission, so every transmission of a segment carries identical bytes on the wire. TcpOut also forges
// the packets the middlebox originates itself (acknowledgments and closing packets), which are queued on a side
// channel toward the reverse wire and skip the retransmission bookkeeping.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    middlebox::{
        byte_stream::ByteStreamMaintainer,
        counters::Counters,
        fcb::{ClosingState, FlowControlBlock, FlowDirection, MiddleboxPools, TcpCommon},
        packet::{PacketView, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_RST},
        seq_number::SeqNumber,
    },
    runtime::{fail::Fail, network::config::MiddleboxConfig},
};
use ::libc::ENOTCONN;
use ::std::{
    cell::RefCell,
    collections::VecDeque,
    net::Ipv4Addr,
    rc::Rc,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Outbound-direction element.
pub struct TcpOut {
    /// Which of the two directions this element writes.
    direction: FlowDirection,

    /// Configuration.
    config: MiddleboxConfig,

    /// Object pools shared with the paired TcpIn.
    pools: Rc<RefCell<MiddleboxPools>>,

    /// Packets this element originated toward the reverse wire, ordered behind the packet that triggered them.
    pending: VecDeque<PacketView>,

    /// Event counters.
    counters: Counters,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TcpOut {
    /// Creates an outbound element for `direction`.
    pub fn new(direction: FlowDirection, config: MiddleboxConfig, pools: Rc<RefCell<MiddleboxPools>>) -> Self {
        Self {
            direction,
            config,
            pools,
            pending: VecDeque::new(),
            counters: Counters::default(),
        }
    }

    /// Which of the two directions this element writes.
    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    /// Rewrites a forwarded packet for emission.
    pub fn process(&mut self, fcb: &mut FlowControlBlock, mut pkt: PacketView, now: Instant) -> Result<PacketView, Fail> {
        let common: Rc<RefCell<TcpCommon>> = match fcb.tcp_common() {
            Some(common) => common.clone(),
            None => return Err(Fail::new(ENOTCONN, "packet emitted on an unbound flow")),
        };
        let mut common = common.borrow_mut();

        let orig_seq: SeqNumber = pkt.seq_num();
        let modified_payload_len: usize = pkt.payload_len();

        // Commit this segment's journaled length change, effective at the byte right after the segment in the
        // original stream. A retransmission finds its journal already committed: its delta must not be committed
        // twice, and the packet carries the sender's original bytes, not the edited ones the far endpoint was
        // promised, so the shadowed copy of the first transmission is re-emitted in its place.
        if let Some(list) = fcb.modification_list_mut(orig_seq) {
            if !list.is_committed() {
                let delta: i64 = list.aggregate_delta() as i64;
                let original_payload_len: i64 = modified_payload_len as i64 - delta;
                let commit_point: SeqNumber = orig_seq + SeqNumber::from(original_payload_len as u32);
                common.maintainer_mut(self.direction).insert_in_tree(commit_point, delta);
                list.mark_committed();
                trace!(
                    "direction {}: committed delta {} at {}",
                    self.direction.index(),
                    delta,
                    commit_point
                );
            } else {
                if let Some(replayed) = common.retransmission(self.direction).replay(orig_seq) {
                    debug!(
                        "direction {}: replaying edited segment {} for a retransmission",
                        self.direction.index(),
                        orig_seq
                    );
                    common.maintainer_mut(self.direction).record_retransmission(replayed.seq_num());
                    common.touch(now);
                    return Ok(replayed);
                }
                // No shadowed copy left; the segment was acknowledged and the journal is about to be retired.
                common.maintainer_mut(self.direction).record_retransmission(orig_seq);
            }
        }

        // Rewrite the sequence number into the emitted stream.
        let new_seq: SeqNumber = common.maintainer(self.direction).map_seq(orig_seq);
        if new_seq != orig_seq {
            trace!(
                "direction {}: sequence {} becomes {}",
                self.direction.index(),
                orig_seq,
                new_seq
            );
            pkt.set_seq_num(new_seq);
            pkt.mark_dirty();
        }

        // The acknowledgment this packet carries was already mapped by TcpIn; it is what the far endpoint will see.
        if pkt.is_ack() {
            let ack: SeqNumber = pkt.ack_num();
            common.maintainer_mut(self.direction).set_last_ack_sent(ack);
        }
        let window_size: u16 = pkt.window_size();
        common.maintainer_mut(self.direction).set_window_size(window_size);

        // A FIN consumes the sequence number right after the payload; remember it so the peer's acknowledgment of
        // it can finish the close.
        let mut modified_len: u32 = modified_payload_len as u32;
        if pkt.is_syn() || pkt.is_fin() {
            modified_len += 1;
        }
        if pkt.is_fin() {
            common.set_fin_seq_sent(self.direction, new_seq + SeqNumber::from(modified_payload_len as u32));
        }

        // Journals of fully acknowledged segments can no longer be replayed; retire them.
        let watermark: SeqNumber = common.maintainer(self.direction).base();
        fcb.retire_modifications(watermark, &mut self.pools.borrow_mut());

        self.finalize_checksums(&mut pkt);

        // Shadow everything that occupies sequence space; the far endpoint must acknowledge it eventually.
        if modified_len > 0 {
            common
                .retransmission_mut(self.direction)
                .on_segment_sent(orig_seq, new_seq, modified_len, pkt.clone(), now);
        }

        common.touch(now);
        Ok(pkt)
    }

    /// Forges a bare acknowledgment on behalf of the middlebox and queues it for the reverse wire.
    #[allow(clippy::too_many_arguments)]
    pub fn send_ack(
        &mut self,
        maintainer: &mut ByteStreamMaintainer,
        saddr: Ipv4Addr,
        daddr: Ipv4Addr,
        sport: u16,
        dport: u16,
        seq: SeqNumber,
        ack: SeqNumber,
    ) {
        let packet: PacketView =
            PacketView::forge(saddr, daddr, sport, dport, seq, ack, maintainer.window_size(), TCP_FLAG_ACK);
        maintainer.set_last_ack_sent(ack);
        trace!("forged ack seq={} ack={}", seq, ack);
        self.pending.push_back(packet);
    }

    /// Forges a closing packet (FIN for a graceful close, RST otherwise) and queues it for the reverse wire.
    /// Forged packets skip the retransmission bookkeeping; an unanswered RST is not retried.
    #[allow(clippy::too_many_arguments)]
    pub fn send_closing_packet(
        &mut self,
        maintainer: &mut ByteStreamMaintainer,
        saddr: Ipv4Addr,
        daddr: Ipv4Addr,
        sport: u16,
        dport: u16,
        seq: SeqNumber,
        ack: SeqNumber,
        graceful: bool,
    ) {
        let flags: u8 = if graceful {
            TCP_FLAG_ACK | TCP_FLAG_FIN
        } else {
            TCP_FLAG_ACK | TCP_FLAG_RST
        };
        let packet: PacketView =
            PacketView::forge(saddr, daddr, sport, dport, seq, ack, maintainer.window_size(), flags);
        maintainer.set_last_ack_sent(ack);
        trace!("forged closing packet seq={} ack={} graceful={}", seq, ack, graceful);
        self.pending.push_back(packet);
    }

    /// Checks the retransmission timer of this direction. When it has fired, returns the segment to re-emit on the
    /// forward wire; when the retransmit limit is exhausted, tears the flow down instead.
    pub fn check_retransmission(&mut self, fcb: &mut FlowControlBlock, now: Instant) -> Option<PacketView> {
        let common: Rc<RefCell<TcpCommon>> = fcb.tcp_common()?.clone();
        let mut common = common.borrow_mut();

        let retransmit: Option<PacketView> = common.retransmission_mut(self.direction).check_timeout(now);
        match retransmit {
            Some(pkt) => {
                warn!(
                    "direction {}: retransmitting segment {} on behalf of the sender",
                    self.direction.index(),
                    pkt.seq_num()
                );
                common.maintainer_mut(self.direction).record_retransmission(pkt.seq_num());
                Some(pkt)
            },
            None => {
                if common.retransmission(self.direction).is_dead() {
                    // The far endpoint stopped answering; the flow is unrecoverable.
                    if common.advance_closing(self.direction, ClosingState::ClosedUngraceful) {
                        self.counters.retransmission_timeouts += 1;
                    }
                    common.advance_closing(self.direction.opposite(), ClosingState::ClosedUngraceful);
                }
                None
            },
        }
    }

    /// Drains the packets this element originated toward the reverse wire.
    pub fn take_pending(&mut self) -> Vec<PacketView> {
        self.pending.drain(..).collect()
    }

    /// Event counters.
    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Recomputes or offloads checksums for a rewritten packet. The capability question is asked per buffer: only
    /// offload-capable buffers may leave with empty checksum fields.
    fn finalize_checksums(&self, pkt: &mut PacketView) {
        if !pkt.is_dirty() {
            return;
        }
        if self.config.get_tx_checksum_offload() && pkt.offload_capable() {
            pkt.prepare_checksum_offload();
        } else {
            pkt.compute_checksums();
        }
    }
}
