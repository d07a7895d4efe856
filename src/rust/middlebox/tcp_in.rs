// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Inbound half of the interception pipeline for one direction. process() binds the packet's flow to its shared
// connection record (allocating it on the initiator's SYN, finding it on the SYN+ACK), discards what the closing
// state machine says may no longer pass, recovers from acknowledgments lost between the middlebox and the receiver,
// and maps the acknowledgment number out of the rewritten stream before handing the packet to the upper elements.
//
// TcpIn is also the terminal implementation of the StackHook surface: byte edits requested from above are journaled
// into the segment's modification list here and applied in place.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    middlebox::{
        counters::Counters,
        fcb::{ClosingState, ConnectionTable, FlowControlBlock, FlowDirection, FlowId, MiddleboxPools, TcpCommon},
        modification::ModificationList,
        packet::PacketView,
        seq_number::SeqNumber,
        stack_hook::StackHook,
        tcp_out::TcpOut,
    },
    runtime::{fail::Fail, network::config::MiddleboxConfig},
};
use ::libc::{EBADMSG, ENOENT, ENOMEM};
use ::std::{
    cell::RefCell,
    net::SocketAddrV4,
    rc::Rc,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Inbound-direction element.
pub struct TcpIn {
    /// Which of the two directions this element reads.
    direction: FlowDirection,

    /// Configuration.
    config: MiddleboxConfig,

    /// Object pools shared with the paired TcpOut.
    pools: Rc<RefCell<MiddleboxPools>>,

    /// The flow table shared by both directions, consulted at setup and teardown only.
    table: Rc<RefCell<ConnectionTable>>,

    /// Paired outbound element, through which forged packets leave.
    out: Rc<RefCell<TcpOut>>,

    /// Name of the reverse-direction inbound element, resolved at configure time.
    return_name: String,

    /// Event counters.
    counters: Counters,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TcpIn {
    /// Creates an inbound element for `direction`, paired with `out`.
    pub fn new(
        direction: FlowDirection,
        config: MiddleboxConfig,
        pools: Rc<RefCell<MiddleboxPools>>,
        table: Rc<RefCell<ConnectionTable>>,
        out: Rc<RefCell<TcpOut>>,
        return_name: String,
    ) -> Self {
        Self {
            direction,
            config,
            pools,
            table,
            out,
            return_name,
            counters: Counters::default(),
        }
    }

    /// Which of the two directions this element reads.
    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    /// Name of the reverse-direction inbound element.
    pub fn return_name(&self) -> &str {
        &self.return_name
    }

    /// Paired outbound element.
    pub fn out_element(&self) -> Rc<RefCell<TcpOut>> {
        self.out.clone()
    }

    /// Event counters.
    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Runs a received packet through the inbound pipeline. Returns the packet for the upper elements, or `None`
    /// when it was consumed (acknowledged, answered or dropped).
    pub fn process(&mut self, fcb: &mut FlowControlBlock, mut pkt: PacketView, now: Instant) -> Option<PacketView> {
        // Bind the flow on the handshake; outside of it, a SYN is a protocol violation.
        if fcb.tcp_common().is_none() {
            if let Err(fail) = self.assign_tcp_common(fcb, &pkt) {
                match fail.errno {
                    ENOMEM => {
                        warn!("no room for a new flow; dropping SYN");
                        self.counters.resource_exhaustion += 1;
                    },
                    ENOENT => {
                        // SYN+ACK observed before the peer direction installed the flow; the sender will
                        // retransmit and find it installed then.
                        debug!("SYN+ACK without a registered peer flow; dropping");
                    },
                    _ => {
                        warn!("first packets of the flow are not SYN packets; dropping");
                        self.counters.protocol_violations += 1;
                    },
                }
                return None;
            }
        } else if pkt.is_syn() {
            warn!("unexpected SYN packet on an established flow; dropping");
            self.counters.protocol_violations += 1;
            return None;
        }

        let common_rc: Rc<RefCell<TcpCommon>> = fcb.tcp_common().expect("flow was just bound").clone();
        let mut common = common_rc.borrow_mut();
        common.touch(now);

        // Closing gate: once this direction is closing, nothing more passes. During a graceful close the sender
        // still gets its data acknowledged so it can finish in good order.
        let state: ClosingState = common.closing_state(self.direction);
        if state != ClosingState::Open {
            if pkt.is_ack() {
                self.ack_bookkeeping(&mut common, &pkt, now);
            }
            if state.is_graceful_closing() && (pkt.is_fin() || pkt.is_syn() || pkt.payload_len() > 0) {
                self.ack_packet(&mut common, &pkt, false);
            }
            self.counters.closing_gate_drops += 1;
            return None;
        }

        // From here on the packet may be edited; take exclusive ownership and anchor the content annotation.
        pkt.uniquify();
        let payload_offset: u16 = pkt.payload_offset() as u16;
        pkt.set_content_offset(payload_offset);

        // Content below the acknowledgment we already emitted means our acknowledgment was lost between the
        // middlebox and the receiver: answer it again and discard the copy.
        if !pkt.is_syn() {
            if let Some(last_ack_sent) = common.maintainer(self.direction.opposite()).last_ack_sent() {
                if pkt.seq_num() < last_ack_sent {
                    debug!("lost ack detected ({} < {}); resending it", pkt.seq_num(), last_ack_sent);
                    self.ack_packet(&mut common, &pkt, false);
                    self.counters.late_data_reacks += 1;
                    return None;
                }
            }
        }

        // Map the acknowledgment out of the stream we emitted and back into the one the sender's peer produced.
        if pkt.is_ack() {
            let ack: SeqNumber = pkt.ack_num();
            let new_ack: SeqNumber = common.maintainer(self.direction.opposite()).map_ack(ack);
            self.ack_bookkeeping(&mut common, &pkt, now);

            if pkt.is_pure_ack() {
                if let Some(last_ack_sent) = common.maintainer(self.direction).last_ack_sent() {
                    if new_ack < last_ack_sent {
                        debug!(
                            "ack for an already acknowledged sequence number; dropping ({}; {})",
                            new_ack, last_ack_sent
                        );
                        self.counters.duplicate_acks_dropped += 1;
                        return None;
                    }
                }
            }

            if ack != new_ack {
                trace!(
                    "ack number {} becomes {} in direction {}",
                    ack,
                    new_ack,
                    self.direction.index()
                );
                pkt.set_ack_num(new_ack);
                pkt.mark_dirty();
            }
        }

        // Closing signals observed on the wire take effect after the packet carrying them has passed the gate, so
        // the signal itself is still forwarded.
        if pkt.is_rst() {
            common.advance_closing(self.direction, ClosingState::ClosedUngraceful);
            common.advance_closing(self.direction.opposite(), ClosingState::ClosedUngraceful);
        } else if pkt.is_fin() {
            common.advance_closing(self.direction, ClosingState::BeingClosedGraceful);
        }

        Some(pkt)
    }

    /// Releases the flow once both directions are terminal and nothing awaits acknowledgment.
    pub fn maybe_release(&mut self, fcb: &mut FlowControlBlock) -> bool {
        let terminated: bool = match fcb.tcp_common() {
            Some(common) => common.borrow().is_terminated(),
            None => false,
        };
        if !terminated {
            return false;
        }
        self.release(fcb);
        true
    }

    /// Unconditionally releases the flow: unregisters it (when this side registered it), returns journals and the
    /// shared record to their pools.
    pub fn release(&mut self, fcb: &mut FlowControlBlock) {
        if fcb.owns_common() {
            if let Some(flow_id) = fcb.flow_id() {
                self.table.borrow_mut().remove(&flow_id);
            }
        }
        let mut pools = self.pools.borrow_mut();
        if let Some(common) = fcb.release(&mut pools) {
            pools.recycle_common(common);
        }
    }

    /// Drops every flow without traffic for the configured idle period.
    pub fn expire_idle_flows(&mut self, now: Instant) -> usize {
        let dropped: usize = self.table.borrow_mut().cleanup(now);
        self.counters.idle_flows_dropped += dropped as u64;
        dropped
    }

    /// Attaches the packet's flow to its shared connection record, per the handshake rule: the direction whose SYN
    /// lacks ACK allocates and registers; the direction whose SYN bears ACK looks the record up under the reversed
    /// flow id.
    fn assign_tcp_common(&mut self, fcb: &mut FlowControlBlock, pkt: &PacketView) -> Result<(), Fail> {
        if !pkt.is_syn() {
            return Err(Fail::new(EBADMSG, "flow must open with a SYN"));
        }

        let flow_id: FlowId = FlowId::from_packet(pkt);
        let src: SocketAddrV4 = flow_id.src;
        let dst: SocketAddrV4 = flow_id.dst;

        if pkt.is_ack() {
            // We are not the initiating side: the peer direction allocated the record.
            let common: Rc<RefCell<TcpCommon>> = self
                .table
                .borrow()
                .lookup(&flow_id.reversed())
                .ok_or_else(|| Fail::new(ENOENT, "peer flow not registered"))?;
            common
                .borrow_mut()
                .maintainer_mut(self.direction)
                .initialize(pkt.seq_num(), src, dst);
            fcb.bind(common, flow_id, false);
        } else {
            // We are the initiating side: allocate and register the record.
            let recycled: TcpCommon = self.pools.borrow_mut().tcp_commons.get()?;
            let common: Rc<RefCell<TcpCommon>> = Rc::new(RefCell::new(recycled));
            {
                let mut fresh = common.borrow_mut();
                fresh.reset(&self.config);
                fresh.maintainer_mut(self.direction).initialize(pkt.seq_num(), src, dst);
            }

            let mut table = self.table.borrow_mut();
            if table.insert_if_absent(flow_id, common.clone()).is_err() {
                // A stale registration under the same id; the new handshake supersedes it.
                debug!("replacing stale flow registration {:?}", flow_id);
                table.remove(&flow_id);
                table
                    .insert_if_absent(flow_id, common.clone())
                    .expect("the id was just vacated");
            }
            fcb.bind(common, flow_id, true);
        }
        Ok(())
    }

    /// Acknowledgment-side state updates shared by the normal path and the closing gate: record and prune against
    /// the received acknowledgment, feed the opposite direction's retransmission record, and finish the opposite
    /// direction's close when this acknowledgment covers its FIN.
    fn ack_bookkeeping(&mut self, common: &mut TcpCommon, pkt: &PacketView, now: Instant) {
        let ack: SeqNumber = pkt.ack_num();
        let opposite: FlowDirection = self.direction.opposite();

        common.maintainer_mut(self.direction).set_last_ack_received(ack);
        common.maintainer_mut(opposite).prune(ack);
        common.retransmission_mut(opposite).signal_ack(ack, now);

        if let Some(fin_seq) = common.fin_seq_sent(opposite) {
            if ack >= fin_seq + SeqNumber::from(1) {
                let finished: Option<ClosingState> = match common.closing_state(opposite) {
                    ClosingState::BeingClosedGraceful => Some(ClosingState::ClosedGraceful),
                    ClosingState::BeingClosedUngraceful => Some(ClosingState::ClosedUngraceful),
                    _ => None,
                };
                if let Some(state) = finished {
                    common.advance_closing(opposite, state);
                }
            }
        }
    }

    /// Forges an acknowledgment answering `pkt` toward its sender. The forged packet's sequence number is the
    /// acknowledgment `pkt` carried; when that acknowledgment was already mapped by this element (`ack_mapped`), it
    /// is mapped forward again to recover the wire value.
    fn ack_packet(&mut self, common: &mut TcpCommon, pkt: &PacketView, ack_mapped: bool) {
        let opposite: FlowDirection = self.direction.opposite();

        let mut seq: SeqNumber = pkt.ack_num();
        if ack_mapped {
            seq = common.maintainer(opposite).map_seq(seq);
        }
        // Acknowledge everything the packet occupies.
        let ack: SeqNumber = pkt.next_seq_num();

        self.out.borrow_mut().send_ack(
            common.maintainer_mut(opposite),
            pkt.dst_addr(),
            pkt.src_addr(),
            pkt.dst_port(),
            pkt.src_port(),
            seq,
            ack,
        );
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// TcpIn is where the edit surface bottoms out: journal, then apply.
impl StackHook for TcpIn {
    fn remove_bytes(
        &mut self,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        position: u32,
        length: u32,
    ) -> Result<(), Fail> {
        let seq: SeqNumber = packet.seq_num();
        let absolute: u32 = packet.content_offset() as u32 + position;
        let position_in_payload: u32 = absolute - packet.payload_offset() as u32;

        let mut pools = self.pools.borrow_mut();
        let list: &mut ModificationList = fcb.modification_list_or_create(seq, &mut pools)?;
        list.add_modification(
            &mut pools.modification_nodes,
            seq + SeqNumber::from(position_in_payload),
            -(length as i32),
        )?;
        drop(pools);

        packet.remove_payload_bytes(absolute as usize, length as usize)
    }

    fn insert_bytes(
        &mut self,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        position: u32,
        length: u32,
    ) -> Result<(), Fail> {
        let seq: SeqNumber = packet.seq_num();
        let absolute: u32 = packet.content_offset() as u32 + position;
        let position_in_payload: u32 = absolute - packet.payload_offset() as u32;

        let mut pools = self.pools.borrow_mut();
        let list: &mut ModificationList = fcb.modification_list_or_create(seq, &mut pools)?;
        list.add_modification(
            &mut pools.modification_nodes,
            seq + SeqNumber::from(position_in_payload),
            length as i32,
        )?;
        drop(pools);

        packet.insert_payload_bytes(absolute as usize, length as usize)
    }

    fn request_more_packets(&mut self, fcb: &mut FlowControlBlock, packet: &PacketView) -> Result<(), Fail> {
        let common_rc: Rc<RefCell<TcpCommon>> = fcb
            .tcp_common()
            .ok_or_else(|| Fail::new(ENOENT, "flow not bound"))?
            .clone();
        // The packet's acknowledgment was mapped on the way in; recover the wire value for the forged sequence.
        self.ack_packet(&mut common_rc.borrow_mut(), packet, true);
        Ok(())
    }

    fn close_connection(
        &mut self,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        graceful: bool,
        both_sides: bool,
    ) -> Result<(), Fail> {
        let common_rc: Rc<RefCell<TcpCommon>> = fcb
            .tcp_common()
            .ok_or_else(|| Fail::new(ENOENT, "flow not bound"))?
            .clone();
        let mut common = common_rc.borrow_mut();
        let opposite: FlowDirection = self.direction.opposite();

        // The forwarded packet itself carries the closing flag toward the receiver.
        let (flag, state_self, state_other): (u8, ClosingState, ClosingState) = if graceful {
            (
                super::packet::TCP_FLAG_FIN,
                ClosingState::BeingClosedGraceful,
                ClosingState::ClosedGraceful,
            )
        } else {
            (
                super::packet::TCP_FLAG_RST,
                ClosingState::BeingClosedUngraceful,
                ClosingState::ClosedUngraceful,
            )
        };
        packet.add_flags(flag);
        packet.mark_dirty();
        common.advance_closing(self.direction, state_self);

        if both_sides {
            common.advance_closing(opposite, state_other);

            // Answer the sender with a closing packet of its own, with the sequence numbering it expects: the
            // mapped-back acknowledgment it last saw, acknowledging everything it sent (the closing flag included).
            let mut seq: SeqNumber = packet.ack_num();
            seq = common.maintainer(opposite).map_seq(seq);
            let ack: SeqNumber = packet.next_seq_num();

            // For an abortive close the peer's exact expectations cannot be known here; the RST is sent once, best
            // effort, and never retried.
            self.out.borrow_mut().send_closing_packet(
                common.maintainer_mut(opposite),
                packet.dst_addr(),
                packet.src_addr(),
                packet.dst_port(),
                packet.src_port(),
                seq,
                ack,
                graceful,
            );
        }

        debug!(
            "closing connection on direction {} (graceful: {}, both sides: {})",
            self.direction.index(),
            graceful,
            both_sides
        );
        Ok(())
    }

    fn set_packet_dirty(&mut self, _fcb: &mut FlowControlBlock, packet: &mut PacketView) {
        packet.mark_dirty();
    }
}
