// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Per-flow state. One TcpCommon is shared by the two directions of a connection; one FlowControlBlock exists per
// direction and points at it. The side that saw the bare SYN allocates the TcpCommon and registers it in the
// connection table under its flow id; the side that saw the SYN+ACK finds it there under the reversed id.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    middlebox::{
        byte_stream::ByteStreamMaintainer,
        modification::{ModificationList, ModificationNode},
        packet::PacketView,
        retransmission::RetransmissionTiming,
        seq_number::SeqNumber,
    },
    runtime::{fail::Fail, memory::MemoryPool, network::config::MiddleboxConfig},
};
use ::hashbrown::HashMap;
use ::libc::{EEXIST, EINVAL};
use ::std::{
    cell::RefCell,
    net::SocketAddrV4,
    rc::Rc,
    time::{Duration, Instant},
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// One of the two directions of a connection through the middlebox.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlowDirection(u8);

/// Closing progress of one direction. States only ever advance: OPEN, then BEING_CLOSED, then CLOSED.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ClosingState {
    #[default]
    Open,
    BeingClosedGraceful,
    ClosedGraceful,
    BeingClosedUngraceful,
    ClosedUngraceful,
}

/// Identifier of one direction of a connection: where its packets come from and where they go.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FlowId {
    /// Sender of this direction.
    pub src: SocketAddrV4,

    /// Receiver of this direction.
    pub dst: SocketAddrV4,
}

/// Connection state shared by both directions.
#[derive(Debug, Default)]
pub struct TcpCommon {
    /// Byte-stream maintainers, indexed by direction.
    maintainers: [ByteStreamMaintainer; 2],

    /// Retransmission records, indexed by direction.
    retransmission_timings: [RetransmissionTiming; 2],

    /// Closing progress, indexed by direction.
    closing_states: [ClosingState; 2],

    /// Sequence number consumed by a FIN emitted on each direction's wire, when one was emitted.
    fin_seq_sent: [Option<SeqNumber>; 2],

    /// Last time a packet of this connection was processed.
    last_activity: Option<Instant>,
}

/// Per-direction flow state.
#[derive(Debug, Default)]
pub struct FlowControlBlock {
    /// Connection state shared with the other direction's block.
    tcp_common: Option<Rc<RefCell<TcpCommon>>>,

    /// Whether this block allocated the shared state and must unregister it on teardown.
    owns_common: bool,

    /// Flow id this block registered (or looked up) the shared state under.
    flow_id: Option<FlowId>,

    /// Journals of the edits applied to in-flight segments, keyed by original sequence number.
    modifications: HashMap<u32, ModificationList>,
}

/// The per-core object pools backing flow state.
#[derive(Debug)]
pub struct MiddleboxPools {
    /// Pool of modification nodes.
    pub modification_nodes: MemoryPool<ModificationNode>,

    /// Pool of modification lists.
    pub modification_lists: MemoryPool<ModificationList>,

    /// Pool of shared connection records.
    pub tcp_commons: MemoryPool<TcpCommon>,
}

/// The table mapping flow ids to shared connection records. Consulted only at connection setup and teardown.
#[derive(Debug)]
pub struct ConnectionTable {
    /// Live connections, keyed by the flow id of the initiating direction.
    flows: HashMap<FlowId, Rc<RefCell<TcpCommon>>>,

    /// Period without traffic after which a connection is dropped.
    idle_timeout: Duration,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl FlowDirection {
    /// Builds a flow direction from its configured value.
    pub fn new(raw: u8) -> Result<Self, Fail> {
        match raw {
            0 | 1 => Ok(Self(raw)),
            _ => Err(Fail::new(EINVAL, "flow direction must be 0 or 1")),
        }
    }

    /// The other direction of the same connection.
    pub fn opposite(self) -> Self {
        Self(1 - self.0)
    }

    /// Index of this direction's slot in the shared connection record.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ClosingState {
    fn rank(self) -> u8 {
        match self {
            ClosingState::Open => 0,
            ClosingState::BeingClosedGraceful | ClosingState::BeingClosedUngraceful => 1,
            ClosingState::ClosedGraceful | ClosingState::ClosedUngraceful => 2,
        }
    }

    /// Whether no more transitions are possible out of this state.
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether this direction is being (or has been) shut down in an orderly fashion, in which case inbound data is
    /// still acknowledged on the sender's behalf.
    pub fn is_graceful_closing(self) -> bool {
        matches!(self, ClosingState::BeingClosedGraceful | ClosingState::ClosedGraceful)
    }
}

impl FlowId {
    /// The flow id of the sender of `packet`.
    pub fn from_packet(packet: &PacketView) -> Self {
        Self {
            src: SocketAddrV4::new(packet.src_addr(), packet.src_port()),
            dst: SocketAddrV4::new(packet.dst_addr(), packet.dst_port()),
        }
    }

    /// The id of the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl TcpCommon {
    /// Re-arms a (possibly recycled) record for a new connection.
    pub fn reset(&mut self, config: &MiddleboxConfig) {
        for maintainer in self.maintainers.iter_mut() {
            *maintainer = ByteStreamMaintainer::default();
        }
        for timing in self.retransmission_timings.iter_mut() {
            timing.initialize(config.get_max_rto(), config.get_retransmit_limit());
        }
        self.closing_states = [ClosingState::Open; 2];
        self.fin_seq_sent = [None; 2];
        self.last_activity = None;
    }

    /// The byte-stream maintainer of `direction`.
    pub fn maintainer(&self, direction: FlowDirection) -> &ByteStreamMaintainer {
        &self.maintainers[direction.index()]
    }

    /// The byte-stream maintainer of `direction`.
    pub fn maintainer_mut(&mut self, direction: FlowDirection) -> &mut ByteStreamMaintainer {
        &mut self.maintainers[direction.index()]
    }

    /// The retransmission record of `direction`.
    pub fn retransmission(&self, direction: FlowDirection) -> &RetransmissionTiming {
        &self.retransmission_timings[direction.index()]
    }

    /// The retransmission record of `direction`.
    pub fn retransmission_mut(&mut self, direction: FlowDirection) -> &mut RetransmissionTiming {
        &mut self.retransmission_timings[direction.index()]
    }

    /// The closing progress of `direction`.
    pub fn closing_state(&self, direction: FlowDirection) -> ClosingState {
        self.closing_states[direction.index()]
    }

    /// Advances the closing progress of `direction`. A state never moves backwards and a terminal state never
    /// changes; returns whether the state changed.
    pub fn advance_closing(&mut self, direction: FlowDirection, new_state: ClosingState) -> bool {
        let current: ClosingState = self.closing_states[direction.index()];
        if new_state.rank() <= current.rank() {
            return false;
        }
        trace!(
            "closing state of direction {} advances {:?} -> {:?}",
            direction.index(),
            current,
            new_state
        );
        self.closing_states[direction.index()] = new_state;
        true
    }

    /// Sequence number consumed by the FIN emitted on `direction`'s wire, if one was emitted.
    pub fn fin_seq_sent(&self, direction: FlowDirection) -> Option<SeqNumber> {
        self.fin_seq_sent[direction.index()]
    }

    /// Records the sequence number consumed by a FIN emitted on `direction`'s wire.
    pub fn set_fin_seq_sent(&mut self, direction: FlowDirection, seq: SeqNumber) {
        self.fin_seq_sent[direction.index()] = Some(seq);
    }

    /// Whether the connection is fully shut down: both directions terminal and no segment awaiting acknowledgment.
    pub fn is_terminated(&self) -> bool {
        self.closing_states.iter().all(|state| state.is_terminal())
            && self.retransmission_timings.iter().all(|timing| !timing.in_flight())
    }

    /// Records traffic on this connection.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// Last time a packet of this connection was processed.
    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }
}

impl FlowControlBlock {
    /// Creates an unbound flow control block.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared connection record, if the handshake has been seen.
    pub fn tcp_common(&self) -> Option<&Rc<RefCell<TcpCommon>>> {
        self.tcp_common.as_ref()
    }

    /// Binds this block to a shared connection record.
    pub fn bind(&mut self, common: Rc<RefCell<TcpCommon>>, flow_id: FlowId, owns_common: bool) {
        self.tcp_common = Some(common);
        self.flow_id = Some(flow_id);
        self.owns_common = owns_common;
    }

    /// Whether this block allocated the shared record.
    pub fn owns_common(&self) -> bool {
        self.owns_common
    }

    /// Flow id this block is bound under.
    pub fn flow_id(&self) -> Option<FlowId> {
        self.flow_id
    }

    /// Looks up the edit journal of the segment whose original sequence number is `seq`.
    pub fn modification_list(&self, seq: SeqNumber) -> Option<&ModificationList> {
        self.modifications.get(&u32::from(seq))
    }

    /// Looks up the edit journal of the segment whose original sequence number is `seq`.
    pub fn modification_list_mut(&mut self, seq: SeqNumber) -> Option<&mut ModificationList> {
        self.modifications.get_mut(&u32::from(seq))
    }

    /// Whether the segment whose original sequence number is `seq` has an edit journal.
    pub fn has_modification_list(&self, seq: SeqNumber) -> bool {
        self.modifications.contains_key(&u32::from(seq))
    }

    /// Returns the edit journal of the segment whose original sequence number is `seq`, creating it from the list
    /// pool on first use.
    pub fn modification_list_or_create(
        &mut self,
        seq: SeqNumber,
        pools: &mut MiddleboxPools,
    ) -> Result<&mut ModificationList, Fail> {
        let key: u32 = seq.into();
        if !self.modifications.contains_key(&key) {
            let list: ModificationList = pools.modification_lists.get()?;
            self.modifications.insert(key, list);
        }
        Ok(self.modifications.get_mut(&key).expect("just inserted"))
    }

    /// Drops the journals of segments fully below the acknowledged original-stream watermark, returning their
    /// storage to the pools. A journaled segment is retired once its first byte is acknowledged: the far endpoint
    /// will never legitimately see it retransmitted.
    pub fn retire_modifications(&mut self, watermark: SeqNumber, pools: &mut MiddleboxPools) {
        let retired: Vec<u32> = self
            .modifications
            .keys()
            .copied()
            .filter(|&key| SeqNumber::from(key) < watermark)
            .collect();
        for key in retired {
            let mut list: ModificationList = self.modifications.remove(&key).expect("key was just listed");
            list.clear(&mut pools.modification_nodes);
            pools.modification_lists.put(list);
        }
    }

    /// Releases every journal and unbinds the shared record. Returns the record so the caller can drop the table
    /// registration and recycle it.
    pub fn release(&mut self, pools: &mut MiddleboxPools) -> Option<Rc<RefCell<TcpCommon>>> {
        for (_, mut list) in self.modifications.drain() {
            list.clear(&mut pools.modification_nodes);
            pools.modification_lists.put(list);
        }
        self.flow_id = None;
        self.owns_common = false;
        self.tcp_common.take()
    }
}

impl MiddleboxPools {
    /// Creates the pools with the capacities of `config`.
    pub fn new(config: &MiddleboxConfig) -> Self {
        Self {
            modification_nodes: MemoryPool::new(config.get_modification_node_pool_size()),
            modification_lists: MemoryPool::new(config.get_modification_list_pool_size()),
            tcp_commons: MemoryPool::new(config.get_tcp_common_pool_size()),
        }
    }

    /// Recycles a shared connection record once the last reference to it is dropped by the caller. If the other
    /// direction still holds a reference, the record is returned to the pool when that side releases it instead.
    pub fn recycle_common(&mut self, common: Rc<RefCell<TcpCommon>>) {
        if let Ok(cell) = Rc::try_unwrap(common) {
            self.tcp_commons.put(cell.into_inner());
        }
    }
}

impl ConnectionTable {
    /// Creates an empty connection table.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            flows: HashMap::new(),
            idle_timeout,
        }
    }

    /// Registers a connection under `flow_id`. Fails if the id is already taken.
    pub fn insert_if_absent(&mut self, flow_id: FlowId, common: Rc<RefCell<TcpCommon>>) -> Result<(), Fail> {
        if self.flows.contains_key(&flow_id) {
            return Err(Fail::new(EEXIST, "flow already registered"));
        }
        self.flows.insert(flow_id, common);
        Ok(())
    }

    /// Looks up the connection registered under `flow_id`.
    pub fn lookup(&self, flow_id: &FlowId) -> Option<Rc<RefCell<TcpCommon>>> {
        self.flows.get(flow_id).cloned()
    }

    /// Unregisters the connection registered under `flow_id`.
    pub fn remove(&mut self, flow_id: &FlowId) -> Option<Rc<RefCell<TcpCommon>>> {
        self.flows.remove(flow_id)
    }

    /// Drops every connection without traffic for the configured idle period. Returns how many were dropped.
    pub fn cleanup(&mut self, now: Instant) -> usize {
        let idle_timeout: Duration = self.idle_timeout;
        let before: usize = self.flows.len();
        self.flows.retain(|flow_id, common| {
            let keep: bool = match common.borrow().last_activity() {
                Some(last) => now.saturating_duration_since(last) < idle_timeout,
                None => true,
            };
            if !keep {
                debug!("dropping idle flow {:?}", flow_id);
            }
            keep
        });
        before - self.flows.len()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Returns `true` if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
