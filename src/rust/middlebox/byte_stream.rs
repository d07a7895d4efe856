// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Per-direction record of the running difference between the byte stream a sender emitted and the byte stream this
// middlebox put back on the wire. Every payload edit shifts all later bytes, so the maintainer keeps a sorted map
// from original-stream positions to the cumulative shift in effect from that position on. Sequence numbers map
// forward through it (original -> rewritten) and acknowledgment numbers map backward (rewritten -> original).
//
// Keys are stored relative to a moving base anchor. TCP sequence numbers wrap, so absolute keys cannot be compared
// with integer order; as long as every live position is within half the sequence space of the anchor (guaranteed by
// pruning against the acknowledged watermark), relative keys are plain u32s and the map stays an ordinary ordered
// map.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::middlebox::seq_number::SeqNumber;
use ::std::{
    collections::BTreeMap,
    mem,
    net::{Ipv4Addr, SocketAddrV4},
    ops::Bound,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Byte Stream Maintainer
#[derive(Debug)]
pub struct ByteStreamMaintainer {
    /// Original-space anchor. Advanced on prune; every live key is at or above it.
    base: SeqNumber,

    /// Cumulative shift in effect at the anchor.
    anchor_delta: i64,

    /// Cumulative shift in effect from `base + key` on, keyed by position relative to `base`.
    tree: BTreeMap<u32, i64>,

    /// Last acknowledgment number emitted on this direction's wire.
    last_ack_sent: Option<SeqNumber>,

    /// Last acknowledgment number received from this direction's sender.
    last_ack_received: Option<SeqNumber>,

    /// Highest sequence number this direction has retransmitted on behalf of the sender.
    retransmitted_seq: Option<SeqNumber>,

    /// This direction's sender.
    src: SocketAddrV4,

    /// This direction's receiver.
    dst: SocketAddrV4,

    /// Receive window to advertise in forged packets, mirrored from the last packet seen.
    window_size: u16,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ByteStreamMaintainer {
    /// Re-arms the maintainer for a new flow whose first sequence number is `base`.
    pub fn initialize(&mut self, base: SeqNumber, src: SocketAddrV4, dst: SocketAddrV4) {
        self.base = base;
        self.anchor_delta = 0;
        self.tree.clear();
        self.last_ack_sent = None;
        self.last_ack_received = None;
        self.retransmitted_seq = None;
        self.src = src;
        self.dst = dst;
        self.window_size = 0;
    }

    /// Position of `seq` relative to the anchor.
    fn rel(&self, seq: SeqNumber) -> u32 {
        (seq - self.base).into()
    }

    /// Applies a signed shift to a sequence number, modulo the sequence space.
    fn shift(seq: SeqNumber, delta: i64) -> SeqNumber {
        SeqNumber::from(u32::from(seq).wrapping_add(delta as u32))
    }

    /// Maps an original-stream sequence number to the rewritten stream.
    pub fn map_seq(&self, seq: SeqNumber) -> SeqNumber {
        if seq < self.base {
            // Below the pruned watermark no mapping is maintained; pass the value through.
            return seq;
        }
        let rel: u32 = self.rel(seq);
        let delta: i64 = self
            .tree
            .range(..=rel)
            .next_back()
            .map(|(_, delta)| *delta)
            .unwrap_or(self.anchor_delta);
        Self::shift(seq, delta)
    }

    /// Maps a rewritten-stream acknowledgment number back to the acknowledgment the receiver would have generated
    /// for the original stream: the largest original position whose mapping does not exceed `ack`, advanced by the
    /// leftover distance.
    pub fn map_ack(&self, ack: SeqNumber) -> SeqNumber {
        for (key, delta) in self.tree.iter().rev() {
            let orig: SeqNumber = self.base + SeqNumber::from(*key);
            let mapped: SeqNumber = Self::shift(orig, *delta);
            if mapped <= ack {
                return orig + (ack - mapped);
            }
        }

        let mapped_base: SeqNumber = Self::shift(self.base, self.anchor_delta);
        if mapped_base <= ack {
            return self.base + (ack - mapped_base);
        }

        // Acknowledgment below the anchor's mapping: already pruned, undo the anchor shift only.
        Self::shift(ack, -self.anchor_delta)
    }

    /// Commits a new edit point: from original position `seq` on, all bytes shift by an additional `delta`.
    pub fn insert_in_tree(&mut self, seq: SeqNumber, delta: i64) {
        let rel: u32 = self.rel(seq);
        if rel == 0 {
            self.anchor_delta += delta;
            for (_, cumulative) in self.tree.iter_mut() {
                *cumulative += delta;
            }
            return;
        }

        let previous: i64 = self
            .tree
            .range(..=rel)
            .next_back()
            .map(|(_, cumulative)| *cumulative)
            .unwrap_or(self.anchor_delta);
        *self.tree.entry(rel).or_insert(previous) += delta;

        for (_, cumulative) in self.tree.range_mut((Bound::Excluded(rel), Bound::Unbounded)) {
            *cumulative += delta;
        }
    }

    /// Discards mapping state below the acknowledged watermark. `ack` is a rewritten-stream value, as received on
    /// the wire; positions whose mapping it covers can never be asked about again.
    pub fn prune(&mut self, ack: SeqNumber) {
        let watermark: SeqNumber = self.map_ack(ack);
        if watermark <= self.base {
            return;
        }
        let rel_watermark: u32 = self.rel(watermark);

        let old_tree: BTreeMap<u32, i64> = mem::take(&mut self.tree);
        for (key, cumulative) in old_tree {
            if key <= rel_watermark {
                // The greatest pruned node becomes the new anchor's shift.
                self.anchor_delta = cumulative;
            } else {
                self.tree.insert(key - rel_watermark, cumulative);
            }
        }
        self.base = watermark;
    }

    /// Number of live edit points (anchor excluded).
    pub fn tree_size(&self) -> usize {
        self.tree.len()
    }

    /// The pruning anchor.
    pub fn base(&self) -> SeqNumber {
        self.base
    }

    /// Last acknowledgment number emitted on this direction's wire.
    pub fn last_ack_sent(&self) -> Option<SeqNumber> {
        self.last_ack_sent
    }

    /// Records an acknowledgment emitted on this direction's wire. Acknowledgments never move backwards.
    pub fn set_last_ack_sent(&mut self, ack: SeqNumber) {
        match self.last_ack_sent {
            Some(previous) if ack <= previous => (),
            _ => self.last_ack_sent = Some(ack),
        }
    }

    /// Last acknowledgment number received from this direction's sender.
    pub fn last_ack_received(&self) -> Option<SeqNumber> {
        self.last_ack_received
    }

    /// Records an acknowledgment received from this direction's sender.
    pub fn set_last_ack_received(&mut self, ack: SeqNumber) {
        self.last_ack_received = Some(ack);
    }

    /// Highest sequence number retransmitted on this direction.
    pub fn retransmitted_seq(&self) -> Option<SeqNumber> {
        self.retransmitted_seq
    }

    /// Records a retransmission watermark. The watermark never moves backwards.
    pub fn record_retransmission(&mut self, seq: SeqNumber) {
        match self.retransmitted_seq {
            Some(previous) if seq <= previous => (),
            _ => self.retransmitted_seq = Some(seq),
        }
    }

    /// This direction's sender address.
    pub fn ip_src(&self) -> Ipv4Addr {
        *self.src.ip()
    }

    /// This direction's receiver address.
    pub fn ip_dst(&self) -> Ipv4Addr {
        *self.dst.ip()
    }

    /// This direction's sender port.
    pub fn port_src(&self) -> u16 {
        self.src.port()
    }

    /// This direction's receiver port.
    pub fn port_dst(&self) -> u16 {
        self.dst.port()
    }

    /// Receive window to advertise in forged packets.
    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    /// Mirrors the receive window of a packet seen on this direction.
    pub fn set_window_size(&mut self, window_size: u16) {
        self.window_size = window_size;
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ByteStreamMaintainer {
    fn default() -> Self {
        Self {
            base: SeqNumber::from(0),
            anchor_delta: 0,
            tree: BTreeMap::new(),
            last_ack_sent: None,
            last_ack_received: None,
            retransmitted_seq: None,
            src: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            dst: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            window_size: 0,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
