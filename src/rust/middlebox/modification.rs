// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Per-segment journal of payload edits. Each outgoing segment that upper elements touched carries an ordered list of
// (position, signed byte delta) pairs keyed by the segment's original sequence number. The journal exists so that a
// retransmission of the same original segment is recognized: its delta is not committed into the byte-stream
// mapping a second time, and the emitted form shadowed at first transmission goes back on the wire in place of the
// sender's unedited bytes.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    middlebox::seq_number::SeqNumber,
    runtime::{fail::Fail, memory::MemoryPool},
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// One edit: `offset` bytes were inserted (positive) or removed (negative) at original-stream `position`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ModificationNode {
    /// Position of the edit in the original sequence space.
    pub position: SeqNumber,

    /// Signed byte delta of the edit.
    pub offset: i32,
}

/// Ordered log of the edits applied to one segment.
#[derive(Debug, Default)]
pub struct ModificationList {
    /// Edits, ordered by non-decreasing position.
    nodes: Vec<ModificationNode>,

    /// Whether the aggregate delta has been committed into the byte-stream maintainer.
    committed: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ModificationList {
    /// Records an edit. Edits at the same position compose by addition; an edit before the last recorded position is
    /// placed at its sorted location so the list stays ordered.
    pub fn add_modification(
        &mut self,
        node_pool: &mut MemoryPool<ModificationNode>,
        position: SeqNumber,
        offset: i32,
    ) -> Result<(), Fail> {
        // Walk back over entries positioned after the new edit. In practice upper elements edit left to right, so
        // this loop almost never iterates.
        let mut index: usize = self.nodes.len();
        while index > 0 && self.nodes[index - 1].position > position {
            index -= 1;
        }

        if index > 0 && self.nodes[index - 1].position == position {
            self.nodes[index - 1].offset += offset;
            return Ok(());
        }

        let mut node: ModificationNode = node_pool.get()?;
        node.position = position;
        node.offset = offset;
        self.nodes.insert(index, node);
        Ok(())
    }

    /// Sum of all deltas, i.e. the segment's length change.
    pub fn aggregate_delta(&self) -> i32 {
        self.nodes.iter().map(|node| node.offset).sum()
    }

    /// Whether the aggregate delta has been committed into the byte-stream maintainer.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Marks the aggregate delta as committed.
    pub fn mark_committed(&mut self) {
        self.committed = true;
    }

    /// Returns all nodes to the pool and resets the list for reuse.
    pub fn clear(&mut self, node_pool: &mut MemoryPool<ModificationNode>) {
        for node in self.nodes.drain(..) {
            node_pool.put(node);
        }
        self.committed = false;
    }

    /// Number of recorded edits.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no edits are recorded.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The recorded edits, ordered by position.
    pub fn nodes(&self) -> &[ModificationNode] {
        &self.nodes
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
