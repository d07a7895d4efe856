// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Drop accounting. Errors in the interception path are local to a flow and never propagate upward; what operators
// get instead is one counter per kind of event.

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-element event counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct Counters {
    /// Packets dropped for violating the protocol (SYN after establishment, data before SYN).
    pub protocol_violations: u64,

    /// Packets dropped because a pool or the connection table was exhausted.
    pub resource_exhaustion: u64,

    /// Flows torn down because the retransmit limit was exhausted.
    pub retransmission_timeouts: u64,

    /// Already-acknowledged segments answered with a fresh acknowledgment (lost-ACK recovery).
    pub late_data_reacks: u64,

    /// Pure acknowledgments dropped for carrying no new information.
    pub duplicate_acks_dropped: u64,

    /// Packets discarded because their direction was already closing.
    pub closing_gate_drops: u64,

    /// Flows dropped by the idle timeout.
    pub idle_flows_dropped: u64,
}
