// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::time::Duration;

//==============================================================================
// Constants
//==============================================================================

/// Default capacity of the modification node pool.
const DEFAULT_MODIFICATION_NODE_POOL_SIZE: usize = 16384;

/// Default capacity of the modification list pool.
const DEFAULT_MODIFICATION_LIST_POOL_SIZE: usize = 4096;

/// Default capacity of the shared connection record pool.
const DEFAULT_TCP_COMMON_POOL_SIZE: usize = 1024;

/// Default number of unanswered retransmissions before a flow is torn down.
const DEFAULT_RETRANSMIT_LIMIT: usize = 5;

/// Default upper bound on the retransmission timeout.
const DEFAULT_MAX_RTO: Duration = Duration::from_secs(60);

/// Default period without traffic after which a flow is dropped.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

//==============================================================================
// Structures
//==============================================================================

/// Middlebox Configuration Descriptor
#[derive(Clone, Debug)]
pub struct MiddleboxConfig {
    /// Capacity of the modification node pool.
    modification_node_pool_size: usize,
    /// Capacity of the modification list pool.
    modification_list_pool_size: usize,
    /// Capacity of the shared connection record pool.
    tcp_common_pool_size: usize,
    /// Number of unanswered retransmissions before a flow is torn down.
    retransmit_limit: usize,
    /// Upper bound on the retransmission timeout.
    max_rto: Duration,
    /// Period without traffic after which a flow is dropped.
    idle_timeout: Duration,
    /// Offload Checksum to Hardware When Sending?
    tx_checksum_offload: bool,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate Functions for the Middlebox Configuration Descriptor
impl MiddleboxConfig {
    /// Creates a Middlebox Configuration Descriptor.
    pub fn new(
        modification_node_pool_size: Option<usize>,
        modification_list_pool_size: Option<usize>,
        tcp_common_pool_size: Option<usize>,
        retransmit_limit: Option<usize>,
        max_rto: Option<Duration>,
        idle_timeout: Option<Duration>,
        tx_checksum_offload: Option<bool>,
    ) -> Self {
        let mut options = Self::default();

        if let Some(value) = modification_node_pool_size {
            options.modification_node_pool_size = value;
        }
        if let Some(value) = modification_list_pool_size {
            options.modification_list_pool_size = value;
        }
        if let Some(value) = tcp_common_pool_size {
            options.tcp_common_pool_size = value;
        }
        if let Some(value) = retransmit_limit {
            options.retransmit_limit = value;
        }
        if let Some(value) = max_rto {
            options.max_rto = value;
        }
        if let Some(value) = idle_timeout {
            options.idle_timeout = value;
        }
        if let Some(value) = tx_checksum_offload {
            options.tx_checksum_offload = value;
        }

        options
    }

    /// Gets the capacity of the modification node pool in the target [MiddleboxConfig].
    pub fn get_modification_node_pool_size(&self) -> usize {
        self.modification_node_pool_size
    }

    /// Gets the capacity of the modification list pool in the target [MiddleboxConfig].
    pub fn get_modification_list_pool_size(&self) -> usize {
        self.modification_list_pool_size
    }

    /// Gets the capacity of the shared connection record pool in the target [MiddleboxConfig].
    pub fn get_tcp_common_pool_size(&self) -> usize {
        self.tcp_common_pool_size
    }

    /// Gets the retransmission give-up threshold in the target [MiddleboxConfig].
    pub fn get_retransmit_limit(&self) -> usize {
        self.retransmit_limit
    }

    /// Gets the upper bound on the retransmission timeout in the target [MiddleboxConfig].
    pub fn get_max_rto(&self) -> Duration {
        self.max_rto
    }

    /// Gets the idle timeout in the target [MiddleboxConfig].
    pub fn get_idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Gets whether to offload checksum to hardware when sending in the target [MiddleboxConfig].
    pub fn get_tx_checksum_offload(&self) -> bool {
        self.tx_checksum_offload
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default Trait Implementation for the Middlebox Configuration Descriptor
impl Default for MiddleboxConfig {
    fn default() -> Self {
        Self {
            modification_node_pool_size: DEFAULT_MODIFICATION_NODE_POOL_SIZE,
            modification_list_pool_size: DEFAULT_MODIFICATION_LIST_POOL_SIZE,
            tcp_common_pool_size: DEFAULT_TCP_COMMON_POOL_SIZE,
            retransmit_limit: DEFAULT_RETRANSMIT_LIMIT,
            max_rto: DEFAULT_MAX_RTO,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            tx_checksum_offload: false,
        }
    }
}
