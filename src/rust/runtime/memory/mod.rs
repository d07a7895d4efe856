// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod memory_pool;
mod packet_buffer;

//==============================================================================
// Exports
//==============================================================================

pub use self::{memory_pool::MemoryPool, packet_buffer::PacketBuffer};
