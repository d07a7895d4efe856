// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(clippy::all))]

#[macro_use]
extern crate log;

pub mod middlebox;
pub mod runtime;

pub use crate::{
    middlebox::{
        fcb::{ClosingState, FlowControlBlock, FlowDirection, FlowId},
        flow_buffer::{FlowBuffer, FlowSearchResult},
        packet::PacketView,
        seq_number::SeqNumber,
        stack_hook::StackHook,
        tcp_in::TcpIn,
        tcp_out::TcpOut,
        ElementRegistry,
    },
    runtime::{fail::Fail, memory::PacketBuffer, network::config::MiddleboxConfig},
};
