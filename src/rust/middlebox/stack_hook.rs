// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// The edit surface the TCP layer exposes to the elements stacked above it. Upper elements never touch sequence
// numbers or checksums: they ask for bytes to be removed or inserted at positions relative to the application
// content, for more data to be elicited from the sender, or for the connection to be closed, and the TCP layer keeps
// its journals consistent underneath.
//
// Between an upper element and the TCP layer there may be intermediate handlers. Each handler sees the upcall and
// decides what to pass along; the default is to forward unchanged.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    middlebox::{fcb::FlowControlBlock, packet::PacketView},
    runtime::fail::Fail,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// The upcall surface of the TCP layer. Positions are relative to the start of the application content (the
/// content-offset annotation), so callers can treat everything before it as opaque.
pub trait StackHook {
    /// Removes `length` bytes of content at `position`.
    fn remove_bytes(
        &mut self,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        position: u32,
        length: u32,
    ) -> Result<(), Fail>;

    /// Opens `length` bytes of room at `position`. The caller fills the gap.
    fn insert_bytes(
        &mut self,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        position: u32,
        length: u32,
    ) -> Result<(), Fail>;

    /// Acknowledges `packet` on behalf of the receiver so its sender keeps transmitting.
    fn request_more_packets(&mut self, fcb: &mut FlowControlBlock, packet: &PacketView) -> Result<(), Fail>;

    /// Starts closing the connection on `packet`'s direction; with `both_sides`, also synthesizes a closing packet
    /// toward the sender.
    fn close_connection(
        &mut self,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        graceful: bool,
        both_sides: bool,
    ) -> Result<(), Fail>;

    /// Flags `packet` for checksum recomputation at emission.
    fn set_packet_dirty(&mut self, fcb: &mut FlowControlBlock, packet: &mut PacketView);
}

/// An element inserted between upper elements and the TCP layer. Every method defaults to forward-and-continue.
pub trait StackHandler {
    fn remove_bytes(
        &mut self,
        next: &mut dyn StackHook,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        position: u32,
        length: u32,
    ) -> Result<(), Fail> {
        next.remove_bytes(fcb, packet, position, length)
    }

    fn insert_bytes(
        &mut self,
        next: &mut dyn StackHook,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        position: u32,
        length: u32,
    ) -> Result<(), Fail> {
        next.insert_bytes(fcb, packet, position, length)
    }

    fn request_more_packets(
        &mut self,
        next: &mut dyn StackHook,
        fcb: &mut FlowControlBlock,
        packet: &PacketView,
    ) -> Result<(), Fail> {
        next.request_more_packets(fcb, packet)
    }

    fn close_connection(
        &mut self,
        next: &mut dyn StackHook,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        graceful: bool,
        both_sides: bool,
    ) -> Result<(), Fail> {
        next.close_connection(fcb, packet, graceful, both_sides)
    }

    fn set_packet_dirty(&mut self, next: &mut dyn StackHook, fcb: &mut FlowControlBlock, packet: &mut PacketView) {
        next.set_packet_dirty(fcb, packet)
    }
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// A chain of handlers ending at the TCP layer. Upcalls traverse the handlers in order; each handler may observe,
/// rewrite or swallow them before they reach the terminal hook.
pub struct StackChain<'a> {
    handlers: &'a mut [Box<dyn StackHandler>],
    terminal: &'a mut dyn StackHook,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<'a> StackChain<'a> {
    /// Builds a chain over `handlers` terminating at `terminal`.
    pub fn new(handlers: &'a mut [Box<dyn StackHandler>], terminal: &'a mut dyn StackHook) -> Self {
        Self { handlers, terminal }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl StackHook for StackChain<'_> {
    fn remove_bytes(
        &mut self,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        position: u32,
        length: u32,
    ) -> Result<(), Fail> {
        match self.handlers.split_first_mut() {
            Some((head, rest)) => {
                let mut tail: StackChain = StackChain::new(rest, &mut *self.terminal);
                head.remove_bytes(&mut tail, fcb, packet, position, length)
            },
            None => self.terminal.remove_bytes(fcb, packet, position, length),
        }
    }

    fn insert_bytes(
        &mut self,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        position: u32,
        length: u32,
    ) -> Result<(), Fail> {
        match self.handlers.split_first_mut() {
            Some((head, rest)) => {
                let mut tail: StackChain = StackChain::new(rest, &mut *self.terminal);
                head.insert_bytes(&mut tail, fcb, packet, position, length)
            },
            None => self.terminal.insert_bytes(fcb, packet, position, length),
        }
    }

    fn request_more_packets(&mut self, fcb: &mut FlowControlBlock, packet: &PacketView) -> Result<(), Fail> {
        match self.handlers.split_first_mut() {
            Some((head, rest)) => {
                let mut tail: StackChain = StackChain::new(rest, &mut *self.terminal);
                head.request_more_packets(&mut tail, fcb, packet)
            },
            None => self.terminal.request_more_packets(fcb, packet),
        }
    }

    fn close_connection(
        &mut self,
        fcb: &mut FlowControlBlock,
        packet: &mut PacketView,
        graceful: bool,
        both_sides: bool,
    ) -> Result<(), Fail> {
        match self.handlers.split_first_mut() {
            Some((head, rest)) => {
                let mut tail: StackChain = StackChain::new(rest, &mut *self.terminal);
                head.close_connection(&mut tail, fcb, packet, graceful, both_sides)
            },
            None => self.terminal.close_connection(fcb, packet, graceful, both_sides),
        }
    }

    fn set_packet_dirty(&mut self, fcb: &mut FlowControlBlock, packet: &mut PacketView) {
        match self.handlers.split_first_mut() {
            Some((head, rest)) => {
                let mut tail: StackChain = StackChain::new(rest, &mut *self.terminal);
                head.set_packet_dirty(&mut tail, fcb, packet)
            },
            None => self.terminal.set_packet_dirty(fcb, packet),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
