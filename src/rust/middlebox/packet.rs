// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// In-place accessors over a packet buffer holding an IPv4 header, a TCP header and a payload. Unlike an endpoint
// stack, the interception pipeline never strips headers: packets are rewritten where they sit and forwarded, so all
// field reads and writes are performed at their wire offsets. The view also carries the two annotations the pipeline
// exchanges with the surrounding framework: the content offset (first byte upper elements treat as application
// payload) and the dirty bit (checksums must be recomputed before the packet is emitted).

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    middlebox::seq_number::SeqNumber,
    runtime::{fail::Fail, memory::PacketBuffer},
};
use ::byteorder::{ByteOrder, NetworkEndian};
use ::libc::{EBADMSG, ENOTSUP};
use ::std::net::Ipv4Addr;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Size of an IPv4 header without options (in bytes).
pub const IPV4_HEADER_MIN_SIZE: usize = 20;

/// Size of a TCP header without options (in bytes).
pub const TCP_HEADER_MIN_SIZE: usize = 20;

/// Version number for IPv4.
const IPV4_VERSION: u8 = 4;

/// Protocol number for TCP.
const IPPROTO_TCP: u8 = 6;

/// Default time to live for forged packets.
const DEFAULT_TTL: u8 = 64;

/// FIN flag.
pub const TCP_FLAG_FIN: u8 = 1 << 0;
/// SYN flag.
pub const TCP_FLAG_SYN: u8 = 1 << 1;
/// RST flag.
pub const TCP_FLAG_RST: u8 = 1 << 2;
/// PSH flag.
pub const TCP_FLAG_PSH: u8 = 1 << 3;
/// ACK flag.
pub const TCP_FLAG_ACK: u8 = 1 << 4;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A writable view over one IPv4+TCP packet.
#[derive(Clone, Debug)]
pub struct PacketView {
    /// The packet bytes, starting at the IPv4 header.
    buf: PacketBuffer,

    /// Offset of the first application-payload byte, as seen by upper elements.
    content_offset: u16,

    /// Whether header fields or payload bytes have changed since reception.
    dirty: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl PacketView {
    /// Wraps a buffer, checking that it plausibly holds an IPv4+TCP packet.
    pub fn attach(buf: PacketBuffer) -> Result<Self, Fail> {
        if buf.len() < IPV4_HEADER_MIN_SIZE + TCP_HEADER_MIN_SIZE {
            return Err(Fail::new(EBADMSG, "packet too small for IPv4+TCP headers"));
        }
        if buf[0] >> 4 != IPV4_VERSION {
            return Err(Fail::new(ENOTSUP, "unsupported IP version"));
        }
        if buf[9] != IPPROTO_TCP {
            return Err(Fail::new(ENOTSUP, "not a TCP segment"));
        }

        let view: Self = Self {
            buf,
            content_offset: 0,
            dirty: false,
        };

        let ip_header_len: usize = view.ip_header_len();
        if ip_header_len < IPV4_HEADER_MIN_SIZE || view.buf.len() < ip_header_len + TCP_HEADER_MIN_SIZE {
            return Err(Fail::new(EBADMSG, "bad IPv4 header length"));
        }
        if (view.total_length() as usize) > view.buf.len() {
            return Err(Fail::new(EBADMSG, "IPv4 total length past end of buffer"));
        }
        if view.payload_offset() > view.total_length() as usize {
            return Err(Fail::new(EBADMSG, "bad TCP data offset"));
        }

        Ok(view)
    }

    /// Length of the IPv4 header (in bytes).
    pub fn ip_header_len(&self) -> usize {
        ((self.buf[0] & 0xf) as usize) << 2
    }

    /// IPv4 total length field.
    pub fn total_length(&self) -> u16 {
        NetworkEndian::read_u16(&self.buf[2..4])
    }

    fn set_total_length(&mut self, total_length: u16) {
        NetworkEndian::write_u16(&mut self.buf[2..4], total_length);
    }

    /// Source IPv4 address.
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[12], self.buf[13], self.buf[14], self.buf[15])
    }

    /// Destination IPv4 address.
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[16], self.buf[17], self.buf[18], self.buf[19])
    }

    /// Offset of the TCP header within the packet.
    fn tcp_offset(&self) -> usize {
        self.ip_header_len()
    }

    /// Length of the TCP header, including options (in bytes).
    pub fn tcp_header_len(&self) -> usize {
        let t: usize = self.tcp_offset();
        ((self.buf[t + 12] >> 4) as usize) << 2
    }

    /// Source port.
    pub fn src_port(&self) -> u16 {
        let t: usize = self.tcp_offset();
        NetworkEndian::read_u16(&self.buf[t..t + 2])
    }

    /// Destination port.
    pub fn dst_port(&self) -> u16 {
        let t: usize = self.tcp_offset();
        NetworkEndian::read_u16(&self.buf[t + 2..t + 4])
    }

    /// Sequence number.
    pub fn seq_num(&self) -> SeqNumber {
        let t: usize = self.tcp_offset();
        SeqNumber::from(NetworkEndian::read_u32(&self.buf[t + 4..t + 8]))
    }

    /// Rewrites the sequence number.
    pub fn set_seq_num(&mut self, seq: SeqNumber) {
        let t: usize = self.tcp_offset();
        NetworkEndian::write_u32(&mut self.buf[t + 4..t + 8], seq.into());
    }

    /// Acknowledgment number.
    pub fn ack_num(&self) -> SeqNumber {
        let t: usize = self.tcp_offset();
        SeqNumber::from(NetworkEndian::read_u32(&self.buf[t + 8..t + 12]))
    }

    /// Rewrites the acknowledgment number.
    pub fn set_ack_num(&mut self, ack: SeqNumber) {
        let t: usize = self.tcp_offset();
        NetworkEndian::write_u32(&mut self.buf[t + 8..t + 12], ack.into());
    }

    /// The TCP flag byte.
    pub fn flags(&self) -> u8 {
        let t: usize = self.tcp_offset();
        self.buf[t + 13]
    }

    /// Sets additional TCP flags, keeping the ones already present.
    pub fn add_flags(&mut self, flags: u8) {
        let t: usize = self.tcp_offset();
        self.buf[t + 13] |= flags;
    }

    /// Whether the SYN flag is set.
    pub fn is_syn(&self) -> bool {
        self.flags() & TCP_FLAG_SYN != 0
    }

    /// Whether the ACK flag is set.
    pub fn is_ack(&self) -> bool {
        self.flags() & TCP_FLAG_ACK != 0
    }

    /// Whether the FIN flag is set.
    pub fn is_fin(&self) -> bool {
        self.flags() & TCP_FLAG_FIN != 0
    }

    /// Whether the RST flag is set.
    pub fn is_rst(&self) -> bool {
        self.flags() & TCP_FLAG_RST != 0
    }

    /// Whether the packet is an ACK carrying no payload and no other flags, i.e. no new information besides the
    /// acknowledgment itself.
    pub fn is_pure_ack(&self) -> bool {
        self.payload_len() == 0 && self.flags() == TCP_FLAG_ACK
    }

    /// Receive window field.
    pub fn window_size(&self) -> u16 {
        let t: usize = self.tcp_offset();
        NetworkEndian::read_u16(&self.buf[t + 14..t + 16])
    }

    /// Offset of the TCP payload within the packet.
    pub fn payload_offset(&self) -> usize {
        self.ip_header_len() + self.tcp_header_len()
    }

    /// Length of the TCP payload, from the IPv4 total length field.
    pub fn payload_len(&self) -> usize {
        self.total_length() as usize - self.payload_offset()
    }

    /// The TCP payload.
    pub fn payload(&self) -> &[u8] {
        let off: usize = self.payload_offset();
        &self.buf[off..off + self.payload_len()]
    }

    /// The sequence number of the byte that follows this segment. SYN and FIN each consume one number.
    pub fn next_seq_num(&self) -> SeqNumber {
        let mut next: SeqNumber = self.seq_num() + SeqNumber::from(self.payload_len() as u32);
        if self.is_syn() || self.is_fin() {
            next = next + SeqNumber::from(1);
        }
        next
    }

    /// Offset of the first application-payload byte, as seen by upper elements.
    pub fn content_offset(&self) -> u16 {
        self.content_offset
    }

    /// Sets the content-offset annotation.
    pub fn set_content_offset(&mut self, offset: u16) {
        self.content_offset = offset;
    }

    /// The application payload, starting at the content offset.
    pub fn content(&self) -> &[u8] {
        let off: usize = self.content_offset as usize;
        &self.buf[off..self.total_length() as usize]
    }

    /// The whole packet as it would appear on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.total_length() as usize]
    }

    /// Whether the packet must have its checksums recomputed before emission.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flags the packet for checksum recomputation at emission.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Ensures exclusive ownership of the underlying buffer.
    pub fn uniquify(&mut self) {
        self.buf.uniquify();
    }

    /// Whether the underlying buffer supports checksum offload.
    pub fn offload_capable(&self) -> bool {
        self.buf.offload_capable()
    }

    /// Records the checksum-offload capability of the underlying buffer.
    pub fn set_offload_capable(&mut self, capable: bool) {
        self.buf.set_offload_capable(capable);
    }

    /// Removes `length` payload bytes at absolute packet offset `position`, shifting the tail of the packet over the
    /// hole and shrinking the buffer.
    pub fn remove_payload_bytes(&mut self, position: usize, length: usize) -> Result<(), Fail> {
        if position < self.payload_offset() {
            return Err(Fail::new(EBADMSG, "edit position inside packet headers"));
        }
        self.buf.close_gap(position, length)?;
        let total_length: u16 = self.total_length() - length as u16;
        self.set_total_length(total_length);
        self.dirty = true;
        Ok(())
    }

    /// Opens a hole of `length` bytes at absolute packet offset `position`, growing the buffer and shifting the tail
    /// of the packet forward. The caller fills the hole.
    pub fn insert_payload_bytes(&mut self, position: usize, length: usize) -> Result<(), Fail> {
        if position < self.payload_offset() {
            return Err(Fail::new(EBADMSG, "edit position inside packet headers"));
        }
        self.buf.open_gap(position, length)?;
        let total_length: u16 = self.total_length() + length as u16;
        self.set_total_length(total_length);
        self.dirty = true;
        Ok(())
    }

    /// Writes `bytes` at absolute packet offset `position`.
    pub fn write_bytes(&mut self, position: usize, bytes: &[u8]) {
        self.buf[position..position + bytes.len()].copy_from_slice(bytes);
        self.dirty = true;
    }

    /// Reads the byte at absolute packet offset `position`.
    pub fn byte_at(&self, position: usize) -> u8 {
        self.buf[position]
    }

    /// Recomputes the IPv4 header checksum and the TCP checksum (software path).
    pub fn compute_checksums(&mut self) {
        // IPv4 header checksum.
        let ip_header_len: usize = self.ip_header_len();
        self.buf[10] = 0;
        self.buf[11] = 0;
        let ip_checksum: u16 = ones_complement_sum(0, &self.buf[..ip_header_len]);
        NetworkEndian::write_u16(&mut self.buf[10..12], ip_checksum);

        // TCP checksum, over the pseudo header, the TCP header and the payload.
        let t: usize = self.tcp_offset();
        self.buf[t + 16] = 0;
        self.buf[t + 17] = 0;
        let checksum: u16 = self.tcp_checksum();
        NetworkEndian::write_u16(&mut self.buf[t + 16..t + 18], checksum);
        self.dirty = false;
    }

    /// Clears both checksum fields and leaves them for the NIC to fill in (hardware path).
    pub fn prepare_checksum_offload(&mut self) {
        let t: usize = self.tcp_offset();
        self.buf[10] = 0;
        self.buf[11] = 0;
        self.buf[t + 16] = 0;
        self.buf[t + 17] = 0;
        self.dirty = false;
    }

    /// Computes the TCP checksum of the packet as it currently stands, assuming the checksum field is zero.
    fn tcp_checksum(&self) -> u16 {
        let t: usize = self.tcp_offset();
        let end: usize = self.total_length() as usize;
        let segment_len: u32 = (end - t) as u32;

        // Pseudo header: source address, destination address, zero-padded protocol number, TCP segment length.
        let mut state: u32 = 0;
        state += NetworkEndian::read_u16(&self.buf[12..14]) as u32;
        state += NetworkEndian::read_u16(&self.buf[14..16]) as u32;
        state += NetworkEndian::read_u16(&self.buf[16..18]) as u32;
        state += NetworkEndian::read_u16(&self.buf[18..20]) as u32;
        state += IPPROTO_TCP as u32;
        state += segment_len;

        ones_complement_sum(state, &self.buf[t..end])
    }

    /// Forges a minimal IPv4+TCP packet (no options, no payload) with the given addressing, numbers and flags.
    pub fn forge(
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        seq: SeqNumber,
        ack: SeqNumber,
        window_size: u16,
        flags: u8,
    ) -> Self {
        let total_length: usize = IPV4_HEADER_MIN_SIZE + TCP_HEADER_MIN_SIZE;
        let mut buf: PacketBuffer = PacketBuffer::alloc(total_length);

        // IPv4 header.
        buf[0] = (IPV4_VERSION << 4) | ((IPV4_HEADER_MIN_SIZE >> 2) as u8);
        NetworkEndian::write_u16(&mut buf[2..4], total_length as u16);
        buf[8] = DEFAULT_TTL;
        buf[9] = IPPROTO_TCP;
        buf[12..16].copy_from_slice(&src_addr.octets());
        buf[16..20].copy_from_slice(&dst_addr.octets());

        // TCP header.
        let t: usize = IPV4_HEADER_MIN_SIZE;
        NetworkEndian::write_u16(&mut buf[t..t + 2], src_port);
        NetworkEndian::write_u16(&mut buf[t + 2..t + 4], dst_port);
        NetworkEndian::write_u32(&mut buf[t + 4..t + 8], seq.into());
        NetworkEndian::write_u32(&mut buf[t + 8..t + 12], ack.into());
        buf[t + 12] = ((TCP_HEADER_MIN_SIZE >> 2) as u8) << 4;
        buf[t + 13] = flags;
        NetworkEndian::write_u16(&mut buf[t + 14..t + 16], window_size);

        let mut view: Self = Self {
            buf,
            content_offset: total_length as u16,
            dirty: false,
        };
        view.compute_checksums();
        view
    }

    /// Forges a RST answering the given packet, mirroring its addressing and swapping its sequence and
    /// acknowledgment numbers.
    pub fn forge_rst(packet: &PacketView) -> Self {
        Self::forge(
            packet.dst_addr(),
            packet.src_addr(),
            packet.dst_port(),
            packet.src_port(),
            packet.ack_num(),
            packet.seq_num(),
            0,
            TCP_FLAG_RST,
        )
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Folds `bytes` into a running ones-complement sum and returns the complemented 16-bit result. The data may have an
/// odd number of bytes, in which case the last byte is padded with zero.
fn ones_complement_sum(initial_state: u32, bytes: &[u8]) -> u16 {
    let mut state: u32 = initial_state;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in chunks.by_ref() {
        state += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&b) = chunks.remainder().first() {
        state += u16::from_be_bytes([b, 0]) as u32;
    }

    while state > 0xFFFF {
        state -= 0xFFFF;
    }
    !state as u16
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
