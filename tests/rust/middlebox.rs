// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// End-to-end scenarios: complete TCP connections driven through both directions of the interception pipeline, with
// literal sequence and acknowledgment numbers checked on every emitted packet.

use ::anyhow::Result;
use ::midstack::{
    middlebox::{
        fcb::{ClosingState, FlowControlBlock, FlowDirection},
        packet::{PacketView, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_SYN},
        stack_hook::StackHook,
        tcp_in::TcpIn,
        tcp_out::TcpOut,
        ElementRegistry,
    },
    runtime::network::config::MiddleboxConfig,
    SeqNumber,
};
use ::std::{
    cell::RefCell,
    net::Ipv4Addr,
    rc::Rc,
    time::{Duration, Instant},
};

//======================================================================================================================
// Harness
//======================================================================================================================

const CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SERVER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const CLIENT_PORT: u16 = 12345;
const SERVER_PORT: u16 = 80;

/// What came out of the middlebox for one packet put in: the packet emitted on the forward wire (if any), and the
/// packets the middlebox itself originated toward the sender.
struct Forwarded {
    out: Option<PacketView>,
    reverse: Vec<PacketView>,
}

/// A two-direction middlebox deployment plus the per-direction flow state of one connection.
struct Middlebox {
    registry: ElementRegistry,
    in0: Rc<RefCell<TcpIn>>,
    out0: Rc<RefCell<TcpOut>>,
    in1: Rc<RefCell<TcpIn>>,
    out1: Rc<RefCell<TcpOut>>,
    fcb0: FlowControlBlock,
    fcb1: FlowControlBlock,
    now: Instant,
}

impl Middlebox {
    fn new() -> Self {
        Self::with_config(MiddleboxConfig::default())
    }

    fn with_config(config: MiddleboxConfig) -> Self {
        let mut registry: ElementRegistry = ElementRegistry::new(config);
        let out0: Rc<RefCell<TcpOut>> = registry.create_tcp_out("out0", 0).unwrap();
        let out1: Rc<RefCell<TcpOut>> = registry.create_tcp_out("out1", 1).unwrap();
        let in0: Rc<RefCell<TcpIn>> = registry.create_tcp_in("in0", 0, "out0", "in1").unwrap();
        let in1: Rc<RefCell<TcpIn>> = registry.create_tcp_in("in1", 1, "out1", "in0").unwrap();
        registry.finalize().unwrap();
        Self {
            registry,
            in0,
            out0,
            in1,
            out1,
            fcb0: FlowControlBlock::new(),
            fcb1: FlowControlBlock::new(),
            now: Instant::now(),
        }
    }

    fn advance(&mut self, delta: Duration) {
        self.now += delta;
    }

    /// Runs a packet through one direction of the pipeline, applying `edit` between TcpIn and TcpOut the way an
    /// upper element would.
    fn forward_edit<F>(&mut self, direction: u8, pkt: PacketView, edit: F) -> Forwarded
    where
        F: FnOnce(&mut TcpIn, &mut FlowControlBlock, &mut PacketView),
    {
        let now: Instant = self.now;
        let (in_rc, out_rc, fcb) = if direction == 0 {
            (self.in0.clone(), self.out0.clone(), &mut self.fcb0)
        } else {
            (self.in1.clone(), self.out1.clone(), &mut self.fcb1)
        };

        let mut tcp_in = in_rc.borrow_mut();
        let out: Option<PacketView> = match tcp_in.process(fcb, pkt, now) {
            Some(mut forwarded) => {
                edit(&mut tcp_in, fcb, &mut forwarded);
                drop(tcp_in);
                Some(out_rc.borrow_mut().process(fcb, forwarded, now).expect("emit should succeed"))
            },
            None => {
                drop(tcp_in);
                None
            },
        };
        let reverse: Vec<PacketView> = out_rc.borrow_mut().take_pending();
        Forwarded { out, reverse }
    }

    fn forward(&mut self, direction: u8, pkt: PacketView) -> Forwarded {
        self.forward_edit(direction, pkt, |_, _, _| ())
    }

    /// Runs the three-way handshake: SYN(100), SYN+ACK(900, 101), ACK(101, 901).
    fn handshake(&mut self) {
        let f: Forwarded = self.forward(0, client(100, 0, TCP_FLAG_SYN, b""));
        assert_eq!(f.out.as_ref().unwrap().seq_num(), SeqNumber::from(100));

        let f: Forwarded = self.forward(1, server(900, 101, TCP_FLAG_SYN | TCP_FLAG_ACK, b""));
        let syn_ack: &PacketView = f.out.as_ref().unwrap();
        assert_eq!(syn_ack.seq_num(), SeqNumber::from(900));
        assert_eq!(syn_ack.ack_num(), SeqNumber::from(101));

        let f: Forwarded = self.forward(0, client(101, 901, TCP_FLAG_ACK, b""));
        assert_eq!(f.out.as_ref().unwrap().ack_num(), SeqNumber::from(901));
    }

    fn closing_state(&self, direction: u8) -> ClosingState {
        let d: FlowDirection = FlowDirection::new(direction).unwrap();
        self.fcb0
            .tcp_common()
            .expect("flow should be bound")
            .borrow()
            .closing_state(d)
    }
}

fn packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> PacketView {
    let mut pkt: PacketView = PacketView::forge(
        src,
        dst,
        sport,
        dport,
        SeqNumber::from(seq),
        SeqNumber::from(ack),
        8192,
        flags,
    );
    if !payload.is_empty() {
        let offset: usize = pkt.payload_offset();
        pkt.insert_payload_bytes(offset, payload.len()).unwrap();
        pkt.write_bytes(offset, payload);
        pkt.compute_checksums();
    }
    pkt
}

fn client(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> PacketView {
    packet(CLIENT_ADDR, SERVER_ADDR, CLIENT_PORT, SERVER_PORT, seq, ack, flags, payload)
}

fn server(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> PacketView {
    packet(SERVER_ADDR, CLIENT_ADDR, SERVER_PORT, CLIENT_PORT, seq, ack, flags, payload)
}

//======================================================================================================================
// Scenarios
//======================================================================================================================

/// Scenario 1: a connection nothing touches passes through byte for byte.
#[test]
fn passthrough() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();

    let exchange: Vec<(u8, PacketView)> = vec![
        (0, client(100, 0, TCP_FLAG_SYN, b"")),
        (1, server(900, 101, TCP_FLAG_SYN | TCP_FLAG_ACK, b"")),
        (0, client(101, 901, TCP_FLAG_ACK, b"")),
        (0, client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello")),
        (1, server(901, 106, TCP_FLAG_ACK, b"")),
        (0, client(106, 901, TCP_FLAG_FIN | TCP_FLAG_ACK, b"")),
        (1, server(901, 107, TCP_FLAG_FIN | TCP_FLAG_ACK, b"")),
    ];

    for (direction, pkt) in exchange {
        let original: Vec<u8> = pkt.as_bytes().to_vec();
        let f: Forwarded = mb.forward(direction, pkt);
        let emitted: PacketView = f.out.expect("packet should pass through");
        assert_eq!(emitted.as_bytes(), &original[..]);
        assert!(f.reverse.is_empty());
    }
    Ok(())
}

/// Scenario 2: a six-byte insertion in the client's stream; the server's acknowledgment is mapped back so the
/// client sees exactly its own five bytes acknowledged.
#[test]
fn single_insertion_forward_direction() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    let f: Forwarded = mb.forward_edit(
        0,
        client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"),
        |tcp_in, fcb, pkt| {
            tcp_in.insert_bytes(fcb, pkt, 5, 6).unwrap();
            let absolute: usize = pkt.content_offset() as usize + 5;
            pkt.write_bytes(absolute, b" world");
        },
    );
    let emitted: PacketView = f.out.expect("edited packet should be emitted");
    assert_eq!(emitted.seq_num(), SeqNumber::from(101));
    assert_eq!(emitted.payload(), b"hello world");
    assert!(!emitted.is_dirty(), "checksums should have been finalized");

    // The server acknowledges all eleven rewritten bytes; the client must see 106.
    let f: Forwarded = mb.forward(1, server(901, 112, TCP_FLAG_ACK, b""));
    let toward_client: PacketView = f.out.expect("acknowledgment should pass through");
    assert_eq!(toward_client.ack_num(), SeqNumber::from(106));
    Ok(())
}

/// Scenario 3: a deletion spanning a segment boundary, journaled per spanned segment; the two acknowledgments map
/// across the deleted gap.
#[test]
fn deletion_spanning_segment_boundary() -> Result<()> {
    use ::midstack::FlowBuffer;
    use ::midstack::middlebox::flow_buffer::FlowSearchResult;

    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    let mut buffer: FlowBuffer = FlowBuffer::new();
    let now: Instant = mb.now;

    let mut in0 = mb.in0.borrow_mut();
    let first: PacketView = in0
        .process(&mut mb.fcb0, client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello "), now)
        .expect("first segment should pass");
    buffer.enqueue(first);

    // The pattern could still complete in the next segment.
    assert_eq!(buffer.search_in_flow(b"lo wo"), FlowSearchResult::Partial);

    let second: PacketView = in0
        .process(&mut mb.fcb0, client(107, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"world"), now)
        .expect("second segment should pass");
    buffer.enqueue(second);

    let outcome: FlowSearchResult = buffer.remove_in_flow(b"lo wo", &mut mb.fcb0, &mut *in0).unwrap();
    assert_eq!(outcome, FlowSearchResult::Found);
    drop(in0);

    let mut emitted: Vec<PacketView> = Vec::new();
    for pkt in buffer.dequeue_all() {
        emitted.push(mb.out0.borrow_mut().process(&mut mb.fcb0, pkt, now).unwrap());
    }
    assert_eq!(emitted[0].seq_num(), SeqNumber::from(101));
    assert_eq!(emitted[0].payload(), b"hel");
    assert_eq!(emitted[1].seq_num(), SeqNumber::from(104));
    assert_eq!(emitted[1].payload(), b"rld");

    // Acknowledging "hel" covers the deleted bytes up to 107; acknowledging "rld" covers everything.
    let f: Forwarded = mb.forward(1, server(901, 104, TCP_FLAG_ACK, b""));
    assert_eq!(f.out.expect("ack should pass").ack_num(), SeqNumber::from(107));

    let f: Forwarded = mb.forward(1, server(901, 107, TCP_FLAG_ACK, b""));
    assert_eq!(f.out.expect("ack should pass").ack_num(), SeqNumber::from(112));
    Ok(())
}

/// Scenario 4: the server's acknowledgment is lost before reaching the client, the client retransmits, and the
/// middlebox answers on the server's behalf instead of forwarding the stale copy.
#[test]
fn lost_ack_recovery() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    let f: Forwarded = mb.forward_edit(
        0,
        client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"),
        |tcp_in, fcb, pkt| {
            tcp_in.insert_bytes(fcb, pkt, 5, 6).unwrap();
            let absolute: usize = pkt.content_offset() as usize + 5;
            pkt.write_bytes(absolute, b" world");
        },
    );
    assert!(f.out.is_some());

    // The server acknowledges; the rewritten acknowledgment (106) is emitted toward the client but lost on the way.
    let f: Forwarded = mb.forward(1, server(901, 112, TCP_FLAG_ACK, b""));
    assert_eq!(f.out.expect("ack should pass").ack_num(), SeqNumber::from(106));

    // The client retransmits. The copy is consumed and the acknowledgment is forged anew.
    let f: Forwarded = mb.forward(0, client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"));
    assert!(f.out.is_none(), "stale copy must not be forwarded");
    assert_eq!(f.reverse.len(), 1);
    let resent: &PacketView = &f.reverse[0];
    assert_eq!(resent.src_addr(), SERVER_ADDR);
    assert_eq!(resent.dst_addr(), CLIENT_ADDR);
    assert_eq!(resent.seq_num(), SeqNumber::from(901));
    assert_eq!(resent.ack_num(), SeqNumber::from(106));
    assert!(resent.is_ack());

    assert_eq!(mb.in0.borrow().counters().late_data_reacks, 1);
    Ok(())
}

/// A retransmission that fires before any acknowledgment comes back: the sender's timer re-sends its original,
/// unedited bytes, and the middlebox must put the edited form of the segment back on the wire instead.
#[test]
fn unacked_retransmission_replays_edits() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    let f: Forwarded = mb.forward_edit(
        0,
        client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"),
        |tcp_in, fcb, pkt| {
            tcp_in.insert_bytes(fcb, pkt, 5, 6).unwrap();
            let absolute: usize = pkt.content_offset() as usize + 5;
            pkt.write_bytes(absolute, b" world");
        },
    );
    let first: PacketView = f.out.expect("edited packet should be emitted");
    assert_eq!(first.payload(), b"hello world");
    assert!(mb.fcb0.has_modification_list(SeqNumber::from(101)));

    // No acknowledgment has come back, so the already-acked check cannot catch the copy; it reaches the outbound
    // element carrying the original five bytes.
    let f: Forwarded = mb.forward(0, client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"));
    let second: PacketView = f.out.expect("retransmission should be re-emitted");
    assert_eq!(second.payload(), b"hello world");
    assert_eq!(second.as_bytes(), first.as_bytes());

    {
        let common = mb.fcb0.tcp_common().unwrap().borrow();
        let d: FlowDirection = FlowDirection::new(0).unwrap();
        // The replay re-uses the shadowed copy rather than shadowing a second entry, and leaves a watermark.
        assert_eq!(common.retransmission(d).queue_len(), 1);
        assert_eq!(common.maintainer(d).retransmitted_seq(), Some(SeqNumber::from(101)));
    }

    // The server's eventual acknowledgment of the eleven emitted bytes still maps back to the client's five.
    let f: Forwarded = mb.forward(1, server(901, 112, TCP_FLAG_ACK, b""));
    assert_eq!(f.out.expect("ack should pass").ack_num(), SeqNumber::from(106));
    Ok(())
}

/// Scenario 5: an upper element closes both sides gracefully: the forwarded packet grows a FIN toward the server
/// and a FIN+ACK is synthesized toward the client with mapped numbering.
#[test]
fn graceful_close_from_upper_element() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    let f: Forwarded = mb.forward_edit(
        0,
        client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"bye"),
        |tcp_in, fcb, pkt| {
            tcp_in.close_connection(fcb, pkt, true, true).unwrap();
        },
    );

    let toward_server: PacketView = f.out.expect("closing packet should be forwarded");
    assert!(toward_server.is_fin());
    assert_eq!(toward_server.seq_num(), SeqNumber::from(101));
    assert_eq!(toward_server.payload(), b"bye");

    // The synthesized FIN+ACK toward the client acknowledges the payload and the FIN.
    assert_eq!(f.reverse.len(), 1);
    let toward_client: &PacketView = &f.reverse[0];
    assert!(toward_client.is_fin() && toward_client.is_ack());
    assert_eq!(toward_client.src_addr(), SERVER_ADDR);
    assert_eq!(toward_client.seq_num(), SeqNumber::from(901));
    assert_eq!(toward_client.ack_num(), SeqNumber::from(105));

    assert_eq!(mb.closing_state(0), ClosingState::BeingClosedGraceful);
    assert_eq!(mb.closing_state(1), ClosingState::ClosedGraceful);

    // Data the client keeps sending while the close drains is acknowledged on the server's behalf and discarded.
    let f: Forwarded = mb.forward(0, client(105, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"more"));
    assert!(f.out.is_none());
    assert_eq!(f.reverse.len(), 1);
    assert_eq!(f.reverse[0].seq_num(), SeqNumber::from(901));
    assert_eq!(f.reverse[0].ack_num(), SeqNumber::from(109));
    assert_eq!(mb.in0.borrow().counters().closing_gate_drops, 1);

    // The server acknowledging the FIN finishes the client direction's close and drains the shadow queue.
    let f: Forwarded = mb.forward(1, server(901, 105, TCP_FLAG_ACK, b""));
    assert!(f.out.is_none(), "the closing direction consumes the acknowledgment");
    assert_eq!(mb.closing_state(0), ClosingState::ClosedGraceful);

    // Both directions terminal, nothing in flight: the flow can be released and its record recycled.
    let capacity: usize = mb.registry.pools().borrow().tcp_commons.capacity();
    assert!(mb.in0.borrow_mut().maybe_release(&mut mb.fcb0));
    assert!(mb.in1.borrow_mut().maybe_release(&mut mb.fcb1));
    assert_eq!(mb.registry.pools().borrow().tcp_commons.available(), capacity);
    Ok(())
}

/// An upper element closes both sides abortively: the forwarded packet grows a RST and a best-effort RST+ACK is
/// synthesized toward the client.
#[test]
fn abortive_close_from_upper_element() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    let f: Forwarded = mb.forward_edit(
        0,
        client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"die"),
        |tcp_in, fcb, pkt| {
            tcp_in.close_connection(fcb, pkt, false, true).unwrap();
        },
    );

    let toward_server: PacketView = f.out.expect("closing packet should be forwarded");
    assert!(toward_server.is_rst());

    assert_eq!(f.reverse.len(), 1);
    let toward_client: &PacketView = &f.reverse[0];
    assert!(toward_client.is_rst() && toward_client.is_ack());
    assert_eq!(toward_client.dst_addr(), CLIENT_ADDR);

    assert_eq!(mb.closing_state(0), ClosingState::BeingClosedUngraceful);
    assert_eq!(mb.closing_state(1), ClosingState::ClosedUngraceful);
    Ok(())
}

/// An upper element that consumed a packet asks the middlebox to acknowledge it so the sender keeps transmitting.
#[test]
fn request_more_packets_forges_an_ack() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    let f: Forwarded = mb.forward_edit(
        0,
        client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hold"),
        |tcp_in, fcb, pkt| {
            tcp_in.request_more_packets(fcb, pkt).unwrap();
        },
    );
    assert!(f.out.is_some());

    assert_eq!(f.reverse.len(), 1);
    let ack: &PacketView = &f.reverse[0];
    assert!(ack.is_ack());
    assert_eq!(ack.src_addr(), SERVER_ADDR);
    assert_eq!(ack.dst_addr(), CLIENT_ADDR);
    assert_eq!(ack.seq_num(), SeqNumber::from(901));
    assert_eq!(ack.ack_num(), SeqNumber::from(105));
    Ok(())
}

//======================================================================================================================
// Robustness
//======================================================================================================================

/// An insertion followed by a same-size deletion at the same offset leaves the stream and every later mapping
/// exactly as in the identity case.
#[test]
fn insert_then_delete_is_identity() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    let f: Forwarded = mb.forward_edit(
        0,
        client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"),
        |tcp_in, fcb, pkt| {
            tcp_in.insert_bytes(fcb, pkt, 2, 4).unwrap();
            tcp_in.remove_bytes(fcb, pkt, 2, 4).unwrap();
        },
    );
    let emitted: PacketView = f.out.expect("packet should be emitted");
    assert_eq!(emitted.seq_num(), SeqNumber::from(101));
    assert_eq!(emitted.payload(), b"hello");

    // A later segment is not shifted either.
    let f: Forwarded = mb.forward(0, client(106, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"again"));
    assert_eq!(f.out.expect("packet should be emitted").seq_num(), SeqNumber::from(106));

    let f: Forwarded = mb.forward(1, server(901, 111, TCP_FLAG_ACK, b""));
    assert_eq!(f.out.expect("ack should pass").ack_num(), SeqNumber::from(111));
    Ok(())
}

/// Protocol violations: data before any SYN, and a SYN on an established flow, are counted and dropped.
#[test]
fn protocol_violations_are_dropped() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();

    let f: Forwarded = mb.forward(0, client(101, 0, TCP_FLAG_ACK | TCP_FLAG_PSH, b"early"));
    assert!(f.out.is_none());
    assert_eq!(mb.in0.borrow().counters().protocol_violations, 1);

    mb.handshake();
    let f: Forwarded = mb.forward(0, client(101, 901, TCP_FLAG_SYN, b""));
    assert!(f.out.is_none());
    assert_eq!(mb.in0.borrow().counters().protocol_violations, 2);
    Ok(())
}

/// A SYN+ACK observed before the initiator's SYN is dropped; the retransmitted handshake then succeeds.
#[test]
fn out_of_order_syn_ack_is_dropped() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();

    let f: Forwarded = mb.forward(1, server(900, 101, TCP_FLAG_SYN | TCP_FLAG_ACK, b""));
    assert!(f.out.is_none(), "no peer registration yet");

    mb.handshake();
    Ok(())
}

/// A stale pure acknowledgment carrying nothing new is dropped.
#[test]
fn duplicate_ack_is_dropped() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    let f: Forwarded = mb.forward_edit(
        0,
        client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"),
        |tcp_in, fcb, pkt| {
            tcp_in.insert_bytes(fcb, pkt, 5, 6).unwrap();
            let absolute: usize = pkt.content_offset() as usize + 5;
            pkt.write_bytes(absolute, b" world");
        },
    );
    assert!(f.out.is_some());

    let f: Forwarded = mb.forward(1, server(901, 112, TCP_FLAG_ACK, b""));
    assert_eq!(f.out.expect("ack should pass").ack_num(), SeqNumber::from(106));

    // An older acknowledgment arrives late: mapped below what we already emitted, it carries nothing.
    let f: Forwarded = mb.forward(1, server(901, 104, TCP_FLAG_ACK, b""));
    assert!(f.out.is_none());
    assert_eq!(mb.in1.borrow().counters().duplicate_acks_dropped, 1);
    Ok(())
}

/// When the receiver goes quiet, the middlebox retransmits the rewritten segment itself, backs off, and finally
/// tears the flow down.
#[test]
fn retransmission_timeout_tears_down() -> Result<()> {
    let config: MiddleboxConfig =
        MiddleboxConfig::new(None, None, None, Some(2), Some(Duration::from_secs(60)), None, None);
    let mut mb: Middlebox = Middlebox::with_config(config);
    mb.handshake();

    let f: Forwarded = mb.forward(0, client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"));
    assert!(f.out.is_some());

    // First expiry: the segment is re-emitted as sent.
    mb.advance(Duration::from_millis(1100));
    let now: Instant = mb.now;
    let resent: PacketView = mb
        .out0
        .borrow_mut()
        .check_retransmission(&mut mb.fcb0, now)
        .expect("timer should have fired");
    assert_eq!(resent.seq_num(), SeqNumber::from(101));
    assert_eq!(resent.payload(), b"hello");

    // Second expiry after back off.
    mb.advance(Duration::from_millis(2100));
    let now: Instant = mb.now;
    assert!(mb.out0.borrow_mut().check_retransmission(&mut mb.fcb0, now).is_some());

    // Limit of two exhausted: the flow dies ungracefully.
    mb.advance(Duration::from_millis(4100));
    let now: Instant = mb.now;
    assert!(mb.out0.borrow_mut().check_retransmission(&mut mb.fcb0, now).is_none());
    assert_eq!(mb.closing_state(0), ClosingState::ClosedUngraceful);
    assert_eq!(mb.closing_state(1), ClosingState::ClosedUngraceful);
    assert_eq!(mb.out0.borrow().counters().retransmission_timeouts, 1);
    Ok(())
}

/// Pool exhaustion drops new flows without touching established ones.
#[test]
fn pool_exhaustion_drops_new_flows() -> Result<()> {
    let config: MiddleboxConfig = MiddleboxConfig::new(None, None, Some(1), None, None, None, None);
    let mut mb: Middlebox = Middlebox::with_config(config);
    mb.handshake();

    // A second connection cannot get a record.
    let mut fcb: FlowControlBlock = FlowControlBlock::new();
    let now: Instant = mb.now;
    let other_syn: PacketView = packet(CLIENT_ADDR, SERVER_ADDR, 54321, SERVER_PORT, 5000, 0, TCP_FLAG_SYN, b"");
    assert!(mb.in0.borrow_mut().process(&mut fcb, other_syn, now).is_none());
    assert_eq!(mb.in0.borrow().counters().resource_exhaustion, 1);

    // The established flow still works.
    let f: Forwarded = mb.forward(0, client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"));
    assert!(f.out.is_some());
    Ok(())
}

/// Flows with no traffic are dropped after the idle timeout.
#[test]
fn idle_flows_expire() -> Result<()> {
    let config: MiddleboxConfig =
        MiddleboxConfig::new(None, None, None, None, None, Some(Duration::from_secs(30)), None);
    let mut mb: Middlebox = Middlebox::with_config(config);
    mb.handshake();
    assert_eq!(mb.registry.table().borrow().len(), 1);

    mb.advance(Duration::from_secs(31));
    let now: Instant = mb.now;
    assert_eq!(mb.in0.borrow_mut().expire_idle_flows(now), 1);
    assert!(mb.registry.table().borrow().is_empty());
    assert_eq!(mb.in0.borrow().counters().idle_flows_dropped, 1);
    Ok(())
}

/// The checksum paths: offload-capable buffers leave with cleared checksum fields when offload is configured,
/// everything else gets a software checksum.
#[test]
fn checksum_offload_paths() -> Result<()> {
    let config: MiddleboxConfig = MiddleboxConfig::new(None, None, None, None, None, None, Some(true));
    let mut mb: Middlebox = Middlebox::with_config(config);
    mb.handshake();

    // Offload-capable buffer: the NIC fills the checksum in.
    let mut pkt: PacketView = client(101, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello");
    pkt.set_offload_capable(true);
    let f: Forwarded = mb.forward_edit(0, pkt, |tcp_in, fcb, pkt| {
        tcp_in.insert_bytes(fcb, pkt, 5, 1).unwrap();
        let absolute: usize = pkt.content_offset() as usize + 5;
        pkt.write_bytes(absolute, b"!");
    });
    let emitted: PacketView = f.out.expect("packet should be emitted");
    let t: usize = emitted.ip_header_len();
    assert_eq!((emitted.byte_at(t + 16), emitted.byte_at(t + 17)), (0, 0));

    // A plain buffer falls back to the software path even with offload configured.
    let f: Forwarded = mb.forward_edit(
        0,
        client(107, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, b"hello"),
        |tcp_in, fcb, pkt| {
            tcp_in.insert_bytes(fcb, pkt, 5, 1).unwrap();
            let absolute: usize = pkt.content_offset() as usize + 5;
            pkt.write_bytes(absolute, b"!");
        },
    );
    let emitted: PacketView = f.out.expect("packet should be emitted");
    // The software path leaves a fully computed checksum: recomputing is a fixed point.
    let mut verify: PacketView = emitted.clone();
    verify.uniquify();
    verify.compute_checksums();
    assert_eq!(verify.as_bytes(), emitted.as_bytes());
    Ok(())
}

/// The shadow queue only ever holds segments the far endpoint has not fully acknowledged.
#[test]
fn shadow_queue_tracks_acknowledgments() -> Result<()> {
    let mut mb: Middlebox = Middlebox::new();
    mb.handshake();

    for (seq, payload) in [(101u32, &b"aaaa"[..]), (105, b"bbbb"), (109, b"cccc")] {
        let f: Forwarded = mb.forward(0, client(seq, 901, TCP_FLAG_ACK | TCP_FLAG_PSH, payload));
        assert!(f.out.is_some());
    }
    {
        let fcb0: &FlowControlBlock = &mb.fcb0;
        let common = fcb0.tcp_common().unwrap().borrow();
        assert_eq!(common.retransmission(FlowDirection::new(0).unwrap()).queue_len(), 3);
    }

    let f: Forwarded = mb.forward(1, server(901, 109, TCP_FLAG_ACK, b""));
    assert!(f.out.is_some());
    {
        let fcb0: &FlowControlBlock = &mb.fcb0;
        let common = fcb0.tcp_common().unwrap().borrow();
        let timing = common.retransmission(FlowDirection::new(0).unwrap());
        assert_eq!(timing.queue_len(), 1);
        for segment in timing.segments() {
            assert!(segment.modified_seq + SeqNumber::from(segment.modified_len) > SeqNumber::from(109));
        }
    }
    Ok(())
}
