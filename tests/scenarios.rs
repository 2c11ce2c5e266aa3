//! End-to-end scenarios against the assembled [`Stack`], one per
//! numbered case in the system this crate implements: ICMP echo on
//! loopback, ARP request/reply on a simulated Ethernet segment, UDP
//! round-trip, a TCP three-way handshake with a data transfer, silent
//! drop of UDP to an unbound port, and an RST reply to a SYN with no
//! listener.
//!
//! Traffic that would arrive from another host is built by hand here
//! (IP/ICMP/ARP/TCP wire bytes), checksummed with the crate's own
//! [`checksum`] helpers, and injected through [`Capture::inject`] --
//! exactly the seam a real driver's receive interrupt uses.

use std::thread;
use std::time::Duration;

use netstack::addr::{Endpoint, Ipv4Addr, MacAddress};
use netstack::device::DeviceFlags;
use netstack::error::ArpResolve;
use netstack::{checksum, ethernet, ip, Stack};

/// Generous settle time for a frame to make the round trip through the
/// interrupt worker (device IRQ -> softirq drain -> protocol dispatch).
fn settle() {
    thread::sleep(Duration::from_millis(150));
}

fn ip_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> Vec<u8> {
    let mut hdr = vec![0u8; ip::HEADER_MIN_LEN];
    hdr[0] = (4 << 4) | 5; // version 4, IHL 5
    let total = (ip::HEADER_MIN_LEN + payload_len) as u16;
    hdr[2..4].copy_from_slice(&total.to_be_bytes());
    hdr[8] = 64; // TTL
    hdr[9] = protocol;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());
    let sum = checksum::checksum(&hdr);
    hdr[10..12].copy_from_slice(&sum.to_be_bytes());
    hdr
}

fn icmp_echo_request(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(8 + payload.len());
    msg.push(8); // ECHO
    msg.push(0); // code
    msg.extend_from_slice(&[0, 0]); // checksum placeholder
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    let sum = checksum::checksum(&msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
    msg
}

fn arp_request(sha: MacAddress, spa: Ipv4Addr, tpa: Ipv4Addr) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(28);
    pkt.extend_from_slice(&1u16.to_be_bytes()); // hrd: ethernet
    pkt.extend_from_slice(&0x0800u16.to_be_bytes()); // pro: ipv4
    pkt.push(6); // hln
    pkt.push(4); // pln
    pkt.extend_from_slice(&1u16.to_be_bytes()); // op: request
    pkt.extend_from_slice(sha.as_bytes());
    pkt.extend_from_slice(&spa.octets());
    pkt.extend_from_slice(&[0u8; 6]); // tha: unknown
    pkt.extend_from_slice(&tpa.octets());
    pkt
}

/// A bare TCP segment with no options, checksummed over the IPv4
/// pseudo-header exactly as `netstack::tcp` builds its own segments.
#[allow(clippy::too_many_arguments)]
fn tcp_segment(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, window: u16, data: &[u8]) -> Vec<u8> {
    let mut seg = Vec::with_capacity(20 + data.len());
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push(5 << 4);
    seg.push(flags);
    seg.extend_from_slice(&window.to_be_bytes());
    seg.extend_from_slice(&[0, 0]); // checksum placeholder
    seg.extend_from_slice(&[0, 0]); // urgent pointer
    seg.extend_from_slice(data);
    let sum = checksum::checksum_with_pseudo_header(src_ip, dst_ip, ip::PROTO_TCP, &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());
    seg
}

fn decode_ip(datagram: &[u8]) -> (u8, Ipv4Addr, Ipv4Addr, &[u8]) {
    let ihl = ((datagram[0] & 0x0f) as usize) * 4;
    let protocol = datagram[9];
    let src = Ipv4Addr(datagram[12..16].try_into().unwrap());
    let dst = Ipv4Addr(datagram[16..20].try_into().unwrap());
    (protocol, src, dst, &datagram[ihl..])
}

#[test]
fn scenario_1_icmp_echo_on_loopback_replies_with_identical_payload() {
    let stack = Stack::init();
    let unicast = Ipv4Addr::new(127, 0, 0, 1);
    let (dev, sent, _rx) = stack.add_capture(
        MacAddress::new([2, 0, 0, 0, 0, 1]),
        1500,
        DeviceFlags::BROADCAST,
        unicast,
        Ipv4Addr::new(255, 0, 0, 0),
    );
    stack.run();

    let payload = vec![0xab; 48];
    let echo = icmp_echo_request(0x1234, 7, &payload);
    let datagram = {
        let mut d = ip_header(unicast, unicast, ip::PROTO_ICMP, echo.len());
        d.extend_from_slice(&echo);
        d
    };
    let frame = ethernet::encode(MacAddress::new([2, 0, 0, 0, 0, 1]), MacAddress::new([9, 9, 9, 9, 9, 9]), ethernet::ETHERTYPE_IPV4, &datagram);

    inject(&stack, dev, frame);
    settle();

    let frames = sent.lock().unwrap();
    assert_eq!(frames.len(), 1, "expected exactly one echo reply");
    let (hdr, ip_payload) = ethernet::decode(&frames[0]).unwrap();
    assert_eq!(hdr.ethertype, ethernet::ETHERTYPE_IPV4);
    let (protocol, src, dst, icmp_payload) = decode_ip(ip_payload);
    assert_eq!(protocol, ip::PROTO_ICMP);
    assert_eq!(src, unicast);
    assert_eq!(dst, unicast);
    assert_eq!(icmp_payload[0], 0, "ECHOREPLY");
    assert_eq!(&icmp_payload[4..8], &echo[4..8], "identifier+sequence preserved");
    assert_eq!(&icmp_payload[8..], payload.as_slice());
    assert_eq!(checksum::checksum(icmp_payload), 0);
}

/// Feed a frame straight into link-protocol dispatch and drain it, the
/// same two steps the production IRQ handler performs, without waiting
/// on the interrupt worker's channel round trip.
fn inject(stack: &'static Stack, dev: usize, frame: Vec<u8>) {
    let (hdr, payload) = ethernet::decode(&frame).expect("well-formed test frame");
    if stack.link_protocols.input_handler(hdr.ethertype, payload, dev) {
        stack.link_protocols.drain();
    }
}

#[test]
fn scenario_2_arp_request_gets_a_reply_and_populates_the_cache() {
    let stack = Stack::init();
    let own_mac = MacAddress::new([2, 0, 0, 0, 0, 2]);
    let querier_mac = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    let own_ip = Ipv4Addr::new(192, 0, 2, 2);
    let querier_ip = Ipv4Addr::new(192, 0, 2, 1);

    let (dev, sent, _rx) = stack.add_capture(
        own_mac,
        1500,
        DeviceFlags::NEED_ARP | DeviceFlags::BROADCAST,
        own_ip,
        Ipv4Addr::new(255, 255, 255, 0),
    );
    stack.run();

    let arp_pkt = arp_request(querier_mac, querier_ip, own_ip);
    let frame = ethernet::encode(MacAddress::BROADCAST, querier_mac, ethernet::ETHERTYPE_ARP, &arp_pkt);
    inject(&stack, dev, frame);
    settle();

    let frames = sent.lock().unwrap();
    assert_eq!(frames.len(), 1);
    let (hdr, payload) = ethernet::decode(&frames[0]).unwrap();
    assert_eq!(hdr.dst, querier_mac);
    assert_eq!(hdr.ethertype, ethernet::ETHERTYPE_ARP);
    assert_eq!(u16::from_be_bytes([payload[6], payload[7]]), 2, "op=reply");
    assert_eq!(&payload[8..14], own_mac.as_bytes());
    assert_eq!(&payload[14..18], &own_ip.octets());
    assert_eq!(&payload[18..24], querier_mac.as_bytes());
    assert_eq!(&payload[24..28], &querier_ip.octets());
    drop(frames);

    let iface = stack.devices.get_iface(dev).unwrap();
    match stack.arp.resolve(&stack.devices, dev, iface, querier_ip) {
        ArpResolve::Found(ha) => assert_eq!(ha, *querier_mac.as_bytes()),
        other => panic!("expected resolved cache entry, got {other:?}"),
    }
}

#[test]
fn scenario_3_udp_round_trip_on_loopback() {
    let stack = Stack::init();
    let unicast = Ipv4Addr::new(127, 0, 0, 1);
    stack.add_loopback(unicast, Ipv4Addr::new(255, 0, 0, 0));
    stack.run();

    let sender = stack.udp_open().unwrap();
    let receiver = stack.udp_open().unwrap();
    stack.udp_bind(sender, Endpoint::new(unicast, 10007)).unwrap();
    stack.udp_bind(receiver, Endpoint::new(unicast, 20008)).unwrap();

    let n = stack.udp_sendto(sender, b"hello", Endpoint::new(unicast, 20008)).unwrap();
    assert_eq!(n, 5);

    settle();
    let mut buf = [0u8; 16];
    let (n, from) = stack.udp_recvfrom(receiver, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(from, Endpoint::new(unicast, 10007));
}

#[test]
fn scenario_4_tcp_three_way_handshake_and_data_transfer_on_loopback() {
    let stack = Stack::init();
    let unicast = Ipv4Addr::new(127, 0, 0, 1);
    stack.add_loopback(unicast, Ipv4Addr::new(255, 0, 0, 0));
    stack.run();

    let passive = stack
        .tcp_open_rfc793(Endpoint::new(unicast, 8080), None, false)
        .unwrap();
    let active = stack
        .tcp_open_rfc793(Endpoint::new(unicast, 33333), Some(Endpoint::new(unicast, 8080)), true)
        .unwrap();

    settle();

    let block: Vec<u8> = (0..=255u16).map(|b| b as u8).collect();
    let sent = stack.tcp_send(active, &block).unwrap();
    assert_eq!(sent, block.len());

    let mut buf = [0u8; 256];
    let n = stack.tcp_receive(passive, &mut buf).unwrap();
    assert_eq!(n, block.len());
    assert_eq!(&buf[..n], block.as_slice());
}

#[test]
fn scenario_5_udp_to_unbound_port_is_silently_discarded() {
    let stack = Stack::init();
    let unicast = Ipv4Addr::new(127, 0, 0, 1);
    stack.add_loopback(unicast, Ipv4Addr::new(255, 0, 0, 0));
    stack.run();

    let sender = stack.udp_open().unwrap();
    stack.udp_bind(sender, Endpoint::new(unicast, 40001)).unwrap();
    let result = stack.udp_sendto(sender, b"nobody home", Endpoint::new(unicast, 50999));
    assert_eq!(result.unwrap(), 11);
    settle();
}

#[test]
fn scenario_6_tcp_syn_with_no_listener_gets_rst_ack() {
    let stack = Stack::init();
    let unicast = Ipv4Addr::new(198, 51, 100, 9);
    let (dev, sent, _rx) = stack.add_capture(
        MacAddress::new([2, 0, 0, 0, 0, 3]),
        1500,
        DeviceFlags::BROADCAST,
        unicast,
        Ipv4Addr::new(255, 255, 255, 0),
    );
    stack.run();

    let peer = Ipv4Addr::new(198, 51, 100, 50);
    let syn = tcp_segment(peer, unicast, 4000, 9999, 1000, 0, 0x02, 4096, &[]);
    let datagram = {
        let mut d = ip_header(peer, unicast, ip::PROTO_TCP, syn.len());
        d.extend_from_slice(&syn);
        d
    };
    let frame = ethernet::encode(MacAddress::new([2, 0, 0, 0, 0, 3]), MacAddress::new([7, 7, 7, 7, 7, 7]), ethernet::ETHERTYPE_IPV4, &datagram);
    inject(&stack, dev, frame);
    settle();

    let frames = sent.lock().unwrap();
    assert_eq!(frames.len(), 1);
    let (_hdr, ip_payload) = ethernet::decode(&frames[0]).unwrap();
    let (protocol, _src, _dst, tcp_payload) = decode_ip(ip_payload);
    assert_eq!(protocol, ip::PROTO_TCP);
    let seq = u32::from_be_bytes(tcp_payload[4..8].try_into().unwrap());
    let ack = u32::from_be_bytes(tcp_payload[8..12].try_into().unwrap());
    let flags = tcp_payload[13];
    assert_eq!(seq, 0);
    assert_eq!(ack, 1001);
    assert_eq!(flags & 0x04, 0x04, "RST set");
    assert_eq!(flags & 0x10, 0x10, "ACK set");
}
