//! TCP: RFC 793 SEGMENT ARRIVES subset, retransmit queue, blocking
//! open/send/receive (`spec.md` §4.7).
//!
//! PCBs are addressed by a stable integer index into a fixed-capacity
//! table, same shape as [`crate::udp::UdpPcbTable`]; the retransmit
//! queue stores complete, already-built segment bytes per
//! `examples/original_source/tcp.c` (supplemented in `SPEC_FULL.md`),
//! so a resend is a byte-for-byte replay of what was first sent rather
//! than a recomputed one.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use rand::Rng;

use crate::addr::{Endpoint, Ipv4Addr};
use crate::arp::ArpCache;
use crate::checksum;
use crate::device::{DeviceManager, Interface};
use crate::error::TcpError;
use crate::ip::{self, IdGenerator, RouteTable};
use crate::sched::Waitable;

pub const PCB_CAPACITY: usize = 16;
const HEADER_LEN: usize = 20;
const RECV_BUF_CAPACITY: usize = 65535;
const INITIAL_RTO: Duration = Duration::from_millis(200);
const CONNECTION_DEADLINE: Duration = Duration::from_secs(12);

bitflags! {
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Free,
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
}

#[derive(Debug, Clone, Copy, Default)]
struct SendControl {
    nxt: u32,
    una: u32,
    wnd: u16,
    up: u16,
    wl1: u32,
    wl2: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct RecvControl {
    nxt: u32,
    wnd: u16,
    up: u16,
}

struct RetransmitEntry {
    seq_end: u32,
    first_sent: Instant,
    last_sent: Instant,
    rto: Duration,
    local: Endpoint,
    foreign: Endpoint,
    segment: Vec<u8>,
}

struct Pcb {
    state: State,
    local: Endpoint,
    foreign: Endpoint,
    snd: SendControl,
    iss: u32,
    rcv: RecvControl,
    irs: u32,
    mss: usize,
    recv_buf: VecDeque<u8>,
    retransmit: VecDeque<RetransmitEntry>,
}

impl Pcb {
    fn free() -> Self {
        Pcb {
            state: State::Free,
            local: Endpoint::ANY,
            foreign: Endpoint::ANY,
            snd: SendControl::default(),
            iss: 0,
            rcv: RecvControl::default(),
            irs: 0,
            mss: 0,
            recv_buf: VecDeque::new(),
            retransmit: VecDeque::new(),
        }
    }
}

/// The TCP PCB table: fixed capacity, one mutex, condition variables
/// kept in a sibling array exactly as in [`crate::udp::UdpPcbTable`].
pub struct TcpPcbTable {
    entries: Mutex<Vec<Pcb>>,
    waits: Vec<Waitable>,
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn in_window(x: u32, start: u32, size: u32) -> bool {
    !seq_lt(x, start) && seq_lt(x, start.wrapping_add(size))
}

/// RFC 793 segment acceptability test.
fn acceptable(rcv_nxt: u32, rcv_wnd: u16, seg_seq: u32, seg_len: u32) -> bool {
    if rcv_wnd == 0 {
        return seg_len == 0 && seg_seq == rcv_nxt;
    }
    let wnd = rcv_wnd as u32;
    if seg_len == 0 {
        in_window(seg_seq, rcv_nxt, wnd)
    } else {
        in_window(seg_seq, rcv_nxt, wnd) || in_window(seg_seq.wrapping_add(seg_len - 1), rcv_nxt, wnd)
    }
}

struct Segment<'a> {
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    data: &'a [u8],
}

fn parse_segment(payload: &[u8]) -> Option<Segment<'_>> {
    if payload.len() < HEADER_LEN {
        return None;
    }
    let seq = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    let ack = u32::from_be_bytes(payload[8..12].try_into().unwrap());
    let doff = (payload[12] >> 4) as usize * 4;
    let flags = TcpFlags::from_bits_truncate(payload[13] & 0x3f);
    let window = u16::from_be_bytes([payload[14], payload[15]]);
    if doff < HEADER_LEN || doff > payload.len() {
        return None;
    }
    Some(Segment {
        seq,
        ack,
        flags,
        window,
        data: &payload[doff..],
    })
}

fn build_segment(local: Endpoint, foreign: Endpoint, seq: u32, ack: u32, flags: TcpFlags, window: u16, data: &[u8]) -> Vec<u8> {
    let mut seg = Vec::with_capacity(HEADER_LEN + data.len());
    seg.extend_from_slice(&local.port.to_be_bytes());
    seg.extend_from_slice(&foreign.port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push(5 << 4); // data offset = 5 words (no options), reserved = 0
    seg.push(flags.bits());
    seg.extend_from_slice(&window.to_be_bytes());
    seg.extend_from_slice(&[0, 0]); // checksum placeholder
    seg.extend_from_slice(&[0, 0]); // urgent pointer, unused
    seg.extend_from_slice(data);
    let sum = checksum::checksum_with_pseudo_header(local.addr, foreign.addr, ip::PROTO_TCP, &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());
    seg
}

#[allow(clippy::too_many_arguments)]
fn send_raw(local: Endpoint, foreign: Endpoint, segment: &[u8], dev_mgr: &DeviceManager, arp_cache: &ArpCache, routes: &RouteTable, ids: &IdGenerator) {
    if let Err(e) = ip::output(dev_mgr, arp_cache, routes, ids, local.addr, foreign.addr, ip::PROTO_TCP, segment) {
        log::debug!("tcp: segment {local}->{foreign} dropped: {e}");
    }
}

impl TcpPcbTable {
    pub fn new() -> Self {
        Self::with_capacity(PCB_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, Pcb::free);
        let mut waits = Vec::with_capacity(capacity);
        waits.resize_with(capacity, Waitable::new);
        TcpPcbTable {
            entries: Mutex::new(entries),
            waits,
        }
    }

    fn enqueue_retransmit(pcb: &mut Pcb, local: Endpoint, foreign: Endpoint, seq_end: u32, segment: &[u8]) {
        let now = Instant::now();
        pcb.retransmit.push_back(RetransmitEntry {
            seq_end,
            first_sent: now,
            last_sent: now,
            rto: INITIAL_RTO,
            local,
            foreign,
            segment: segment.to_vec(),
        });
    }

    /// `open_rfc793(local, foreign, active)`: active opens require
    /// `foreign`; passive opens create a LISTEN PCB with no peer yet.
    #[allow(clippy::too_many_arguments)]
    pub fn open_rfc793(
        &self,
        local: Endpoint,
        foreign: Option<Endpoint>,
        active: bool,
        iface: Interface,
        dev_mgr: &DeviceManager,
        arp_cache: &ArpCache,
        routes: &RouteTable,
        ids: &IdGenerator,
    ) -> Result<usize, TcpError> {
        let mss = iface.mtu.saturating_sub(ip::HEADER_MIN_LEN + HEADER_LEN);
        let mut entries = self.entries.lock().unwrap();
        let idx = entries.iter().position(|p| p.state == State::Free).ok_or(TcpError::PcbTableFull)?;

        if !active {
            entries[idx] = Pcb { state: State::Listen, local, mss, ..Pcb::free() };
            return Ok(idx);
        }

        let foreign = foreign.ok_or(TcpError::NoSuchPcb)?;
        let iss: u32 = rand::thread_rng().gen();
        entries[idx] = Pcb {
            state: State::SynSent,
            local,
            foreign,
            snd: SendControl { una: iss, nxt: iss.wrapping_add(1), wnd: 0, up: 0, wl1: 0, wl2: 0 },
            iss,
            rcv: RecvControl { nxt: 0, wnd: RECV_BUF_CAPACITY as u16, up: 0 },
            mss,
            ..Pcb::free()
        };
        let seg = build_segment(local, foreign, iss, 0, TcpFlags::SYN, RECV_BUF_CAPACITY as u16, &[]);
        Self::enqueue_retransmit(&mut entries[idx], local, foreign, iss.wrapping_add(1), &seg);
        drop(entries);
        send_raw(local, foreign, &seg, dev_mgr, arp_cache, routes, ids);
        Ok(idx)
    }

    /// Find the PCB matching an arriving segment's four-tuple, or a
    /// LISTEN PCB matching just the local two-tuple. A PCB that has
    /// already gone to CLOSED is treated the same as no match at all,
    /// so such a segment takes the RST-reply path in `input` instead of
    /// being fed to `process_segment`'s no-op catch-all arm.
    fn find_match(entries: &[Pcb], local: Endpoint, foreign: Endpoint) -> Option<usize> {
        entries
            .iter()
            .position(|p| p.state != State::Free && p.state != State::Closed && p.local == local && p.foreign == foreign)
            .or_else(|| entries.iter().position(|p| p.state == State::Listen && p.local.port == local.port))
    }

    /// TCP input: the `ip::UpperProtocolRegistry` handler for protocol 6.
    #[allow(clippy::too_many_arguments)]
    pub fn input(
        &self,
        payload: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        iface: Interface,
        dev_mgr: &DeviceManager,
        arp_cache: &ArpCache,
        routes: &RouteTable,
        ids: &IdGenerator,
    ) {
        let Some(seg) = parse_segment(payload) else { return };
        if checksum::checksum_with_pseudo_header(src, dst, ip::PROTO_TCP, payload) != 0 {
            log::trace!("dropping tcp segment with bad checksum");
            return;
        }
        let src_port = u16::from_be_bytes([payload[0], payload[1]]);
        let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
        let local = Endpoint::new(dst, dst_port);
        let foreign = Endpoint::new(src, src_port);
        let seg_len = seg.data.len() as u32
            + seg.flags.contains(TcpFlags::SYN) as u32
            + seg.flags.contains(TcpFlags::FIN) as u32;

        let mut entries = self.entries.lock().unwrap();
        let Some(idx) = Self::find_match(&entries, local, foreign) else {
            drop(entries);
            let (seq, ack, flags) = if seg.flags.contains(TcpFlags::ACK) {
                (seg.ack, 0, TcpFlags::RST)
            } else {
                (0, seg.seq.wrapping_add(seg_len), TcpFlags::RST | TcpFlags::ACK)
            };
            let reply = build_segment(local, foreign, seq, ack, flags, 0, &[]);
            send_raw(local, foreign, &reply, dev_mgr, arp_cache, routes, ids);
            return;
        };

        let wake = self.process_segment(&mut entries[idx], local, foreign, iface, &seg, seg_len, dev_mgr, arp_cache, routes, ids);
        drop(entries);
        if wake {
            self.waits[idx].wakeup();
        }
    }

    /// Runs the relevant `spec.md` §4.7 transition for one arrived
    /// segment against an existing PCB. Returns whether waiters should
    /// be woken.
    #[allow(clippy::too_many_arguments)]
    fn process_segment(
        &self,
        pcb: &mut Pcb,
        local: Endpoint,
        foreign: Endpoint,
        iface: Interface,
        seg: &Segment,
        seg_len: u32,
        dev_mgr: &DeviceManager,
        arp_cache: &ArpCache,
        routes: &RouteTable,
        ids: &IdGenerator,
    ) -> bool {
        match pcb.state {
            State::Listen => {
                if seg.flags.contains(TcpFlags::SYN) {
                    pcb.foreign = foreign;
                    pcb.irs = seg.seq;
                    pcb.rcv = RecvControl { nxt: seg.seq.wrapping_add(1), wnd: RECV_BUF_CAPACITY as u16, up: 0 };
                    let iss: u32 = rand::thread_rng().gen();
                    pcb.iss = iss;
                    pcb.snd = SendControl { una: iss, nxt: iss.wrapping_add(1), wnd: seg.window, up: 0, wl1: seg.seq, wl2: 0 };
                    pcb.mss = iface.mtu.saturating_sub(ip::HEADER_MIN_LEN + HEADER_LEN);
                    pcb.state = State::SynReceived;
                    let synack = build_segment(local, foreign, iss, pcb.rcv.nxt, TcpFlags::SYN | TcpFlags::ACK, pcb.rcv.wnd, &[]);
                    Self::enqueue_retransmit(pcb, local, foreign, iss.wrapping_add(1), &synack);
                    send_raw(local, foreign, &synack, dev_mgr, arp_cache, routes, ids);
                } else if seg.flags.contains(TcpFlags::ACK) {
                    let rst = build_segment(local, foreign, seg.ack, 0, TcpFlags::RST, 0, &[]);
                    send_raw(local, foreign, &rst, dev_mgr, arp_cache, routes, ids);
                }
                false
            }
            State::SynSent => {
                let acceptable_ack = seg.flags.contains(TcpFlags::ACK)
                    && !seq_lt(seg.ack, pcb.snd.una)
                    && !seq_lt(pcb.snd.nxt, seg.ack);
                if seg.flags.contains(TcpFlags::SYN) && seg.flags.contains(TcpFlags::ACK) && acceptable_ack {
                    pcb.rcv.nxt = seg.seq.wrapping_add(1);
                    pcb.irs = seg.seq;
                    pcb.snd.una = seg.ack;
                    let una = pcb.snd.una;
                    pcb.retransmit.retain(|e| seq_lt(una, e.seq_end));
                    pcb.snd.wnd = seg.window;
                    pcb.snd.wl1 = seg.seq;
                    pcb.snd.wl2 = seg.ack;
                    pcb.state = State::Established;
                    let ack = build_segment(local, foreign, pcb.snd.nxt, pcb.rcv.nxt, TcpFlags::ACK, pcb.rcv.wnd, &[]);
                    send_raw(local, foreign, &ack, dev_mgr, arp_cache, routes, ids);
                    true
                } else if seg.flags.contains(TcpFlags::SYN) {
                    pcb.rcv = RecvControl { nxt: seg.seq.wrapping_add(1), wnd: RECV_BUF_CAPACITY as u16, up: 0 };
                    pcb.irs = seg.seq;
                    pcb.state = State::SynReceived;
                    let synack = build_segment(local, foreign, pcb.iss, pcb.rcv.nxt, TcpFlags::SYN | TcpFlags::ACK, pcb.rcv.wnd, &[]);
                    Self::enqueue_retransmit(pcb, local, foreign, pcb.iss.wrapping_add(1), &synack);
                    send_raw(local, foreign, &synack, dev_mgr, arp_cache, routes, ids);
                    false
                } else {
                    false
                }
            }
            State::SynReceived => {
                if seg.flags.contains(TcpFlags::ACK) && seg.ack == pcb.snd.nxt {
                    pcb.snd.una = seg.ack;
                    pcb.retransmit.clear();
                    pcb.snd.wnd = seg.window;
                    pcb.snd.wl1 = seg.seq;
                    pcb.snd.wl2 = seg.ack;
                    pcb.state = State::Established;
                    true
                } else {
                    let rst = build_segment(local, foreign, seg.ack, 0, TcpFlags::RST, 0, &[]);
                    send_raw(local, foreign, &rst, dev_mgr, arp_cache, routes, ids);
                    pcb.state = State::Closed;
                    true
                }
            }
            State::Established => {
                if seg.flags.contains(TcpFlags::RST) {
                    pcb.state = State::Closed;
                    return true;
                }
                if !acceptable(pcb.rcv.nxt, pcb.rcv.wnd, seg.seq, seg_len) {
                    let ack = build_segment(local, foreign, pcb.snd.nxt, pcb.rcv.nxt, TcpFlags::ACK, pcb.rcv.wnd, &[]);
                    send_raw(local, foreign, &ack, dev_mgr, arp_cache, routes, ids);
                    return false;
                }

                let mut should_ack = false;
                if seg.flags.contains(TcpFlags::ACK) {
                    if seq_lt(pcb.snd.una, seg.ack) && !seq_lt(pcb.snd.nxt, seg.ack) {
                        pcb.snd.una = seg.ack;
                        let una = pcb.snd.una;
                        pcb.retransmit.retain(|e| seq_lt(una, e.seq_end));
                        if seq_lt(pcb.snd.wl1, seg.seq) || (pcb.snd.wl1 == seg.seq && !seq_lt(seg.ack, pcb.snd.wl2)) {
                            pcb.snd.wnd = seg.window;
                            pcb.snd.wl1 = seg.seq;
                            pcb.snd.wl2 = seg.ack;
                        }
                    } else if seq_lt(pcb.snd.nxt, seg.ack) {
                        should_ack = true;
                    }
                }

                let mut woke_reader = false;
                if !seg.data.is_empty() && seg.seq == pcb.rcv.nxt {
                    let take = seg.data.len().min(pcb.rcv.wnd as usize);
                    pcb.recv_buf.extend(&seg.data[..take]);
                    pcb.rcv.nxt = pcb.rcv.nxt.wrapping_add(take as u32);
                    pcb.rcv.wnd -= take as u16;
                    should_ack = true;
                    woke_reader = true;
                } else if !seg.data.is_empty() {
                    should_ack = true;
                }

                if should_ack {
                    let ack = build_segment(local, foreign, pcb.snd.nxt, pcb.rcv.nxt, TcpFlags::ACK, pcb.rcv.wnd, &[]);
                    send_raw(local, foreign, &ack, dev_mgr, arp_cache, routes, ids);
                }
                woke_reader
            }
            State::Free | State::Closed => false,
        }
    }

    /// `send(id, data)`: only valid in ESTABLISHED; blocks until the
    /// send window has room.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        id: usize,
        data: &[u8],
        dev_mgr: &DeviceManager,
        arp_cache: &ArpCache,
        routes: &RouteTable,
        ids: &IdGenerator,
    ) -> Result<usize, TcpError> {
        let mut guard = self.entries.lock().unwrap();
        let mut sent = 0;
        loop {
            let pcb = guard.get_mut(id).ok_or(TcpError::NoSuchPcb)?;
            if pcb.state != State::Established {
                return Err(TcpError::NotEstablished);
            }
            if sent == data.len() {
                return Ok(sent);
            }
            let outstanding = pcb.snd.nxt.wrapping_sub(pcb.snd.una).min(pcb.snd.wnd as u32);
            let cap = pcb.snd.wnd as u32 - outstanding;
            if cap == 0 {
                let (g, result) = self.waits[id].sleep(guard, None);
                guard = g;
                result?;
                continue;
            }
            let slen = pcb.mss.min(data.len() - sent).min(cap as usize).max(1);
            let local = pcb.local;
            let foreign = pcb.foreign;
            let seq = pcb.snd.nxt;
            let chunk = &data[sent..sent + slen];
            let seg = build_segment(local, foreign, seq, pcb.rcv.nxt, TcpFlags::ACK | TcpFlags::PSH, pcb.rcv.wnd, chunk);
            Self::enqueue_retransmit(pcb, local, foreign, seq.wrapping_add(slen as u32), &seg);
            pcb.snd.nxt = pcb.snd.nxt.wrapping_add(slen as u32);
            sent += slen;
            drop(guard);
            send_raw(local, foreign, &seg, dev_mgr, arp_cache, routes, ids);
            guard = self.entries.lock().unwrap();
        }
    }

    /// `receive(id, buf)`: blocks until at least one byte is available.
    pub fn receive(&self, id: usize, buf: &mut [u8]) -> Result<usize, TcpError> {
        let mut guard = self.entries.lock().unwrap();
        loop {
            let pcb = guard.get_mut(id).ok_or(TcpError::NoSuchPcb)?;
            match pcb.state {
                State::Closed => return Err(TcpError::ConnectionReset),
                State::Free => return Err(TcpError::NoSuchPcb),
                _ => {}
            }
            if !pcb.recv_buf.is_empty() {
                let n = buf.len().min(pcb.recv_buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = pcb.recv_buf.pop_front().unwrap();
                }
                pcb.rcv.wnd = pcb.rcv.wnd.saturating_add(n as u16);
                return Ok(n);
            }
            let (g, result) = self.waits[id].sleep(guard, None);
            guard = g;
            result?;
        }
    }

    /// `close(id)`: always sends a RST and releases the PCB
    /// (`SPEC_FULL.md` §9: no FIN half-close path).
    pub fn close(&self, id: usize, dev_mgr: &DeviceManager, arp_cache: &ArpCache, routes: &RouteTable, ids: &IdGenerator) -> Result<(), TcpError> {
        let mut entries = self.entries.lock().unwrap();
        let pcb = entries.get_mut(id).ok_or(TcpError::NoSuchPcb)?;
        if pcb.state == State::Free {
            return Err(TcpError::NoSuchPcb);
        }
        if pcb.state != State::Listen {
            let rst = build_segment(pcb.local, pcb.foreign, pcb.snd.nxt, pcb.rcv.nxt, TcpFlags::RST, 0, &[]);
            send_raw(pcb.local, pcb.foreign, &rst, dev_mgr, arp_cache, routes, ids);
        }
        *pcb = Pcb::free();
        drop(entries);
        self.waits[id].wakeup();
        Ok(())
    }

    /// Retransmit timer (1 s tick): resend timed-out segments with
    /// exponential backoff; give up after the 12 s connection deadline.
    pub fn retransmit_tick(&self, dev_mgr: &DeviceManager, arp_cache: &ArpCache, routes: &RouteTable, ids: &IdGenerator) {
        let now = Instant::now();
        let mut to_send: Vec<(Endpoint, Endpoint, Vec<u8>)> = Vec::new();
        let mut woken = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            for (idx, pcb) in entries.iter_mut().enumerate() {
                if pcb.state == State::Free {
                    continue;
                }
                let mut deadline_hit = false;
                for entry in pcb.retransmit.iter_mut() {
                    if now.duration_since(entry.first_sent) >= CONNECTION_DEADLINE {
                        deadline_hit = true;
                        break;
                    }
                    if now.duration_since(entry.last_sent) >= entry.rto {
                        entry.last_sent = now;
                        entry.rto *= 2;
                        to_send.push((entry.local, entry.foreign, entry.segment.clone()));
                    }
                }
                if deadline_hit {
                    pcb.state = State::Closed;
                    pcb.retransmit.clear();
                    woken.push(idx);
                }
            }
        }
        for (local, foreign, segment) in to_send {
            send_raw(local, foreign, &segment, dev_mgr, arp_cache, routes, ids);
        }
        for idx in woken {
            self.waits[idx].wakeup();
        }
    }

    /// Broadcast `interrupt` to every live PCB's condition (stack shutdown).
    pub fn interrupt_all(&self) {
        let entries = self.entries.lock().unwrap();
        for (idx, pcb) in entries.iter().enumerate() {
            if pcb.state != State::Free {
                self.waits[idx].interrupt();
            }
        }
    }
}

impl Default for TcpPcbTable {
    fn default() -> Self {
        TcpPcbTable::new()
    }
}
