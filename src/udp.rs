//! UDP: PCB table, bind, blocking `sendto`/`recvfrom`, pseudo-header
//! checksum (`spec.md` §4.6).
//!
//! PCBs are addressed by a stable integer index into a fixed-capacity
//! table behind one mutex, per `spec.md` §9; each PCB's
//! [`crate::sched::Waitable`] lives in a sibling array outside that
//! mutex so `recvfrom` can pass the table's `MutexGuard` into `sleep`
//! while still holding a reference to the PCB's own condition.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::addr::{Endpoint, Ipv4Addr};
use crate::arp::ArpCache;
use crate::checksum;
use crate::device::{DeviceManager, Interface};
use crate::error::UdpError;
use crate::ip::{self, IdGenerator, RouteTable};
use crate::sched::Waitable;

pub const PCB_CAPACITY: usize = 16;
const EPHEMERAL_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;
const UDP_HEADER_LEN: usize = 8;
/// `IP_PAYLOAD_MAX − 8`: the largest datagram body this stack accepts.
pub const MAX_PAYLOAD: usize = 65507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Free,
    Open,
    Closing,
}

struct RecvEntry {
    foreign: Endpoint,
    payload: Vec<u8>,
}

struct Pcb {
    state: State,
    local: Endpoint,
    queue: VecDeque<RecvEntry>,
}

impl Pcb {
    fn free() -> Self {
        Pcb {
            state: State::Free,
            local: Endpoint::ANY,
            queue: VecDeque::new(),
        }
    }
}

pub struct UdpPcbTable {
    entries: Mutex<Vec<Pcb>>,
    waits: Vec<Waitable>,
}

impl UdpPcbTable {
    pub fn new() -> Self {
        Self::with_capacity(PCB_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, Pcb::free);
        let mut waits = Vec::with_capacity(capacity);
        waits.resize_with(capacity, Waitable::new);
        UdpPcbTable {
            entries: Mutex::new(entries),
            waits,
        }
    }

    /// `open()`: the first FREE index, set to OPEN with no local binding.
    pub fn open(&self) -> Result<usize, UdpError> {
        let mut entries = self.entries.lock().unwrap();
        let idx = entries.iter().position(|p| p.state == State::Free).ok_or(UdpError::NoSuchPcb)?;
        entries[idx] = Pcb {
            state: State::Open,
            local: Endpoint::ANY,
            queue: VecDeque::new(),
        };
        Ok(idx)
    }

    /// `bind(id, local)`: fails if another OPEN pcb matches `local`
    /// under wildcard-aware address comparison.
    pub fn bind(&self, id: usize, local: Endpoint) -> Result<(), UdpError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(id).map(|p| p.state) != Some(State::Open) {
            return Err(UdpError::NoSuchPcb);
        }
        let conflict = entries.iter().enumerate().any(|(i, p)| {
            i != id
                && p.state == State::Open
                && p.local.port == local.port
                && (p.local.addr_matches(local.addr) || local.addr_matches(p.local.addr))
        });
        if conflict {
            return Err(UdpError::AddressInUse);
        }
        entries[id].local = local;
        Ok(())
    }

    fn ensure_bound_for_send(&self, id: usize, routes: &RouteTable, dev_mgr: &DeviceManager, foreign: Endpoint) -> Result<Endpoint, UdpError> {
        let mut entries = self.entries.lock().unwrap();
        let pcb = entries.get_mut(id).filter(|p| p.state == State::Open).ok_or(UdpError::NoSuchPcb)?;

        if pcb.local.addr.is_unspecified() {
            let route = routes.lookup(foreign.addr).ok_or(UdpError::Ip(crate::error::IpError::NoRoute))?;
            let iface = dev_mgr.get_iface(route.dev).ok_or(UdpError::Ip(crate::error::IpError::NoRoute))?;
            pcb.local.addr = iface.unicast;
        }

        if pcb.local.port == 0 {
            let addr = pcb.local.addr;
            let taken: Vec<u16> = entries
                .iter()
                .enumerate()
                .filter(|(i, p)| *i != id && p.state == State::Open && p.local.addr_matches(addr))
                .map(|(_, p)| p.local.port)
                .collect();
            let port = EPHEMERAL_RANGE.clone().find(|p| !taken.contains(p)).ok_or(UdpError::NoEphemeralPort)?;
            entries[id].local.port = port;
        }

        Ok(entries[id].local)
    }

    /// `sendto(id, data, foreign)`.
    pub fn sendto(
        &self,
        id: usize,
        data: &[u8],
        foreign: Endpoint,
        dev_mgr: &DeviceManager,
        arp_cache: &ArpCache,
        routes: &RouteTable,
        ids: &IdGenerator,
    ) -> Result<usize, UdpError> {
        let local = self.ensure_bound_for_send(id, routes, dev_mgr, foreign)?;
        output(local, foreign, data, dev_mgr, arp_cache, routes, ids)?;
        Ok(data.len())
    }

    /// `recvfrom(id, buf, size)`: pop the head of the receive queue,
    /// sleeping on the PCB's condition when it is empty.
    pub fn recvfrom(&self, id: usize, buf: &mut [u8]) -> Result<(usize, Endpoint), UdpError> {
        let mut guard = self.entries.lock().unwrap();
        loop {
            let pcb = guard.get_mut(id).ok_or(UdpError::NoSuchPcb)?;
            match pcb.state {
                State::Closing => {
                    *pcb = Pcb::free();
                    return Err(UdpError::Closing);
                }
                State::Free => return Err(UdpError::NoSuchPcb),
                State::Open => {
                    if let Some(entry) = pcb.queue.pop_front() {
                        let n = entry.payload.len().min(buf.len());
                        buf[..n].copy_from_slice(&entry.payload[..n]);
                        return Ok((n, entry.foreign));
                    }
                }
            }
            let (g, result) = self.waits[id].sleep(guard, None);
            guard = g;
            result?;
        }
    }

    /// Mark the PCB CLOSING and wake every sleeper; the next caller to
    /// reacquire the mutex (the sleeper itself, here) completes the
    /// release.
    pub fn close(&self, id: usize) -> Result<(), UdpError> {
        let mut entries = self.entries.lock().unwrap();
        let pcb = entries.get_mut(id).ok_or(UdpError::NoSuchPcb)?;
        if pcb.state != State::Open {
            return Err(UdpError::NoSuchPcb);
        }
        pcb.state = State::Closing;
        drop(entries);
        self.waits[id].wakeup();
        Ok(())
    }

    /// UDP input: look up the PCB bound to `(dst, dst_port)` with
    /// wildcard matching, queue the datagram, wake the PCB.
    fn deliver(&self, dst: Ipv4Addr, dst_port: u16, foreign: Endpoint, payload: &[u8]) {
        let mut entries = self.entries.lock().unwrap();
        let Some((idx, pcb)) = entries
            .iter_mut()
            .enumerate()
            .find(|(_, p)| p.state == State::Open && p.local.port == dst_port && p.local.addr_matches(dst))
        else {
            log::trace!("udp: no pcb bound for {dst}:{dst_port}, dropping");
            return;
        };
        pcb.queue.push_back(RecvEntry {
            foreign,
            payload: payload.to_vec(),
        });
        drop(entries);
        self.waits[idx].wakeup();
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

impl Default for UdpPcbTable {
    fn default() -> Self {
        UdpPcbTable::new()
    }
}

fn build_header(src_port: u16, dst_port: u16, data: &[u8]) -> Vec<u8> {
    let total = UDP_HEADER_LEN + data.len();
    let mut datagram = Vec::with_capacity(total);
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dst_port.to_be_bytes());
    datagram.extend_from_slice(&(total as u16).to_be_bytes());
    datagram.extend_from_slice(&[0, 0]); // checksum placeholder
    datagram.extend_from_slice(data);
    datagram
}

/// Build the UDP datagram and hand it to IP output with protocol 17.
pub fn output(
    local: Endpoint,
    foreign: Endpoint,
    data: &[u8],
    dev_mgr: &DeviceManager,
    arp_cache: &ArpCache,
    routes: &RouteTable,
    ids: &IdGenerator,
) -> Result<(), UdpError> {
    if data.len() > MAX_PAYLOAD {
        return Err(UdpError::PayloadTooLarge);
    }
    let mut datagram = build_header(local.port, foreign.port, data);
    let sum = checksum::checksum_with_pseudo_header(local.addr, foreign.addr, ip::PROTO_UDP, &datagram);
    datagram[6..8].copy_from_slice(&sum.to_be_bytes());
    ip::output(dev_mgr, arp_cache, routes, ids, local.addr, foreign.addr, ip::PROTO_UDP, &datagram)?;
    Ok(())
}

/// The `ip::UpperProtocolRegistry` handler for protocol 17.
pub fn input(payload: &[u8], src: Ipv4Addr, dst: Ipv4Addr, _dev: usize, _iface: Interface, table: &UdpPcbTable) {
    if payload.len() < UDP_HEADER_LEN {
        return;
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let len = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    if len > payload.len() || len < UDP_HEADER_LEN {
        log::trace!("dropping udp datagram with inconsistent length");
        return;
    }
    let datagram = &payload[..len];
    if checksum::checksum_with_pseudo_header(src, dst, ip::PROTO_UDP, datagram) != 0 {
        log::trace!("dropping udp datagram with bad checksum");
        return;
    }
    table.deliver(dst, dst_port, Endpoint::new(src, src_port), &datagram[UDP_HEADER_LEN..]);
}
