//! ARP: Ethernet↔IPv4 resolver with a bounded, timed-out cache
//! (`spec.md` §4.3).
//!
//! Packet layout and cache behavior are grounded on
//! `examples/original_source/arp.c`: the 28-byte fixed binding, the
//! "merge" flag that is scoped to one call to `input` rather than
//! stored in the cache entry, and a fresh reply buffer rather than
//! reusing the inbound frame's storage (`spec.md` §9, resolved open
//! question: replies are built into a new `Vec`, never aliasing the
//! request). Packet encode/decode follows the style of
//! `build_arp_packet`/`process_incoming` in the teacher's
//! `kernel/src/net/arp.rs`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::addr::{Ipv4Addr, MacAddress};
use crate::device::{DeviceManager, DeviceType, Interface};
use crate::error::ArpResolve;
use crate::ethernet;

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;
const HLEN: u8 = 6;
const PLEN: u8 = 4;
const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;

pub const PACKET_LEN: usize = 28;
pub const CACHE_SIZE: usize = 32;
pub const ENTRY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Free,
    Incomplete,
    Resolved,
    Static,
}

struct CacheEntry {
    state: State,
    pa: Ipv4Addr,
    ha: MacAddress,
    timestamp: Instant,
}

impl CacheEntry {
    fn free() -> Self {
        CacheEntry {
            state: State::Free,
            pa: Ipv4Addr::ANY,
            ha: MacAddress::ZERO,
            timestamp: Instant::now(),
        }
    }
}

/// The ARP cache: a fixed-capacity table of `{state, pa, ha, timestamp}`.
pub struct ArpCache {
    entries: Mutex<Vec<CacheEntry>>,
}

impl ArpCache {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(CACHE_SIZE);
        entries.resize_with(CACHE_SIZE, CacheEntry::free);
        ArpCache {
            entries: Mutex::new(entries),
        }
    }

    /// Insert a STATIC entry that the periodic sweep never expires.
    pub fn insert_static(&self, pa: Ipv4Addr, ha: MacAddress) {
        let mut entries = self.entries.lock().unwrap();
        let idx = Self::alloc_locked(&mut entries, pa);
        entries[idx] = CacheEntry {
            state: State::Static,
            pa,
            ha,
            timestamp: Instant::now(),
        };
    }

    /// `resolve(iface, pa, out ha)`: look up or kick off resolution of
    /// `pa` on `dev`/`iface`.
    pub fn resolve(
        &self,
        dev_mgr: &DeviceManager,
        dev: usize,
        iface: Interface,
        pa: Ipv4Addr,
    ) -> ArpResolve {
        if dev_mgr.device_type(dev) != Some(DeviceType::Ethernet) {
            return ArpResolve::Error;
        }

        enum Action {
            ResendRequest,
            Found([u8; 6]),
            SendFreshRequest,
        }

        let action = {
            let mut entries = self.entries.lock().unwrap();
            match entries.iter_mut().find(|e| e.state != State::Free && e.pa == pa) {
                Some(entry) if entry.state == State::Incomplete => Action::ResendRequest,
                Some(entry) => Action::Found(entry.ha.0),
                None => {
                    let idx = Self::alloc_locked(&mut entries, pa);
                    entries[idx] = CacheEntry {
                        state: State::Incomplete,
                        pa,
                        ha: MacAddress::ZERO,
                        timestamp: Instant::now(),
                    };
                    Action::SendFreshRequest
                }
            }
        };

        match action {
            Action::Found(ha) => ArpResolve::Found(ha),
            Action::ResendRequest | Action::SendFreshRequest => {
                self.send_request(dev_mgr, dev, iface, pa);
                ArpResolve::Incomplete
            }
        }
    }

    /// Find a FREE slot, or evict the oldest entry if the table is full.
    fn alloc_locked(entries: &mut [CacheEntry], pa: Ipv4Addr) -> usize {
        if let Some(idx) = entries.iter().position(|e| e.state == State::Free) {
            return idx;
        }
        if let Some(idx) = entries.iter().position(|e| e.state != State::Free && e.pa == pa) {
            return idx;
        }
        entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.timestamp)
            .map(|(idx, _)| idx)
            .expect("cache has nonzero capacity")
    }

    fn send_request(&self, dev_mgr: &DeviceManager, dev: usize, iface: Interface, target_pa: Ipv4Addr) {
        let Some(sender_ha) = dev_mgr.hwaddr(dev) else { return };
        let packet = encode(OP_REQUEST, sender_ha, iface.unicast, MacAddress::ZERO, target_pa);
        let _ = dev_mgr.output(dev, ethernet::ETHERTYPE_ARP, MacAddress::BROADCAST, &packet);
        log::debug!("arp: who-has {target_pa} tell {}", iface.unicast);
    }

    /// On ARP input: validate, learn the sender, and reply if this
    /// request is `who-has` our own address.
    pub fn input(&self, dev_mgr: &DeviceManager, dev: usize, iface: Interface, payload: &[u8]) {
        let Some(pkt) = decode(payload) else { return };

        let mut merged = false;
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.iter_mut().find(|e| e.state != State::Free && e.pa == pkt.spa) {
                entry.ha = pkt.sha;
                entry.timestamp = Instant::now();
                if entry.state == State::Incomplete {
                    entry.state = State::Resolved;
                }
                merged = true;
            }
        }

        if pkt.tpa != iface.unicast {
            return;
        }

        if !merged {
            let mut entries = self.entries.lock().unwrap();
            let idx = Self::alloc_locked(&mut entries, pkt.spa);
            entries[idx] = CacheEntry {
                state: State::Resolved,
                pa: pkt.spa,
                ha: pkt.sha,
                timestamp: Instant::now(),
            };
        }

        if pkt.op == OP_REQUEST {
            let Some(our_ha) = dev_mgr.hwaddr(dev) else { return };
            let reply = encode(OP_REPLY, our_ha, iface.unicast, pkt.sha, pkt.spa);
            let _ = dev_mgr.output(dev, ethernet::ETHERTYPE_ARP, pkt.sha, &reply);
        }
    }

    /// Periodic sweep (every 1 s): delete non-FREE, non-STATIC entries
    /// older than [`ENTRY_TIMEOUT`].
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.state != State::Free
                && entry.state != State::Static
                && now.duration_since(entry.timestamp) >= ENTRY_TIMEOUT
            {
                *entry = CacheEntry::free();
            }
        }
    }

    #[cfg(test)]
    fn lookup(&self, pa: Ipv4Addr) -> Option<MacAddress> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.state != State::Free && e.pa == pa)
            .map(|e| e.ha)
    }

    #[cfg(test)]
    fn occupied_count(&self) -> usize {
        self.entries.lock().unwrap().iter().filter(|e| e.state != State::Free).count()
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        ArpCache::new()
    }
}

struct Packet {
    op: u16,
    sha: MacAddress,
    spa: Ipv4Addr,
    tpa: Ipv4Addr,
}

fn decode(payload: &[u8]) -> Option<Packet> {
    if payload.len() < PACKET_LEN {
        return None;
    }
    let hrd = u16::from_be_bytes([payload[0], payload[1]]);
    let pro = u16::from_be_bytes([payload[2], payload[3]]);
    let hln = payload[4];
    let pln = payload[5];
    let op = u16::from_be_bytes([payload[6], payload[7]]);
    if hrd != HTYPE_ETHERNET || pro != PTYPE_IPV4 || hln != HLEN || pln != PLEN {
        return None;
    }
    if op != OP_REQUEST && op != OP_REPLY {
        return None;
    }
    let sha = MacAddress::new(payload[8..14].try_into().unwrap());
    let spa = Ipv4Addr(payload[14..18].try_into().unwrap());
    let tpa = Ipv4Addr(payload[24..28].try_into().unwrap());
    Some(Packet { op, sha, spa, tpa })
}

fn encode(op: u16, sha: MacAddress, spa: Ipv4Addr, tha: MacAddress, tpa: Ipv4Addr) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(PACKET_LEN);
    pkt.extend_from_slice(&HTYPE_ETHERNET.to_be_bytes());
    pkt.extend_from_slice(&PTYPE_IPV4.to_be_bytes());
    pkt.push(HLEN);
    pkt.push(PLEN);
    pkt.extend_from_slice(&op.to_be_bytes());
    pkt.extend_from_slice(sha.as_bytes());
    pkt.extend_from_slice(&spa.octets());
    pkt.extend_from_slice(tha.as_bytes());
    pkt.extend_from_slice(&tpa.octets());
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let sha = MacAddress::new([1, 2, 3, 4, 5, 6]);
        let spa = Ipv4Addr::new(192, 0, 2, 1);
        let tha = MacAddress::new([6, 5, 4, 3, 2, 1]);
        let tpa = Ipv4Addr::new(192, 0, 2, 2);
        let pkt = encode(OP_REPLY, sha, spa, tha, tpa);
        assert_eq!(pkt.len(), PACKET_LEN);
        let decoded = decode(&pkt).unwrap();
        assert_eq!(decoded.op, OP_REPLY);
        assert_eq!(decoded.sha, sha);
        assert_eq!(decoded.spa, spa);
        assert_eq!(decoded.tpa, tpa);
    }

    #[test]
    fn rejects_non_ethernet_ipv4_pairing() {
        let mut pkt = encode(OP_REQUEST, MacAddress::ZERO, Ipv4Addr::ANY, MacAddress::ZERO, Ipv4Addr::ANY);
        pkt[2] = 0x08;
        pkt[3] = 0x06; // bogus protocol type
        assert!(decode(&pkt).is_none());
    }

    #[test]
    fn cache_evicts_oldest_when_full() {
        let cache = ArpCache::new();
        for i in 0..CACHE_SIZE {
            cache.insert_static(Ipv4Addr::new(10, 0, 0, i as u8), MacAddress::new([0, 0, 0, 0, 0, i as u8]));
        }
        assert_eq!(cache.occupied_count(), CACHE_SIZE);
        // every slot full of STATIC entries; next insert must still evict one
        cache.insert_static(Ipv4Addr::new(10, 0, 1, 0), MacAddress::new([9, 9, 9, 9, 9, 9]));
        assert_eq!(cache.occupied_count(), CACHE_SIZE);
        assert_eq!(
            cache.lookup(Ipv4Addr::new(10, 0, 1, 0)),
            Some(MacAddress::new([9, 9, 9, 9, 9, 9]))
        );
    }

    #[test]
    fn sweep_preserves_static_entries() {
        let cache = ArpCache::new();
        cache.insert_static(Ipv4Addr::new(192, 0, 2, 9), MacAddress::new([1; 6]));
        cache.sweep();
        assert_eq!(cache.lookup(Ipv4Addr::new(192, 0, 2, 9)), Some(MacAddress::new([1; 6])));
    }
}
