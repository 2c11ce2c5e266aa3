//! Device registration, up/down, MTU-checked transmit, and per-family
//! interface lookup (`spec.md` §3/§4.2).
//!
//! Grounded on the `NetworkDevice`/`NetworkManager` pair in the
//! teacher's `kernel/src/drivers/net/mod.rs`: a trait object per
//! device held in a registry behind one lock, devices addressed by a
//! name assigned at registration time. Translated from `BTreeMap<String,
//! Box<dyn NetworkDevice>>` + `spin::Mutex` to a `Vec` indexed by a
//! stable integer handle (so `net0`, `net1`, ... order is exactly
//! registration order) behind a `std::sync::Mutex`.

use std::fmt;
use std::sync::Mutex;

use bitflags::bitflags;

use crate::addr::{Ipv4Addr, MacAddress};
use crate::error::DeviceError;
use crate::ethernet;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct DeviceFlags: u32 {
        const UP = 0b0001;
        const NEED_ARP = 0b0010;
        const LOOPBACK = 0b0100;
        const BROADCAST = 0b1000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Loopback,
    Dummy,
    Ethernet,
}

/// Driver hook a device implements: bring the link up/down and hand a
/// fully-framed Ethernet frame to the wire (or its simulated loopback
/// equivalent).
pub trait Device: Send {
    fn device_type(&self) -> DeviceType;
    fn hwaddr(&self) -> MacAddress;
    fn broadcast_hwaddr(&self) -> MacAddress;
    fn mtu(&self) -> usize;
    /// Static capability flags (`NEED_ARP`/`LOOPBACK`/`BROADCAST`); `UP`
    /// is tracked by the registry, not the driver.
    fn capability_flags(&self) -> DeviceFlags;
    fn open(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
    fn transmit(&mut self, frame: &[u8]) -> Result<(), DeviceError>;
}

/// A network-layer endpoint bound to a device (`spec.md` §3 "Interface").
#[derive(Debug, Clone, Copy)]
pub struct Interface {
    pub unicast: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

impl Interface {
    pub fn new(unicast: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let broadcast = Ipv4Addr::from_u32(unicast.to_u32() | !netmask.to_u32());
        Interface {
            unicast,
            netmask,
            broadcast,
        }
    }
}

struct Entry {
    name: String,
    up: bool,
    device: Box<dyn Device>,
    iface: Option<Interface>,
}

/// The device registry: one entry per registered device, addressed by
/// the index returned from [`DeviceManager::register`].
pub struct DeviceManager {
    entries: Mutex<Vec<Entry>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        DeviceManager {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a device, assigning it the next `netN` name in order.
    pub fn register(&self, device: Box<dyn Device>) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let index = entries.len();
        let name = format!("net{index}");
        log::debug!("registered device {name} ({:?})", device.device_type());
        entries.push(Entry {
            name,
            up: false,
            device,
            iface: None,
        });
        index
    }

    pub fn name(&self, index: usize) -> Option<String> {
        self.entries.lock().unwrap().get(index).map(|e| e.name.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.entries.lock().unwrap().iter().position(|e| e.name == name)
    }

    pub fn open(&self, index: usize) -> Result<(), DeviceError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(index).ok_or(DeviceError::NotFound)?;
        if entry.up {
            return Err(DeviceError::AlreadyUp);
        }
        entry.device.open()?;
        entry.up = true;
        log::info!("{} up", entry.name);
        Ok(())
    }

    pub fn close(&self, index: usize) -> Result<(), DeviceError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(index).ok_or(DeviceError::NotFound)?;
        if !entry.up {
            return Err(DeviceError::AlreadyDown);
        }
        entry.device.close()?;
        entry.up = false;
        log::info!("{} down", entry.name);
        Ok(())
    }

    /// Bind an interface to a device; each device may carry at most one
    /// (this crate speaks only IPv4, so "one per address family" means
    /// "at most one, period").
    pub fn add_iface(&self, index: usize, iface: Interface) -> Result<(), DeviceError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(index).ok_or(DeviceError::NotFound)?;
        if entry.iface.is_some() {
            return Err(DeviceError::IfaceFamilyTaken);
        }
        entry.iface = Some(iface);
        Ok(())
    }

    pub fn get_iface(&self, index: usize) -> Option<Interface> {
        self.entries.lock().unwrap().get(index).and_then(|e| e.iface)
    }

    /// Linear search for the device whose bound interface carries
    /// `addr` as its unicast address.
    pub fn find_iface_by_unicast(&self, addr: Ipv4Addr) -> Option<Interface> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find_map(|e| e.iface.filter(|i| i.unicast == addr))
    }

    /// Close every currently-UP device (`stack_shutdown`).
    pub fn close_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.up {
                if let Err(e) = entry.device.close() {
                    log::warn!("{} failed to close cleanly: {e}", entry.name);
                }
                entry.up = false;
            }
        }
    }

    pub fn is_up(&self, index: usize) -> bool {
        self.entries.lock().unwrap().get(index).map(|e| e.up).unwrap_or(false)
    }

    pub fn mtu(&self, index: usize) -> Option<usize> {
        self.entries.lock().unwrap().get(index).map(|e| e.device.mtu())
    }

    pub fn hwaddr(&self, index: usize) -> Option<MacAddress> {
        self.entries.lock().unwrap().get(index).map(|e| e.device.hwaddr())
    }

    pub fn broadcast_hwaddr(&self, index: usize) -> Option<MacAddress> {
        self.entries.lock().unwrap().get(index).map(|e| e.device.broadcast_hwaddr())
    }

    pub fn capability_flags(&self, index: usize) -> Option<DeviceFlags> {
        self.entries.lock().unwrap().get(index).map(|e| e.device.capability_flags())
    }

    pub fn device_type(&self, index: usize) -> Option<DeviceType> {
        self.entries.lock().unwrap().get(index).map(|e| e.device.device_type())
    }

    /// `output(type, data, len, dst)`: require `UP`, require
    /// `len ≤ MTU`, wrap in an Ethernet header, hand to the driver.
    pub fn output(&self, index: usize, ethertype: u16, dst: MacAddress, data: &[u8]) -> Result<(), DeviceError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(index).ok_or(DeviceError::NotFound)?;
        if !entry.up {
            return Err(DeviceError::AlreadyDown);
        }
        if data.len() > entry.device.mtu() {
            return Err(DeviceError::TooLarge);
        }
        let frame = ethernet::encode(dst, entry.device.hwaddr(), ethertype, data);
        entry.device.transmit(&frame)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        DeviceManager::new()
    }
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock().unwrap();
        f.debug_list().entries(entries.iter().map(|e| &e.name)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDevice {
        mtu: usize,
        up_calls: u32,
    }

    impl Device for StubDevice {
        fn device_type(&self) -> DeviceType {
            DeviceType::Dummy
        }
        fn hwaddr(&self) -> MacAddress {
            MacAddress::new([0, 0, 0, 0, 0, 1])
        }
        fn broadcast_hwaddr(&self) -> MacAddress {
            MacAddress::BROADCAST
        }
        fn mtu(&self) -> usize {
            self.mtu
        }
        fn capability_flags(&self) -> DeviceFlags {
            DeviceFlags::NEED_ARP | DeviceFlags::BROADCAST
        }
        fn open(&mut self) -> Result<(), DeviceError> {
            self.up_calls += 1;
            Ok(())
        }
        fn close(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn transmit(&mut self, _frame: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn registration_assigns_netn_names_in_order() {
        let mgr = DeviceManager::new();
        let a = mgr.register(Box::new(StubDevice { mtu: 1500, up_calls: 0 }));
        let b = mgr.register(Box::new(StubDevice { mtu: 1500, up_calls: 0 }));
        assert_eq!(mgr.name(a).unwrap(), "net0");
        assert_eq!(mgr.name(b).unwrap(), "net1");
    }

    #[test]
    fn double_open_is_an_error() {
        let mgr = DeviceManager::new();
        let idx = mgr.register(Box::new(StubDevice { mtu: 1500, up_calls: 0 }));
        mgr.open(idx).unwrap();
        assert_eq!(mgr.open(idx), Err(DeviceError::AlreadyUp));
    }

    #[test]
    fn output_rejects_oversized_payload() {
        let mgr = DeviceManager::new();
        let idx = mgr.register(Box::new(StubDevice { mtu: 4, up_calls: 0 }));
        mgr.open(idx).unwrap();
        let err = mgr
            .output(idx, ethernet::ETHERTYPE_IPV4, MacAddress::BROADCAST, &[0u8; 5])
            .unwrap_err();
        assert_eq!(err, DeviceError::TooLarge);
    }

    #[test]
    fn output_requires_up() {
        let mgr = DeviceManager::new();
        let idx = mgr.register(Box::new(StubDevice { mtu: 1500, up_calls: 0 }));
        let err = mgr
            .output(idx, ethernet::ETHERTYPE_IPV4, MacAddress::BROADCAST, &[0u8; 5])
            .unwrap_err();
        assert_eq!(err, DeviceError::AlreadyDown);
    }

    #[test]
    fn second_iface_on_same_device_is_rejected() {
        let mgr = DeviceManager::new();
        let idx = mgr.register(Box::new(StubDevice { mtu: 1500, up_calls: 0 }));
        let iface = Interface::new(Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(255, 255, 255, 0));
        mgr.add_iface(idx, iface).unwrap();
        assert_eq!(mgr.add_iface(idx, iface), Err(DeviceError::IfaceFamilyTaken));
    }
}
