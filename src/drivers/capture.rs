//! A test-only device: records every transmitted frame and lets a test
//! inject a frame as if it had been received, without any real wire.
//!
//! Grounded on the same `Device` seam as [`crate::drivers::loopback::Loopback`],
//! but one-way: `transmit` only records (it does not self-enqueue), and
//! `inject` plays the part a real driver's receive interrupt would.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use crate::addr::MacAddress;
use crate::device::{Device, DeviceFlags, DeviceType};
use crate::error::DeviceError;
use crate::intr::Event;

pub type SentFrames = Arc<Mutex<Vec<Vec<u8>>>>;
pub type RxQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// An Ethernet-shaped device for scenario tests: configurable MTU,
/// hardware address, and capability flags so both ARP-using and
/// ARP-free topologies can be exercised.
pub struct Capture {
    hwaddr: MacAddress,
    mtu: usize,
    flags: DeviceFlags,
    sent: SentFrames,
    rx: RxQueue,
    irq: u32,
    sender: Sender<Event>,
}

impl Capture {
    pub fn new(hwaddr: MacAddress, mtu: usize, flags: DeviceFlags, irq: u32, sender: Sender<Event>) -> Self {
        Capture {
            hwaddr,
            mtu,
            flags,
            sent: Arc::new(Mutex::new(Vec::new())),
            rx: Arc::new(Mutex::new(VecDeque::new())),
            irq,
            sender,
        }
    }

    pub fn sent_frames(&self) -> SentFrames {
        self.sent.clone()
    }

    pub fn rx_handle(&self) -> RxQueue {
        self.rx.clone()
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Simulate a frame arriving on the wire: queue it and raise this
    /// device's IRQ, exactly as a real driver's interrupt handler would.
    pub fn inject(&self, frame: Vec<u8>) {
        self.rx.lock().unwrap().push_back(frame);
        let _ = self.sender.send(Event::Irq(self.irq));
    }
}

impl Device for Capture {
    fn device_type(&self) -> DeviceType {
        DeviceType::Ethernet
    }

    fn hwaddr(&self) -> MacAddress {
        self.hwaddr
    }

    fn broadcast_hwaddr(&self) -> MacAddress {
        MacAddress::BROADCAST
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn capability_flags(&self) -> DeviceFlags {
        self.flags
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}
