//! The loopback device: `transmit` hands the frame straight back to its
//! own receive path instead of putting it on a wire (`spec.md` §6,
//! "Loopback additionally simulates receive by self-enqueueing and
//! raising an IRQ").
//!
//! Grounded on the `NetworkDevice` trait object in the teacher's
//! `kernel/src/drivers/net/mod.rs`; the self-enqueue/IRQ plumbing
//! follows `crate::intr::Intr::raise_irq`, the same path a real driver
//! uses to tell the worker thread a frame arrived.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use crate::addr::MacAddress;
use crate::device::{Device, DeviceFlags, DeviceType};
use crate::error::DeviceError;
use crate::intr::Event;

/// A generous MTU since loopback frames never cross a real wire.
pub const MTU: usize = 65535;

/// Shared handle to a loopback device's pending-receive queue, handed to
/// the IRQ handler registered for it at `stack` construction time.
pub type RxQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

pub struct Loopback {
    hwaddr: MacAddress,
    rx: RxQueue,
    irq: u32,
    sender: Sender<Event>,
}

impl Loopback {
    pub fn new(irq: u32, sender: Sender<Event>) -> Self {
        Loopback {
            hwaddr: MacAddress::ZERO,
            rx: Arc::new(Mutex::new(VecDeque::new())),
            irq,
            sender,
        }
    }

    /// The queue the device pushes into on `transmit`; the caller clones
    /// this before registering the device so it can drain the same queue
    /// from the IRQ handler.
    pub fn rx_handle(&self) -> RxQueue {
        self.rx.clone()
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }
}

impl Device for Loopback {
    fn device_type(&self) -> DeviceType {
        DeviceType::Loopback
    }

    fn hwaddr(&self) -> MacAddress {
        self.hwaddr
    }

    fn broadcast_hwaddr(&self) -> MacAddress {
        MacAddress::BROADCAST
    }

    fn mtu(&self) -> usize {
        MTU
    }

    fn capability_flags(&self) -> DeviceFlags {
        DeviceFlags::LOOPBACK
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        self.rx.lock().unwrap().push_back(frame.to_vec());
        let _ = self.sender.send(Event::Irq(self.irq));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn transmit_enqueues_for_its_own_receive_path_and_raises_its_irq() {
        let (tx, rx_chan) = mpsc::channel();
        let mut dev = Loopback::new(9, tx);
        let rx = dev.rx_handle();

        dev.transmit(b"hello").unwrap();

        assert_eq!(rx.lock().unwrap().pop_front(), Some(b"hello".to_vec()));
        assert_eq!(rx_chan.recv().unwrap(), Event::Irq(9));
    }

    #[test]
    fn capability_flags_are_loopback_only() {
        let (tx, _rx) = mpsc::channel();
        let dev = Loopback::new(0, tx);
        assert_eq!(dev.capability_flags(), DeviceFlags::LOOPBACK);
    }
}
