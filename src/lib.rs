//! A userspace TCP/IP protocol stack over virtual link devices.
//!
//! This crate implements ARP, IPv4 with routing, ICMP echo, UDP with
//! blocking sockets, and a minimal RFC 793 TCP, all driven by a single
//! interrupt-servicing worker thread plus any number of application
//! threads calling the blocking socket-like methods on [`Stack`].
//!
//! The module layout mirrors the component table of the design this
//! crate grew out of: [`intr`] and [`timer`] are the interrupt core and
//! timer wheel, [`sched`] is the cooperative sleep/wake/interrupt
//! bundle application threads suspend on, [`device`] and [`protocol`]
//! are the device registry and link-protocol dispatch, and [`arp`],
//! [`ip`], [`icmp`], [`udp`], [`tcp`] are the protocols proper.

pub mod addr;
pub mod arp;
pub mod checksum;
pub mod device;
pub mod drivers;
pub mod error;
pub mod ethernet;
pub mod icmp;
pub mod intr;
pub mod ip;
pub mod protocol;
pub mod sched;
pub mod tcp;
pub mod timer;
pub mod udp;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::addr::{Endpoint, Ipv4Addr};
use crate::arp::ArpCache;
use crate::device::{Device, DeviceFlags, DeviceManager, Interface};
use crate::drivers::capture::Capture;
use crate::drivers::loopback::Loopback;
use crate::error::{TcpError, UdpError};
use crate::intr::{Handlers, Intr};
use crate::ip::{IdGenerator, RouteTable, UpperProtocolRegistry};
use crate::protocol::ProtocolRegistry;
use crate::tcp::TcpPcbTable;
use crate::timer::TimerWheel;
use crate::udp::UdpPcbTable;

type RxQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// The process-wide singleton holding every shared table this stack
/// needs: device registry, ARP cache, route table, protocol dispatch
/// registries, the two PCB tables, and the IP datagram-id counter.
///
/// Device/interface registration order is observable through the
/// generated `net0`, `net1`, ... names, so this is built once per
/// process via [`Stack::init`] and handed around as `&'static Stack`
/// rather than threaded explicitly through every call.
pub struct Stack {
    pub devices: DeviceManager,
    pub arp: ArpCache,
    pub routes: RouteTable,
    pub link_protocols: ProtocolRegistry,
    pub upper_protocols: UpperProtocolRegistry,
    pub ids: IdGenerator,
    pub udp: UdpPcbTable,
    pub tcp: TcpPcbTable,
    intr: Intr,
    timers: TimerWheel,
    receiver: Mutex<Option<std::sync::mpsc::Receiver<intr::Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_irq: AtomicU32,
}

impl Stack {
    fn new() -> Self {
        let (intr, receiver) = Intr::new();
        Stack {
            devices: DeviceManager::new(),
            arp: ArpCache::new(),
            routes: RouteTable::new(),
            link_protocols: ProtocolRegistry::new(),
            upper_protocols: UpperProtocolRegistry::new(),
            ids: IdGenerator::new(),
            udp: UdpPcbTable::new(),
            tcp: TcpPcbTable::new(),
            intr,
            timers: TimerWheel::new(),
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            next_irq: AtomicU32::new(1),
        }
    }

    /// `stack_init`: build a fresh stack, leak it to `'static`, and
    /// register the link-protocol (ARP, IPv4) and upper-protocol
    /// (ICMP, UDP, TCP) handlers. Call once per process.
    pub fn init() -> &'static Stack {
        let stack: &'static Stack = Box::leak(Box::new(Stack::new()));
        stack.register_protocols();
        stack
    }

    fn register_protocols(&'static self) {
        self.link_protocols
            .register(ethernet::ETHERTYPE_ARP, move |data, dev| {
                if let Some(iface) = self.devices.get_iface(dev) {
                    self.arp.input(&self.devices, dev, iface, data);
                }
            })
            .expect("arp link-protocol registered exactly once");

        self.link_protocols
            .register(ethernet::ETHERTYPE_IPV4, move |data, dev| {
                if let Some(iface) = self.devices.get_iface(dev) {
                    ip::input(data, dev, iface, &self.upper_protocols);
                }
            })
            .expect("ipv4 link-protocol registered exactly once");

        self.upper_protocols
            .register(ip::PROTO_ICMP, move |payload, src, dst, _dev, iface| {
                icmp::input(payload, src, dst, iface, &self.devices, &self.arp, &self.routes, &self.ids);
            })
            .expect("icmp upper-protocol registered exactly once");

        self.upper_protocols
            .register(ip::PROTO_UDP, move |payload, src, dst, dev, iface| {
                udp::input(payload, src, dst, dev, iface, &self.udp);
            })
            .expect("udp upper-protocol registered exactly once");

        self.upper_protocols
            .register(ip::PROTO_TCP, move |payload, src, dst, _dev, iface| {
                self.tcp.input(payload, src, dst, iface, &self.devices, &self.arp, &self.routes, &self.ids);
            })
            .expect("tcp upper-protocol registered exactly once");
    }

    /// `stack_run`: start the 1 s ARP/TCP sweeps and spawn the
    /// interrupt worker thread. Call once, after wiring up devices.
    pub fn run(&'static self) {
        self.timers.register("arp-sweep", Duration::from_secs(1), move || self.arp.sweep());
        self.timers.register("tcp-retransmit", Duration::from_secs(1), move || {
            self.tcp.retransmit_tick(&self.devices, &self.arp, &self.routes, &self.ids);
        });

        let handlers = Handlers {
            softirq: Box::new(move || self.link_protocols.drain()),
            timer_tick: Box::new(move || self.timers.tick()),
            application: Box::new(move || {
                self.udp.interrupt_all();
                self.tcp.interrupt_all();
            }),
        };
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .expect("Stack::run called more than once");
        let handle = intr::spawn(&self.intr, receiver, handlers);
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// `stack_shutdown`: broadcast interrupt to every blocked
    /// application task, terminate and join the worker, then close
    /// every device.
    pub fn shutdown(&self) {
        self.udp.interrupt_all();
        self.tcp.interrupt_all();
        self.intr.terminate();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.devices.close_all();
    }

    fn alloc_irq(&self) -> u32 {
        self.next_irq.fetch_add(1, Ordering::SeqCst)
    }

    /// Register an Ethernet-framed device, wiring its receive queue to
    /// an IRQ handler that decodes the Ethernet header and feeds the
    /// payload to link-protocol dispatch, raising the softirq exactly
    /// when a frame was actually queued for a known protocol.
    fn add_device(&'static self, device: Box<dyn Device>, rx: RxQueue, irq: u32) -> usize {
        let idx = self.devices.register(device);
        self.intr
            .request_irq(irq, false, move || loop {
                let frame = rx.lock().unwrap().pop_front();
                match frame {
                    Some(frame) => {
                        if let Some((hdr, payload)) = ethernet::decode(&frame) {
                            if self.link_protocols.input_handler(hdr.ethertype, payload, idx) {
                                self.intr.raise_softirq();
                            }
                        }
                    }
                    None => break,
                }
            })
            .expect("each device gets a freshly allocated, non-conflicting irq");
        idx
    }

    /// Bring up a [`Loopback`] device bound to `unicast/netmask` and
    /// return its device index.
    pub fn add_loopback(&'static self, unicast: Ipv4Addr, netmask: Ipv4Addr) -> usize {
        let irq = self.alloc_irq();
        let dev = Loopback::new(irq, self.intr.sender());
        let rx = dev.rx_handle();
        let idx = self.add_device(Box::new(dev), rx, irq);
        let iface = Interface::new(unicast, netmask);
        self.devices.add_iface(idx, iface).expect("freshly registered device has no interface yet");
        self.routes.add_interface_route(iface, idx);
        self.devices.open(idx).expect("freshly registered device is not already up");
        idx
    }

    /// Bring up a [`Capture`] test device (an Ethernet-shaped device
    /// with no real wire) bound to `unicast/netmask`, returning its
    /// device index and the handles a test uses to inject/inspect
    /// frames.
    pub fn add_capture(
        &'static self,
        hwaddr: crate::addr::MacAddress,
        mtu: usize,
        flags: DeviceFlags,
        unicast: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> (usize, Arc<Mutex<Vec<Vec<u8>>>>, RxQueue) {
        let irq = self.alloc_irq();
        let dev = Capture::new(hwaddr, mtu, flags, irq, self.intr.sender());
        let sent = dev.sent_frames();
        let rx = dev.rx_handle();
        let idx = self.add_device(Box::new(dev), rx.clone(), irq);
        let iface = Interface::new(unicast, netmask);
        self.devices.add_iface(idx, iface).expect("freshly registered device has no interface yet");
        self.routes.add_interface_route(iface, idx);
        self.devices.open(idx).expect("freshly registered device is not already up");
        (idx, sent, rx)
    }

    pub fn set_default_gateway(&self, dev: usize, gateway: Ipv4Addr) {
        self.routes.set_default_gateway(dev, gateway);
    }

    // -- UDP user API (`spec.md` §6) -----------------------------------

    pub fn udp_open(&self) -> Result<usize, UdpError> {
        self.udp.open()
    }

    pub fn udp_bind(&self, id: usize, local: Endpoint) -> Result<(), UdpError> {
        self.udp.bind(id, local)
    }

    pub fn udp_sendto(&self, id: usize, data: &[u8], foreign: Endpoint) -> Result<usize, UdpError> {
        self.udp.sendto(id, data, foreign, &self.devices, &self.arp, &self.routes, &self.ids)
    }

    pub fn udp_recvfrom(&self, id: usize, buf: &mut [u8]) -> Result<(usize, Endpoint), UdpError> {
        self.udp.recvfrom(id, buf)
    }

    pub fn udp_close(&self, id: usize) -> Result<(), UdpError> {
        self.udp.close(id)
    }

    // -- TCP user API (`spec.md` §6) -----------------------------------

    fn iface_for_tcp_open(&self, local: Endpoint, foreign: Option<Endpoint>) -> Result<Interface, TcpError> {
        if !local.addr.is_unspecified() {
            return self
                .devices
                .find_iface_by_unicast(local.addr)
                .ok_or(TcpError::NetworkUnreachable);
        }
        let dst = foreign.ok_or(TcpError::NetworkUnreachable)?.addr;
        let route = self.routes.lookup(dst).ok_or(TcpError::NetworkUnreachable)?;
        self.devices.get_iface(route.dev).ok_or(TcpError::NetworkUnreachable)
    }

    /// `tcp_open_rfc793(local, foreign, active)`.
    pub fn tcp_open_rfc793(&self, local: Endpoint, foreign: Option<Endpoint>, active: bool) -> Result<usize, TcpError> {
        let iface = self.iface_for_tcp_open(local, foreign)?;
        self.tcp
            .open_rfc793(local, foreign, active, iface, &self.devices, &self.arp, &self.routes, &self.ids)
    }

    pub fn tcp_send(&self, id: usize, data: &[u8]) -> Result<usize, TcpError> {
        self.tcp.send(id, data, &self.devices, &self.arp, &self.routes, &self.ids)
    }

    pub fn tcp_receive(&self, id: usize, buf: &mut [u8]) -> Result<usize, TcpError> {
        self.tcp.receive(id, buf)
    }

    pub fn tcp_close(&self, id: usize) -> Result<(), TcpError> {
        self.tcp.close(id, &self.devices, &self.arp, &self.routes, &self.ids)
    }
}
