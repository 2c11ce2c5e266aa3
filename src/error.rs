//! Error types shared across the stack.
//!
//! Each subsystem gets its own small enum with a `Display` impl, in the
//! style of `NetError`/`NetworkError` in the kernel this crate grew out
//! of — no `thiserror`, just plain enums callers can match on.

use std::fmt;

/// Errors produced by the scheduling / cooperative-sleep layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// The sleeper was woken by `sched_interrupt` rather than `sched_wakeup`.
    Interrupted,
    /// A deadline passed before the sleeper was woken.
    TimedOut,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Interrupted => write!(f, "interrupted"),
            SchedError::TimedOut => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for SchedError {}

/// Errors from the device / protocol dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    NotFound,
    AlreadyUp,
    AlreadyDown,
    TooLarge,
    IfaceFamilyTaken,
    ProtocolTaken,
    IrqConflict,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotFound => write!(f, "device not found"),
            DeviceError::AlreadyUp => write!(f, "device already up"),
            DeviceError::AlreadyDown => write!(f, "device already down"),
            DeviceError::TooLarge => write!(f, "frame exceeds device MTU"),
            DeviceError::IfaceFamilyTaken => write!(f, "interface family already bound on this device"),
            DeviceError::ProtocolTaken => write!(f, "protocol type already registered"),
            DeviceError::IrqConflict => write!(f, "irq number already claimed by a non-shared handler"),
        }
    }
}

impl std::error::Error for DeviceError {}

/// The three-valued result of ARP resolution (`spec.md` §4.3/§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpResolve {
    Found([u8; 6]),
    Incomplete,
    Error,
}

/// Errors from the IPv4 layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpError {
    NoRoute,
    Unreachable,
    SourceMismatch,
    TooLarge,
    ArpIncomplete,
    ArpError,
    BroadcastWithoutSource,
}

impl fmt::Display for IpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpError::NoRoute => write!(f, "no route to host"),
            IpError::Unreachable => write!(f, "network unreachable"),
            IpError::SourceMismatch => write!(f, "source address does not match outgoing interface"),
            IpError::TooLarge => write!(f, "payload exceeds interface MTU"),
            IpError::ArpIncomplete => write!(f, "address resolution in progress"),
            IpError::ArpError => write!(f, "address resolution failed"),
            IpError::BroadcastWithoutSource => write!(f, "limited broadcast requires a concrete source address"),
        }
    }
}

impl std::error::Error for IpError {}

/// Errors from the UDP PCB layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    NoSuchPcb,
    AddressInUse,
    NoEphemeralPort,
    PayloadTooLarge,
    Closing,
    Ip(IpError),
    Sched(SchedError),
}

impl From<IpError> for UdpError {
    fn from(e: IpError) -> Self {
        UdpError::Ip(e)
    }
}

impl From<SchedError> for UdpError {
    fn from(e: SchedError) -> Self {
        UdpError::Sched(e)
    }
}

impl fmt::Display for UdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdpError::NoSuchPcb => write!(f, "no such UDP pcb"),
            UdpError::AddressInUse => write!(f, "address already in use"),
            UdpError::NoEphemeralPort => write!(f, "no ephemeral port available"),
            UdpError::PayloadTooLarge => write!(f, "payload too large for a UDP datagram"),
            UdpError::Closing => write!(f, "pcb is closing"),
            UdpError::Ip(e) => write!(f, "{e}"),
            UdpError::Sched(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for UdpError {}

/// Errors from the TCP PCB layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    NoSuchPcb,
    PcbTableFull,
    AddressInUse,
    NotEstablished,
    ConnectionRefused,
    ConnectionReset,
    NetworkUnreachable,
    Sched(SchedError),
}

impl From<SchedError> for TcpError {
    fn from(e: SchedError) -> Self {
        TcpError::Sched(e)
    }
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpError::NoSuchPcb => write!(f, "no such TCP pcb"),
            TcpError::PcbTableFull => write!(f, "TCP pcb table is full"),
            TcpError::AddressInUse => write!(f, "address already in use"),
            TcpError::NotEstablished => write!(f, "connection is not established"),
            TcpError::ConnectionRefused => write!(f, "connection refused"),
            TcpError::ConnectionReset => write!(f, "connection reset by peer"),
            TcpError::NetworkUnreachable => write!(f, "network unreachable"),
            TcpError::Sched(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TcpError {}
