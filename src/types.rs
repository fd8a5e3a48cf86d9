//! Core types for the DF synchronization protocol.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::Error;

/// Maximum VRF name length on the wire (fixed-size, NUL-padded field).
pub const VRF_NAME_LEN: usize = 36;

/// Maximum interface name length on the wire (fixed-size, NUL-padded field).
pub const INTF_NAME_LEN: usize = 16;

/// Route metric sentinel meaning "unreachable / no peer information".
pub const ROUTE_METRIC_MAX: u32 = u32::MAX;

/// A multicast flow: a (source, group) address pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    /// Multicast source address.
    pub source: Ipv4Addr,
    /// Multicast group address.
    pub group: Ipv4Addr,
}

impl Flow {
    /// Creates a new flow from a source and group address.
    pub fn new(source: Ipv4Addr, group: Ipv4Addr) -> Self {
        Self { source, group }
    }
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.source, self.group)
    }
}

fn bounded_name(s: String, max: usize) -> Result<String, Error> {
    // One byte is reserved for the NUL terminator in the wire field.
    if s.len() >= max {
        return Err(Error::InvalidName(format!(
            "{:?} exceeds {} bytes",
            s,
            max - 1
        )));
    }
    Ok(s)
}

/// A VRF name, bounded to the fixed-size wire field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VrfName(String);

impl VrfName {
    /// Creates a VRF name, rejecting names too long for the wire format.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        Ok(Self(bounded_name(name.into(), VRF_NAME_LEN)?))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for VrfName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for VrfName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An interface name, bounded to the fixed-size wire field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceName(String);

impl InterfaceName {
    /// Creates an interface name, rejecting names too long for the wire format.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        Ok(Self(bounded_name(name.into(), INTF_NAME_LEN)?))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for InterfaceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Advisory MLAG role reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MlagRole {
    /// MLAG is not set up on this machine.
    #[default]
    None,
    /// This instance is the primary.
    Primary,
    /// This instance is the secondary.
    Secondary,
}

impl From<MlagRole> for u32 {
    fn from(r: MlagRole) -> Self {
        match r {
            MlagRole::None => 0,
            MlagRole::Primary => 1,
            MlagRole::Secondary => 2,
        }
    }
}

impl TryFrom<u32> for MlagRole {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MlagRole::None),
            1 => Ok(MlagRole::Primary),
            2 => Ok(MlagRole::Secondary),
            _ => Err(Error::Protocol(format!("unknown MLAG role: {}", v))),
        }
    }
}

impl std::fmt::Display for MlagRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MlagRole::None => write!(f, "NONE"),
            MlagRole::Primary => write!(f, "PRIMARY"),
            MlagRole::Secondary => write!(f, "SECONDARY"),
        }
    }
}

/// Peer routing-instance process state, as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// The peer instance is down or unreachable.
    Down,
    /// The peer instance is up and running.
    Running,
}

impl From<PeerState> for u32 {
    fn from(s: PeerState) -> Self {
        match s {
            PeerState::Down => 0,
            PeerState::Running => 1,
        }
    }
}

impl TryFrom<u32> for PeerState {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(PeerState::Down),
            1 => Ok(PeerState::Running),
            _ => Err(Error::Protocol(format!("unknown peer state: {}", v))),
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Down => write!(f, "DOWN"),
            PeerState::Running => write!(f, "RUNNING"),
        }
    }
}

/// Broker link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection; the retry timer may be armed.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The broker socket is established.
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "DISCONNECTED"),
            LinkState::Connecting => write!(f, "CONNECTING"),
            LinkState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Desired forwarding state for a flow on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfState {
    /// This instance is the designated forwarder.
    Forwarding,
    /// The peer instance forwards; this one stays out of the OIL.
    NotForwarding,
}

/// Which subsystem installed an outgoing interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OifSource {
    /// Installed by local join state.
    Local,
    /// Installed by the dual-active DF engine.
    DualActive,
}
