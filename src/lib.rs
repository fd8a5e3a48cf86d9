//! Designated-forwarder synchronization for MLAG multicast routing.
//!
//! Two redundant multicast routing instances attached to the same MLAG
//! both see local join state for a (source, group) flow, but only one
//! of them may forward it onto a dual-active interface. This crate
//! keeps the two instances consistent: each one advertises its
//! flow-interface bindings to the other through a local broker process
//! and runs a deterministic designated-forwarder election over the
//! combined local and peer parameters.
//!
//! [`DfSync::start`] spawns the broker channel and the synchronization
//! actor and returns a handle. The routing-protocol core feeds local
//! events into the handle ([`DfSync::flow_bound`], [`DfSync::dr_changed`]
//! and friends) and receives outgoing-interface updates through the
//! [`OifHandler`] it supplied:
//!
//! ```no_run
//! use dfsync::{DfSync, Flow, InterfaceName, LoggingOifHandler, SyncConfig, VrfName};
//!
//! #[tokio::main]
//! async fn main() -> dfsync::Result<()> {
//!     let sync = DfSync::start(SyncConfig::default(), LoggingOifHandler);
//!
//!     let swp1: InterfaceName = "swp1".parse()?;
//!     sync.configure_dual_active(swp1.clone())?;
//!     sync.dr_changed(swp1.clone(), true)?;
//!     sync.flow_bound(
//!         VrfName::new("default")?,
//!         0,
//!         Flow::new("10.1.1.1".parse().unwrap(), "239.1.1.1".parse().unwrap()),
//!         swp1,
//!         10,
//!     )?;
//!
//!     sync.shutdown().await
//! }
//! ```
//!
//! The broker socket is only held open while at least one dual-active
//! interface is configured or a relay client has registered interest;
//! a lost connection is retried on a fixed interval and the full local
//! state is replayed once it comes back.

mod channel;
mod df;
mod error;
mod queue;
mod sync;
mod types;
pub mod wire;

pub use df::FlowInterfaceState;
pub use error::Error;
pub use sync::{DfSync, PeerStatus, SyncConfig};
pub use types::{
    DfState, Flow, InterfaceName, LinkState, MlagRole, OifSource, PeerState, VrfName,
    INTF_NAME_LEN, ROUTE_METRIC_MAX, VRF_NAME_LEN,
};
pub use wire::Message;

pub type Result<T> = std::result::Result<T, Error>;

/// Seam to the multicast forwarding plane.
///
/// The DF engine calls this on every forwarding transition; calls are
/// already minimal (one per transition, never repeated for an unchanged
/// decision), so implementations can apply them directly.
pub trait OifHandler: Send + Sync + 'static {
    /// This instance became the designated forwarder; start forwarding
    /// `flow` out of `interface`.
    fn add_interface(&self, flow: Flow, interface: &InterfaceName, source: OifSource);

    /// This instance yielded to the peer; stop forwarding `flow` out of
    /// `interface`.
    fn remove_interface(&self, flow: Flow, interface: &InterfaceName, source: OifSource);
}

impl<H: OifHandler + ?Sized> OifHandler for std::sync::Arc<H> {
    fn add_interface(&self, flow: Flow, interface: &InterfaceName, source: OifSource) {
        (**self).add_interface(flow, interface, source)
    }

    fn remove_interface(&self, flow: Flow, interface: &InterfaceName, source: OifSource) {
        (**self).remove_interface(flow, interface, source)
    }
}

/// An [`OifHandler`] that ignores all transitions.
pub struct NoOpOifHandler;

impl OifHandler for NoOpOifHandler {
    fn add_interface(&self, _flow: Flow, _interface: &InterfaceName, _source: OifSource) {}

    fn remove_interface(&self, _flow: Flow, _interface: &InterfaceName, _source: OifSource) {}
}

/// An [`OifHandler`] that logs every transition.
pub struct LoggingOifHandler;

impl OifHandler for LoggingOifHandler {
    fn add_interface(&self, flow: Flow, interface: &InterfaceName, source: OifSource) {
        tracing::info!(%flow, %interface, ?source, "adding interface to outgoing list");
    }

    fn remove_interface(&self, flow: Flow, interface: &InterfaceName, source: OifSource) {
        tracing::info!(%flow, %interface, ?source, "removing interface from outgoing list");
    }
}
