//! Peer lifecycle controller and synchronization actor.
//!
//! All mutable synchronization state (the flow-interface table, the
//! per-interface dual-active configuration, the peer connection flags)
//! is owned by a single actor task; the public [`DfSync`] handle sends
//! it events over a channel, so no handler ever runs concurrently with
//! another. De-registration, full replay and peer-state reset are
//! deferred by the actor posting events back to itself rather than
//! executed inline within the triggering handler, which also pins
//! their ordering against other pending work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::channel::{channel_task, ChannelControl};
use crate::df::{self, FlowInterfaceState};
use crate::queue::OutboundQueue;
use crate::types::{Flow, InterfaceName, LinkState, MlagRole, PeerState, VrfName};
use crate::wire::{Message, MessageType, MrouteAdd, MrouteDel};
use crate::{Error, OifHandler, Result};

/// Configuration for the synchronization subsystem.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Path of the broker's unix-domain socket.
    pub socket_path: PathBuf,
    /// Fixed interval between reconnect attempts.
    pub reconnect_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/mclag-sync.socket"),
            reconnect_interval: Duration::from_secs(10),
        }
    }
}

/// Snapshot of the peer connection for queries and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus {
    /// True while the broker link is up and usable for synchronization.
    pub connected: bool,
    /// Advisory role supplied by the broker.
    pub role: MlagRole,
    /// Number of interfaces configured for dual-active.
    pub dual_active_interfaces: u32,
    /// Local subsystems currently requiring the channel open.
    pub interested_clients: u32,
}

/// Events accepted by the synchronization actor.
#[derive(Debug)]
pub(crate) enum Event {
    FlowBound {
        vrf: VrfName,
        vrf_id: u32,
        flow: Flow,
        interface: InterfaceName,
        cost_to_rp: u32,
    },
    FlowUnbound {
        vrf: VrfName,
        flow: Flow,
        interface: InterfaceName,
    },
    DrChanged {
        interface: InterfaceName,
        is_dr: bool,
    },
    CostChanged {
        flow: Flow,
        cost_to_rp: u32,
    },
    ConfigureDualActive {
        interface: InterfaceName,
    },
    UnconfigureDualActive {
        interface: InterfaceName,
    },
    ProcessUp,
    ProcessDown,
    RegisterInterest,
    DeregisterInterest,
    SendRaw(Vec<u8>),
    // Deferred one-shot actions the actor posts to itself.
    SendRegister,
    SendDeregister,
    ReplayAll,
    ReplayInterface(InterfaceName),
    ResetPeerData,
    GetBinding {
        vrf: VrfName,
        flow: Flow,
        interface: InterfaceName,
        reply: oneshot::Sender<Option<FlowInterfaceState>>,
    },
    GetPeerStatus {
        reply: oneshot::Sender<PeerStatus>,
    },
    Shutdown,
}

/// The process-wide peer connection state.
#[derive(Debug, Default)]
struct PeerConnection {
    connected: bool,
    role: MlagRole,
    interested_clients: u32,
}

/// Count of interfaces configured for dual-active; the 0->1 and 1->0
/// transitions drive broker registration.
#[derive(Debug, Default)]
struct DualActiveRegistry {
    count: u32,
}

/// Local per-interface facts fed in by the routing-protocol core.
#[derive(Debug, Default, Clone, Copy)]
struct IfaceConfig {
    dual_active: bool,
    is_dr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingKey {
    vrf: VrfName,
    flow: Flow,
    interface: InterfaceName,
}

fn capability_mask() -> u32 {
    MessageType::StatusUpdate.bit()
        | MessageType::MrouteAdd.bit()
        | MessageType::MrouteDel.bit()
        | MessageType::MrouteAddBulk.bit()
        | MessageType::MrouteDelBulk.bit()
        | MessageType::PimStatusUpdate.bit()
}

struct SyncActor<H: OifHandler> {
    table: HashMap<BindingKey, FlowInterfaceState>,
    ifaces: HashMap<InterfaceName, IfaceConfig>,
    peer: PeerConnection,
    registry: DualActiveRegistry,
    oif: Arc<H>,
    queue: Arc<OutboundQueue>,
    chan_ctl: mpsc::UnboundedSender<ChannelControl>,
    relay_tx: broadcast::Sender<Message>,
    self_tx: mpsc::UnboundedSender<Event>,
}

impl<H: OifHandler> SyncActor<H> {
    fn iface(&self, interface: &InterfaceName) -> IfaceConfig {
        self.ifaces.get(interface).copied().unwrap_or_default()
    }

    /// Encodes and queues a message; an encode failure abandons this
    /// message and relies on the next full replay to re-send the state.
    fn enqueue(&self, msg: Message) {
        match msg.encode() {
            Ok(frame) => self.queue.push(frame),
            Err(e) => tracing::warn!(error = %e, "abandoning outbound message"),
        }
    }

    fn post(&self, ev: Event) {
        let _ = self.self_tx.send(ev);
    }

    /// Queues an advertisement for one binding, if the peer can use it.
    fn advertise(&self, st: &FlowInterfaceState, dual_active: bool) {
        if !self.peer.connected || !dual_active {
            return;
        }
        tracing::debug!(flow = %st.flow, interface = %st.interface, "enqueued mroute add for peer");
        self.enqueue(Message::MrouteAdd(MrouteAdd {
            vrf_name: st.vrf.clone(),
            flow: st.flow,
            cost_to_rp: st.local_cost_to_rp,
            am_i_dr: st.local_is_dr,
            am_i_dual_active: dual_active,
            vrf_id: st.vrf_id,
            intf_name: st.interface.clone(),
        }));
    }

    /// Recomputes DF for one binding and applies any transition.
    fn recompute(&mut self, key: &BindingKey) {
        let dual_active = self.iface(&key.interface).dual_active;
        if let Some(st) = self.table.get_mut(key) {
            let desired = df::compute_df(st, dual_active);
            df::apply_df(st, desired, self.oif.as_ref());
        }
    }

    fn keys_on_interface(&self, interface: &InterfaceName) -> Vec<BindingKey> {
        self.table
            .keys()
            .filter(|k| &k.interface == interface)
            .cloned()
            .collect()
    }

    fn keys_for_flow(&self, flow: Flow) -> Vec<BindingKey> {
        self.table
            .keys()
            .filter(|k| k.flow == flow)
            .cloned()
            .collect()
    }

    /// A local subsystem started requiring the channel.
    fn client_register(&mut self) {
        self.peer.interested_clients += 1;
        if self.peer.interested_clients == 1 {
            tracing::info!("first interested client, opening broker channel");
            let _ = self.chan_ctl.send(ChannelControl::Open);
        }
    }

    /// A local subsystem stopped requiring the channel.
    fn client_deregister(&mut self) {
        if self.peer.interested_clients == 0 {
            tracing::warn!("client de-register with no registered clients");
            return;
        }
        self.peer.interested_clients -= 1;
        if self.peer.interested_clients == 0 {
            tracing::info!("last interested client gone, closing broker channel");
            let _ = self.chan_ctl.send(ChannelControl::Close);
        }
    }

    /// Returns true when the actor should stop.
    fn handle_event(&mut self, ev: Event) -> bool {
        match ev {
            Event::FlowBound {
                vrf,
                vrf_id,
                flow,
                interface,
                cost_to_rp,
            } => self.on_flow_bound(vrf, vrf_id, flow, interface, cost_to_rp),
            Event::FlowUnbound {
                vrf,
                flow,
                interface,
            } => self.on_flow_unbound(vrf, flow, interface),
            Event::DrChanged { interface, is_dr } => self.on_dr_changed(interface, is_dr),
            Event::CostChanged { flow, cost_to_rp } => self.on_cost_changed(flow, cost_to_rp),
            Event::ConfigureDualActive { interface } => self.on_configure_dual_active(interface),
            Event::UnconfigureDualActive { interface } => {
                self.on_unconfigure_dual_active(interface)
            }
            Event::ProcessUp => self.on_process_up(),
            Event::ProcessDown => self.on_process_down(),
            Event::RegisterInterest => self.client_register(),
            Event::DeregisterInterest => self.client_deregister(),
            Event::SendRaw(payload) => match crate::wire::frame_raw(&payload) {
                Ok(frame) => self.queue.push(frame),
                Err(e) => tracing::warn!(error = %e, "dropping oversized relay payload"),
            },
            Event::SendRegister => {
                // Re-check the trigger: an unconfigure may have landed
                // since this was posted. While disconnected the next
                // link-up sends the registration instead.
                if self.registry.count > 0 && self.peer.connected {
                    self.send_register();
                }
            }
            Event::SendDeregister => {
                // A configure may land between the 1->0 transition and
                // this deferred action; only a still-empty registry
                // de-registers with the broker.
                if self.registry.count == 0 {
                    if self.peer.connected {
                        tracing::debug!("posting client de-register to broker");
                        self.enqueue(Message::Deregister);
                    }
                    self.peer.connected = false;
                }
                // Balances the register taken at the 0->1 transition,
                // also when a re-configure superseded this action.
                self.client_deregister();
            }
            Event::ReplayAll => self.replay_all(),
            Event::ReplayInterface(interface) => self.replay_interface(&interface),
            Event::ResetPeerData => self.reset_peer_data(),
            Event::GetBinding {
                vrf,
                flow,
                interface,
                reply,
            } => {
                let key = BindingKey {
                    vrf,
                    flow,
                    interface,
                };
                let _ = reply.send(self.table.get(&key).cloned());
            }
            Event::GetPeerStatus { reply } => {
                let _ = reply.send(PeerStatus {
                    connected: self.peer.connected,
                    role: self.peer.role,
                    dual_active_interfaces: self.registry.count,
                    interested_clients: self.peer.interested_clients,
                });
            }
            Event::Shutdown => {
                let _ = self.chan_ctl.send(ChannelControl::Shutdown);
                return true;
            }
        }
        false
    }

    fn on_flow_bound(
        &mut self,
        vrf: VrfName,
        vrf_id: u32,
        flow: Flow,
        interface: InterfaceName,
        cost_to_rp: u32,
    ) {
        let cfg = self.iface(&interface);
        let key = BindingKey {
            vrf: vrf.clone(),
            flow,
            interface: interface.clone(),
        };
        let st = self.table.entry(key.clone()).or_insert_with(|| {
            FlowInterfaceState::new(vrf, vrf_id, flow, interface, cost_to_rp, cfg.is_dr)
        });
        st.local_cost_to_rp = cost_to_rp;
        st.local_is_dr = cfg.is_dr;
        st.vrf_id = vrf_id;

        self.advertise(&self.table[&key], cfg.dual_active);
        self.recompute(&key);
    }

    fn on_flow_unbound(&mut self, vrf: VrfName, flow: Flow, interface: InterfaceName) {
        let cfg = self.iface(&interface);
        let key = BindingKey {
            vrf,
            flow,
            interface,
        };
        let Some(mut st) = self.table.remove(&key) else {
            tracing::debug!(%flow, interface = %key.interface, "unbind for unknown binding");
            return;
        };

        if self.peer.connected && cfg.dual_active {
            tracing::debug!(%flow, interface = %key.interface, "enqueued mroute del for peer");
            self.enqueue(Message::MrouteDel(MrouteDel {
                vrf_name: st.vrf.clone(),
                flow: st.flow,
                vrf_id: st.vrf_id,
                intf_name: st.interface.clone(),
            }));
        }

        // The entry is going away; leave the OIL consistent with it.
        df::apply_df(&mut st, crate::types::DfState::NotForwarding, self.oif.as_ref());
    }

    fn on_dr_changed(&mut self, interface: InterfaceName, is_dr: bool) {
        let cfg = self.ifaces.entry(interface.clone()).or_default();
        cfg.is_dr = is_dr;
        let dual_active = cfg.dual_active;
        tracing::debug!(%interface, is_dr, "DR role changed, updating peer");

        for key in self.keys_on_interface(&interface) {
            if let Some(st) = self.table.get_mut(&key) {
                st.local_is_dr = is_dr;
            }
            self.advertise(&self.table[&key], dual_active);
            self.recompute(&key);
        }
    }

    fn on_cost_changed(&mut self, flow: Flow, cost_to_rp: u32) {
        tracing::debug!(%flow, cost_to_rp, "RP cost changed, updating peer");
        for key in self.keys_for_flow(flow) {
            let dual_active = self.iface(&key.interface).dual_active;
            if let Some(st) = self.table.get_mut(&key) {
                st.local_cost_to_rp = cost_to_rp;
            }
            self.advertise(&self.table[&key], dual_active);
            self.recompute(&key);
        }
    }

    fn on_configure_dual_active(&mut self, interface: InterfaceName) {
        let cfg = self.ifaces.entry(interface.clone()).or_default();
        if cfg.dual_active {
            return;
        }
        cfg.dual_active = true;
        self.registry.count += 1;
        tracing::info!(
            %interface,
            total = self.registry.count,
            "configured dual-active on interface"
        );

        if self.registry.count == 1 {
            // First dual-active interface: open the channel and register
            // with the broker. The registration is deferred but ordered
            // before the interface replay.
            self.client_register();
            self.post(Event::SendRegister);
        }
        self.post(Event::ReplayInterface(interface.clone()));

        for key in self.keys_on_interface(&interface) {
            self.recompute(&key);
        }
    }

    fn on_unconfigure_dual_active(&mut self, interface: InterfaceName) {
        let cfg = self.ifaces.entry(interface.clone()).or_default();
        if !cfg.dual_active {
            return;
        }
        cfg.dual_active = false;
        self.registry.count -= 1;
        tracing::info!(
            %interface,
            total = self.registry.count,
            "unconfigured dual-active on interface"
        );

        if self.registry.count == 0 {
            // Last one gone: de-register, deferred.
            self.post(Event::SendDeregister);
        }

        // Bindings fall back to the DR-only rule.
        for key in self.keys_on_interface(&interface) {
            self.recompute(&key);
        }
    }

    fn send_register(&self) {
        let mask = capability_mask();
        tracing::debug!(
            mask = format_args!("{:#x}", mask),
            "posting client register to broker"
        );
        self.enqueue(Message::Register {
            capability_mask: mask,
        });
    }

    fn on_process_up(&mut self) {
        tracing::info!("broker link up, replaying local state");
        self.peer.connected = true;
        // A restarted broker has lost the registration; send it again
        // ahead of the replayed advertisements.
        if self.registry.count > 0 {
            self.send_register();
        }
        self.post(Event::ReplayAll);
    }

    fn on_process_down(&mut self) {
        tracing::info!("broker link down, falling back to local DR decisions");
        self.peer.connected = false;
        self.post(Event::ResetPeerData);
    }

    /// Replays every binding on every dual-active interface.
    fn replay_all(&mut self) {
        for (key, st) in &self.table {
            let dual_active = self.iface(&key.interface).dual_active;
            self.advertise(st, dual_active);
        }
    }

    fn replay_interface(&mut self, interface: &InterfaceName) {
        let dual_active = self.iface(interface).dual_active;
        for key in self.keys_on_interface(interface) {
            self.advertise(&self.table[&key], dual_active);
        }
    }

    /// Resets peer fields on every dual-active binding and recomputes.
    fn reset_peer_data(&mut self) {
        for key in self.keys_on_interface_with_dual_active() {
            if let Some(st) = self.table.get_mut(&key) {
                st.reset_peer_fields();
            }
            self.recompute(&key);
        }
    }

    fn keys_on_interface_with_dual_active(&self) -> Vec<BindingKey> {
        self.table
            .keys()
            .filter(|k| self.iface(&k.interface).dual_active)
            .cloned()
            .collect()
    }

    fn handle_message(&mut self, msg: Message) {
        // Relay every decoded message verbatim to interested local
        // subscribers before acting on it ourselves.
        let _ = self.relay_tx.send(msg.clone());

        match msg {
            Message::StatusUpdate(status) => {
                tracing::debug!(
                    my_role = %status.my_role,
                    peer_state = %status.peer_state,
                    "broker status update"
                );
                self.peer.role = status.my_role;
                match status.peer_state {
                    PeerState::Down => {
                        // Peer instance or peerlink failed; act on local
                        // knowledge only until it replays its state.
                        self.peer.connected = false;
                        self.post(Event::ResetPeerData);
                    }
                    PeerState::Running => {
                        // Peer is back; it will replay via mroute adds.
                        self.peer.connected = true;
                    }
                }
            }
            Message::MrouteAdd(rec) => self.apply_peer_add(rec),
            Message::MrouteAddBulk(recs) => {
                for rec in recs {
                    self.apply_peer_add(rec);
                }
            }
            Message::MrouteDel(rec) => self.apply_peer_del(rec),
            Message::MrouteDelBulk(recs) => {
                for rec in recs {
                    self.apply_peer_del(rec);
                }
            }
            Message::PimStatusUpdate(status) => {
                tracing::debug!(
                    switch_state = status.switch_state,
                    interface_state = status.interface_state,
                    "peer PIM status update"
                );
            }
            Message::Register { .. } | Message::Deregister => {
                tracing::warn!("unexpected registration message from broker");
            }
        }
    }

    fn apply_peer_add(&mut self, rec: MrouteAdd) {
        let key = BindingKey {
            vrf: rec.vrf_name,
            flow: rec.flow,
            interface: rec.intf_name,
        };
        let Some(st) = self.table.get_mut(&key) else {
            // The peer may reference state that has not converged here.
            tracing::debug!(
                flow = %rec.flow,
                interface = %key.interface,
                "peer mroute add for unknown binding"
            );
            return;
        };

        tracing::debug!(
            flow = %rec.flow,
            interface = %key.interface,
            peer_cost = rec.cost_to_rp,
            peer_is_dr = rec.am_i_dr,
            peer_dual_active = rec.am_i_dual_active,
            "updating binding with peer parameters"
        );
        st.peer_cost_to_rp = rec.cost_to_rp;
        st.peer_is_dr = rec.am_i_dr;
        st.peer_dual_active = rec.am_i_dual_active;
        self.recompute(&key);
    }

    fn apply_peer_del(&mut self, rec: MrouteDel) {
        let key = BindingKey {
            vrf: rec.vrf_name,
            flow: rec.flow,
            interface: rec.intf_name,
        };
        let Some(st) = self.table.get_mut(&key) else {
            tracing::debug!(
                flow = %rec.flow,
                interface = %key.interface,
                "peer mroute del for unknown binding"
            );
            return;
        };

        tracing::debug!(flow = %rec.flow, interface = %key.interface, "peer withdrew binding");
        st.reset_peer_fields();
        self.recompute(&key);
    }

    fn handle_link(&mut self, state: LinkState) {
        match state {
            LinkState::Connected => self.on_process_up(),
            LinkState::Disconnected => self.on_process_down(),
            LinkState::Connecting => {}
        }
    }
}

async fn actor_task<H: OifHandler>(
    mut actor: SyncActor<H>,
    mut event_rx: mpsc::UnboundedReceiver<Event>,
    mut inbound_rx: mpsc::Receiver<Message>,
    mut link_rx: watch::Receiver<LinkState>,
) {
    let mut link_alive = true;
    let mut inbound_alive = true;
    loop {
        tokio::select! {
            maybe = event_rx.recv() => match maybe {
                Some(ev) => {
                    if actor.handle_event(ev) {
                        return;
                    }
                }
                None => return,
            },
            maybe = inbound_rx.recv(), if inbound_alive => match maybe {
                Some(msg) => actor.handle_message(msg),
                None => inbound_alive = false,
            },
            changed = link_rx.changed(), if link_alive => match changed {
                Ok(()) => {
                    let state = *link_rx.borrow_and_update();
                    actor.handle_link(state);
                }
                Err(_) => link_alive = false,
            },
        }
    }
}

/// Handle to the DF synchronization subsystem.
///
/// Created with [`DfSync::start`], which spawns the broker channel task
/// and the synchronization actor. All event entry points are cheap,
/// non-blocking sends to the actor.
pub struct DfSync {
    event_tx: mpsc::UnboundedSender<Event>,
    relay_tx: broadcast::Sender<Message>,
    link_rx: watch::Receiver<LinkState>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl DfSync {
    /// Starts the synchronization subsystem.
    ///
    /// The broker channel stays closed until the first dual-active
    /// interface is configured (or a relay client registers interest).
    pub fn start<H: OifHandler>(config: SyncConfig, oif: H) -> Self {
        let queue = Arc::new(OutboundQueue::new());
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (relay_tx, _) = broadcast::channel(256);

        let chan_task = tokio::spawn(channel_task(
            config.socket_path.clone(),
            config.reconnect_interval,
            queue.clone(),
            inbound_tx,
            link_tx,
            ctl_rx,
        ));

        let actor = SyncActor {
            table: HashMap::new(),
            ifaces: HashMap::new(),
            peer: PeerConnection::default(),
            registry: DualActiveRegistry::default(),
            oif: Arc::new(oif),
            queue,
            chan_ctl: ctl_tx,
            relay_tx: relay_tx.clone(),
            self_tx: event_tx.clone(),
        };
        let actor_handle = tokio::spawn(actor_task(
            actor,
            event_rx,
            inbound_rx,
            link_rx.clone(),
        ));

        Self {
            event_tx,
            relay_tx,
            link_rx,
            tasks: vec![chan_task, actor_handle],
        }
    }

    fn send(&self, ev: Event) -> Result<()> {
        self.event_tx.send(ev).map_err(|_| Error::Closed)
    }

    /// A flow joined an interface locally.
    pub fn flow_bound(
        &self,
        vrf: VrfName,
        vrf_id: u32,
        flow: Flow,
        interface: InterfaceName,
        cost_to_rp: u32,
    ) -> Result<()> {
        self.send(Event::FlowBound {
            vrf,
            vrf_id,
            flow,
            interface,
            cost_to_rp,
        })
    }

    /// A flow-interface binding was torn down locally.
    pub fn flow_unbound(&self, vrf: VrfName, flow: Flow, interface: InterfaceName) -> Result<()> {
        self.send(Event::FlowUnbound {
            vrf,
            flow,
            interface,
        })
    }

    /// The local Designated-Router role changed on an interface.
    pub fn dr_changed(&self, interface: InterfaceName, is_dr: bool) -> Result<()> {
        self.send(Event::DrChanged { interface, is_dr })
    }

    /// The local cost to the tree root changed for a flow.
    pub fn cost_changed(&self, flow: Flow, cost_to_rp: u32) -> Result<()> {
        self.send(Event::CostChanged { flow, cost_to_rp })
    }

    /// Dual-active was configured on an interface.
    pub fn configure_dual_active(&self, interface: InterfaceName) -> Result<()> {
        self.send(Event::ConfigureDualActive { interface })
    }

    /// Dual-active was unconfigured on an interface.
    pub fn unconfigure_dual_active(&self, interface: InterfaceName) -> Result<()> {
        self.send(Event::UnconfigureDualActive { interface })
    }

    /// The local broker process came up; full state is replayed.
    pub fn process_up(&self) -> Result<()> {
        self.send(Event::ProcessUp)
    }

    /// The local broker process went down; decisions fall back to DR.
    pub fn process_down(&self) -> Result<()> {
        self.send(Event::ProcessDown)
    }

    /// A relay client started requiring the broker channel.
    pub fn register_interest(&self) -> Result<()> {
        self.send(Event::RegisterInterest)
    }

    /// A relay client stopped requiring the broker channel.
    pub fn deregister_interest(&self) -> Result<()> {
        self.send(Event::DeregisterInterest)
    }

    /// Queues an opaque payload, framed but not interpreted.
    pub fn send_raw(&self, payload: Vec<u8>) -> Result<()> {
        self.send(Event::SendRaw(payload))
    }

    /// Subscribes to decoded inbound coordination messages.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.relay_tx.subscribe()
    }

    /// Returns the current broker link state.
    pub fn link_state(&self) -> LinkState {
        *self.link_rx.borrow()
    }

    /// Waits until the broker link reaches the wanted state.
    pub async fn wait_link_state(&self, want: LinkState) -> Result<()> {
        let mut rx = self.link_rx.clone();
        loop {
            if *rx.borrow_and_update() == want {
                return Ok(());
            }
            rx.changed().await.map_err(|_| Error::Closed)?;
        }
    }

    /// Returns a snapshot of one flow-interface binding.
    pub async fn binding(
        &self,
        vrf: VrfName,
        flow: Flow,
        interface: InterfaceName,
    ) -> Result<Option<FlowInterfaceState>> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::GetBinding {
            vrf,
            flow,
            interface,
            reply,
        })?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Returns a snapshot of the peer connection.
    pub async fn peer_status(&self) -> Result<PeerStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::GetPeerStatus { reply })?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Shuts down the synchronization tasks.
    pub async fn shutdown(self) -> Result<()> {
        self.send(Event::Shutdown)?;
        for task in self.tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OifSource, ROUTE_METRIC_MAX};
    use crate::wire::StatusUpdate;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct RecordingOif {
        calls: Mutex<Vec<(Flow, InterfaceName, bool)>>,
    }

    impl RecordingOif {
        fn adds(&self) -> usize {
            self.calls.lock().iter().filter(|c| c.2).count()
        }

        fn removes(&self) -> usize {
            self.calls.lock().iter().filter(|c| !c.2).count()
        }
    }

    impl OifHandler for RecordingOif {
        fn add_interface(&self, flow: Flow, interface: &InterfaceName, _source: OifSource) {
            self.calls.lock().push((flow, interface.clone(), true));
        }

        fn remove_interface(&self, flow: Flow, interface: &InterfaceName, _source: OifSource) {
            self.calls.lock().push((flow, interface.clone(), false));
        }
    }

    struct Harness {
        actor: SyncActor<RecordingOif>,
        event_rx: mpsc::UnboundedReceiver<Event>,
        ctl_rx: mpsc::UnboundedReceiver<ChannelControl>,
        oif: Arc<RecordingOif>,
        queue: Arc<OutboundQueue>,
    }

    impl Harness {
        fn new() -> Self {
            let queue = Arc::new(OutboundQueue::new());
            let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (relay_tx, _) = broadcast::channel(16);
            let oif = Arc::new(RecordingOif::default());

            let actor = SyncActor {
                table: HashMap::new(),
                ifaces: HashMap::new(),
                peer: PeerConnection::default(),
                registry: DualActiveRegistry::default(),
                oif: oif.clone(),
                queue: queue.clone(),
                chan_ctl: ctl_tx,
                relay_tx,
                self_tx: event_tx,
            };

            Self {
                actor,
                event_rx,
                ctl_rx,
                oif,
                queue,
            }
        }

        /// Processes deferred events the actor posted to itself.
        fn run_deferred(&mut self) {
            while let Ok(ev) = self.event_rx.try_recv() {
                self.actor.handle_event(ev);
            }
        }

        fn queued_messages(&self) -> Vec<Message> {
            self.queue
                .drain()
                .iter()
                .map(|frame| Message::decode(frame).unwrap().0)
                .collect()
        }
    }

    fn vrf() -> VrfName {
        VrfName::new("default").unwrap()
    }

    fn intf(name: &str) -> InterfaceName {
        InterfaceName::new(name).unwrap()
    }

    fn flow(last: u8) -> Flow {
        Flow::new(
            format!("10.1.1.{}", last).parse().unwrap(),
            "239.1.1.1".parse().unwrap(),
        )
    }

    fn key(flow_: Flow, iface: &str) -> BindingKey {
        BindingKey {
            vrf: vrf(),
            flow: flow_,
            interface: intf(iface),
        }
    }

    fn peer_add(flow_: Flow, iface: &str, cost: u32, dr: bool) -> MrouteAdd {
        MrouteAdd {
            vrf_name: vrf(),
            flow: flow_,
            cost_to_rp: cost,
            am_i_dr: dr,
            am_i_dual_active: true,
            vrf_id: 0,
            intf_name: intf(iface),
        }
    }

    #[test]
    fn test_local_dr_without_peer_dual_active_forwards_silently() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::DrChanged {
            interface: intf("swp1"),
            is_dr: true,
        });
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });

        let st = &h.actor.table[&key(flow(1), "swp1")];
        assert!(st.am_df);
        assert_eq!(h.oif.adds(), 1);
        // Disconnected and not dual-active: nothing goes to the peer.
        assert!(h.queue.is_empty());
    }

    #[test]
    fn test_peer_with_lower_cost_takes_over() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.handle_event(Event::DrChanged {
            interface: intf("swp1"),
            is_dr: true,
        });
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });
        assert!(h.actor.table[&key(flow(1), "swp1")].am_df);

        h.actor.handle_message(Message::MrouteAdd(peer_add(flow(1), "swp1", 5, true)));

        let st = &h.actor.table[&key(flow(1), "swp1")];
        assert!(!st.am_df);
        assert_eq!(st.peer_cost_to_rp, 5);
        assert_eq!(h.oif.removes(), 1);
    }

    #[test]
    fn test_equal_cost_ties_on_dr() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 5,
        });

        // Not DR, equal cost: peer forwards.
        h.actor.handle_message(Message::MrouteAdd(peer_add(flow(1), "swp1", 5, true)));
        assert!(!h.actor.table[&key(flow(1), "swp1")].am_df);

        // Becoming DR flips the tie-break.
        h.actor.handle_event(Event::DrChanged {
            interface: intf("swp1"),
            is_dr: true,
        });
        assert!(h.actor.table[&key(flow(1), "swp1")].am_df);
    }

    #[test]
    fn test_peer_down_resets_all_bindings() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.handle_event(Event::DrChanged {
            interface: intf("swp1"),
            is_dr: true,
        });
        for i in 1..=3 {
            h.actor.handle_event(Event::FlowBound {
                vrf: vrf(),
                vrf_id: 0,
                flow: flow(i),
                interface: intf("swp1"),
                cost_to_rp: 10,
            });
            h.actor.handle_message(Message::MrouteAdd(peer_add(flow(i), "swp1", 5, false)));
            assert!(!h.actor.table[&key(flow(i), "swp1")].am_df);
        }

        h.actor.handle_message(Message::StatusUpdate(StatusUpdate {
            my_role: MlagRole::Primary,
            peer_state: PeerState::Down,
        }));
        h.run_deferred();

        assert!(!h.actor.peer.connected);
        for i in 1..=3 {
            let st = &h.actor.table[&key(flow(i), "swp1")];
            assert_eq!(st.peer_cost_to_rp, ROUTE_METRIC_MAX);
            assert!(!st.peer_dual_active);
            // Local DR wins once peer data is gone.
            assert!(st.am_df);
        }
    }

    #[test]
    fn test_process_up_replays_one_add_per_binding() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(2),
            interface: intf("swp1"),
            cost_to_rp: 20,
        });
        h.actor.handle_event(Event::ProcessUp);
        h.run_deferred();

        // Registration first, then exactly one add per binding.
        let msgs = h.queued_messages();
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], Message::Register { .. }));
        assert!(msgs[1..].iter().all(|m| matches!(m, Message::MrouteAdd(_))));
    }

    #[test]
    fn test_first_dual_active_interface_opens_channel() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp2"),
        });
        h.run_deferred();

        // One open despite two interfaces; nothing on the wire until
        // the link comes up.
        assert!(matches!(h.ctl_rx.try_recv(), Ok(ChannelControl::Open)));
        assert!(h.ctl_rx.try_recv().is_err());
        assert!(h.queue.is_empty());
        assert_eq!(h.actor.registry.count, 2);
    }

    #[test]
    fn test_configure_while_connected_registers_before_replay() {
        let mut h = Harness::new();
        h.actor.peer.connected = true;
        h.actor.handle_event(Event::DrChanged {
            interface: intf("swp1"),
            is_dr: true,
        });
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });
        assert!(h.queue.is_empty());

        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();

        let msgs = h.queued_messages();
        assert!(matches!(msgs[0], Message::Register { .. }));
        assert!(matches!(msgs[1], Message::MrouteAdd(_)));
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn test_last_dual_active_interface_deregisters() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.peer.connected = true;
        h.queue.drain();
        while h.ctl_rx.try_recv().is_ok() {}

        h.actor.handle_event(Event::UnconfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();

        let msgs = h.queued_messages();
        assert!(msgs.iter().any(|m| matches!(m, Message::Deregister)));
        assert!(matches!(h.ctl_rx.try_recv(), Ok(ChannelControl::Close)));
        assert!(!h.actor.peer.connected);
        assert_eq!(h.actor.registry.count, 0);
    }

    #[test]
    fn test_dual_active_toggle_keeps_registration() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.peer.connected = true;
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });
        h.queue.drain();

        // Both external events land before the deferred actions run.
        h.actor.handle_event(Event::UnconfigureDualActive {
            interface: intf("swp1"),
        });
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();

        // The superseded de-register never reaches the broker and the
        // re-configure registers and replays as usual.
        let msgs = h.queued_messages();
        assert!(!msgs.iter().any(|m| matches!(m, Message::Deregister)));
        assert!(matches!(msgs[0], Message::Register { .. }));
        assert!(matches!(msgs[1], Message::MrouteAdd(_)));
        assert!(h.actor.peer.connected);
        assert_eq!(h.actor.registry.count, 1);
        assert_eq!(h.actor.peer.interested_clients, 1);

        // The channel stays open through the toggle.
        assert!(matches!(h.ctl_rx.try_recv(), Ok(ChannelControl::Open)));
        assert!(h.ctl_rx.try_recv().is_err());
    }

    #[test]
    fn test_superseded_configure_sends_no_register() {
        let mut h = Harness::new();
        h.actor.peer.connected = true;
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.actor.handle_event(Event::UnconfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();

        let msgs = h.queued_messages();
        assert!(!msgs.iter().any(|m| matches!(m, Message::Register { .. })));
        assert!(msgs.iter().any(|m| matches!(m, Message::Deregister)));
        assert!(!h.actor.peer.connected);
        assert_eq!(h.actor.peer.interested_clients, 0);
        assert!(matches!(h.ctl_rx.try_recv(), Ok(ChannelControl::Open)));
        assert!(matches!(h.ctl_rx.try_recv(), Ok(ChannelControl::Close)));
    }

    #[test]
    fn test_rebinding_refreshes_vrf_id() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.peer.connected = true;
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 1,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });
        h.queue.drain();

        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 7,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });

        assert_eq!(h.actor.table[&key(flow(1), "swp1")].vrf_id, 7);
        let msgs = h.queued_messages();
        match msgs.as_slice() {
            [Message::MrouteAdd(rec)] => assert_eq!(rec.vrf_id, 7),
            other => panic!("unexpected messages: {:?}", other),
        }
    }

    #[test]
    fn test_bulk_add_applies_every_record() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        for i in 1..=2 {
            h.actor.handle_event(Event::FlowBound {
                vrf: vrf(),
                vrf_id: 0,
                flow: flow(i),
                interface: intf("swp1"),
                cost_to_rp: 10,
            });
        }

        h.actor.handle_message(Message::MrouteAddBulk(vec![
            peer_add(flow(1), "swp1", 5, false),
            peer_add(flow(2), "swp1", 3, false),
        ]));

        assert_eq!(h.actor.table[&key(flow(1), "swp1")].peer_cost_to_rp, 5);
        assert_eq!(h.actor.table[&key(flow(2), "swp1")].peer_cost_to_rp, 3);
    }

    #[test]
    fn test_peer_add_for_unknown_binding_is_noop() {
        let mut h = Harness::new();
        h.actor.handle_message(Message::MrouteAdd(peer_add(flow(9), "swp9", 5, true)));
        assert!(h.actor.table.is_empty());
        assert_eq!(h.oif.adds(), 0);
    }

    #[test]
    fn test_peer_del_resets_binding() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });
        h.actor.handle_message(Message::MrouteAdd(peer_add(flow(1), "swp1", 5, false)));
        assert_eq!(h.actor.table[&key(flow(1), "swp1")].peer_cost_to_rp, 5);

        h.actor.handle_message(Message::MrouteDel(MrouteDel {
            vrf_name: vrf(),
            flow: flow(1),
            vrf_id: 0,
            intf_name: intf("swp1"),
        }));
        let st = &h.actor.table[&key(flow(1), "swp1")];
        assert_eq!(st.peer_cost_to_rp, ROUTE_METRIC_MAX);
        assert!(!st.peer_dual_active);
    }

    #[test]
    fn test_flow_unbound_sends_del_and_leaves_oil() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.peer.connected = true;
        h.actor.handle_event(Event::DrChanged {
            interface: intf("swp1"),
            is_dr: true,
        });
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });
        assert_eq!(h.oif.adds(), 1);
        h.queue.drain();

        h.actor.handle_event(Event::FlowUnbound {
            vrf: vrf(),
            flow: flow(1),
            interface: intf("swp1"),
        });

        assert!(h.actor.table.is_empty());
        assert_eq!(h.oif.removes(), 1);
        let msgs = h.queued_messages();
        assert!(matches!(msgs.as_slice(), [Message::MrouteDel(_)]));
    }

    #[test]
    fn test_cost_change_readvertises_dual_active_bindings() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::ConfigureDualActive {
            interface: intf("swp1"),
        });
        h.run_deferred();
        h.actor.peer.connected = true;
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp1"),
            cost_to_rp: 10,
        });
        // swp2 is not dual-active; its binding is updated but silent.
        h.actor.handle_event(Event::FlowBound {
            vrf: vrf(),
            vrf_id: 0,
            flow: flow(1),
            interface: intf("swp2"),
            cost_to_rp: 10,
        });
        h.queue.drain();

        h.actor.handle_event(Event::CostChanged {
            flow: flow(1),
            cost_to_rp: 3,
        });

        assert_eq!(h.actor.table[&key(flow(1), "swp1")].local_cost_to_rp, 3);
        assert_eq!(h.actor.table[&key(flow(1), "swp2")].local_cost_to_rp, 3);
        let msgs = h.queued_messages();
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            Message::MrouteAdd(rec) => {
                assert_eq!(rec.cost_to_rp, 3);
                assert_eq!(rec.intf_name, intf("swp1"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_interest_refcount_gates_channel() {
        let mut h = Harness::new();
        h.actor.handle_event(Event::RegisterInterest);
        h.actor.handle_event(Event::RegisterInterest);
        assert!(matches!(h.ctl_rx.try_recv(), Ok(ChannelControl::Open)));
        assert!(h.ctl_rx.try_recv().is_err());

        h.actor.handle_event(Event::DeregisterInterest);
        assert!(h.ctl_rx.try_recv().is_err());
        h.actor.handle_event(Event::DeregisterInterest);
        assert!(matches!(h.ctl_rx.try_recv(), Ok(ChannelControl::Close)));
    }
}
