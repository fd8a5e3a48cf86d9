//! Designated-Forwarder decision engine.
//!
//! For every (flow, interface) pair the engine decides whether this
//! routing instance forwards the flow onto the shared dual-active
//! interface, and drives outgoing-interface membership through the
//! [`OifHandler`] seam. `am_df` and OIL membership are kept in lockstep:
//! the computed desired state is diffed against the current one and the
//! handler is only invoked on an actual transition, so repeated
//! recomputes never produce duplicate FIB updates.

use crate::types::{DfState, Flow, InterfaceName, OifSource, VrfName, ROUTE_METRIC_MAX};
use crate::OifHandler;

/// Per-(flow, interface) synchronization state.
///
/// Local fields are owned by this instance; peer fields are only ever
/// written from inbound coordination messages (or reset wholesale on
/// peer loss).
#[derive(Debug, Clone)]
pub struct FlowInterfaceState {
    /// VRF the binding lives in.
    pub vrf: VrfName,
    /// Numeric VRF identifier, carried opaquely on the wire.
    pub vrf_id: u32,
    /// The multicast flow.
    pub flow: Flow,
    /// The dual-active interface.
    pub interface: InterfaceName,
    /// Local route metric to the tree root.
    pub local_cost_to_rp: u32,
    /// Peer's advertised metric; [`ROUTE_METRIC_MAX`] until heard from.
    pub peer_cost_to_rp: u32,
    /// Whether this instance is the Designated Router on the interface.
    pub local_is_dr: bool,
    /// Whether the peer reports itself as Designated Router.
    pub peer_is_dr: bool,
    /// Whether the peer has dual-active configured on its interface.
    pub peer_dual_active: bool,
    /// Whether this instance currently forwards the flow here.
    /// Mutated exclusively via [`apply_df`].
    pub am_df: bool,
}

impl FlowInterfaceState {
    /// Creates a fresh binding with no peer information yet.
    pub fn new(
        vrf: VrfName,
        vrf_id: u32,
        flow: Flow,
        interface: InterfaceName,
        local_cost_to_rp: u32,
        local_is_dr: bool,
    ) -> Self {
        Self {
            vrf,
            vrf_id,
            flow,
            interface,
            local_cost_to_rp,
            peer_cost_to_rp: ROUTE_METRIC_MAX,
            local_is_dr,
            peer_is_dr: false,
            peer_dual_active: false,
            am_df: false,
        }
    }

    /// Resets every peer-derived field to its conservative default.
    ///
    /// Always all three together, never partially: a disconnect must not
    /// leave stale peer DR or dual-active flags next to a reset cost.
    pub fn reset_peer_fields(&mut self) {
        self.peer_cost_to_rp = ROUTE_METRIC_MAX;
        self.peer_is_dr = false;
        self.peer_dual_active = false;
    }
}

fn df_from_dr(is_dr: bool) -> DfState {
    if is_dr {
        DfState::Forwarding
    } else {
        DfState::NotForwarding
    }
}

/// Computes the desired forwarding state for a binding.
///
/// 1. Without dual-active on both sides, each instance acts
///    independently: DF iff locally the Designated Router.
/// 2. With dual-active on both sides, the strictly lower cost to the
///    tree root wins.
/// 3. Equal costs tie-break on local DR status.
pub fn compute_df(st: &FlowInterfaceState, local_dual_active: bool) -> DfState {
    if !local_dual_active || !st.peer_dual_active {
        tracing::debug!(
            flow = %st.flow,
            interface = %st.interface,
            local_dual_active,
            peer_dual_active = st.peer_dual_active,
            "dual-active not configured on both sides, deciding on DR role"
        );
        return df_from_dr(st.local_is_dr);
    }

    if st.local_cost_to_rp != st.peer_cost_to_rp {
        tracing::debug!(
            flow = %st.flow,
            interface = %st.interface,
            local_cost = st.local_cost_to_rp,
            peer_cost = st.peer_cost_to_rp,
            "cost to RP differs, lower cost forwards"
        );
        return if st.local_cost_to_rp < st.peer_cost_to_rp {
            DfState::Forwarding
        } else {
            DfState::NotForwarding
        };
    }

    // Cost is the same, tie-break is DR.
    df_from_dr(st.local_is_dr)
}

/// Applies a desired state, invoking the OIL seam only on transitions.
pub fn apply_df<H: OifHandler + ?Sized>(
    st: &mut FlowInterfaceState,
    desired: DfState,
    oif: &H,
) {
    match (st.am_df, desired) {
        (false, DfState::Forwarding) => {
            tracing::debug!(
                flow = %st.flow,
                interface = %st.interface,
                "becoming designated forwarder, adding interface to OIL"
            );
            oif.add_interface(st.flow, &st.interface, OifSource::DualActive);
            st.am_df = true;
        }
        (true, DfState::NotForwarding) => {
            tracing::debug!(
                flow = %st.flow,
                interface = %st.interface,
                "yielding designated forwarder, removing interface from OIL"
            );
            oif.remove_interface(st.flow, &st.interface, OifSource::DualActive);
            st.am_df = false;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingOif {
        adds: AtomicUsize,
        removes: AtomicUsize,
    }

    impl OifHandler for CountingOif {
        fn add_interface(&self, _flow: Flow, _interface: &InterfaceName, _source: OifSource) {
            self.adds.fetch_add(1, Ordering::SeqCst);
        }

        fn remove_interface(&self, _flow: Flow, _interface: &InterfaceName, _source: OifSource) {
            self.removes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn binding(local_cost: u32, local_is_dr: bool) -> FlowInterfaceState {
        FlowInterfaceState::new(
            VrfName::new("default").unwrap(),
            0,
            Flow::new("10.1.1.1".parse().unwrap(), "239.1.1.1".parse().unwrap()),
            InterfaceName::new("swp1").unwrap(),
            local_cost,
            local_is_dr,
        )
    }

    fn dual_active_binding(local_cost: u32, peer_cost: u32, local_is_dr: bool) -> FlowInterfaceState {
        let mut st = binding(local_cost, local_is_dr);
        st.peer_dual_active = true;
        st.peer_cost_to_rp = peer_cost;
        st
    }

    #[test]
    fn test_no_dual_active_follows_dr_regardless_of_cost() {
        for (local_cost, peer_cost) in [(1, 100), (100, 1), (5, 5)] {
            let mut st = binding(local_cost, true);
            st.peer_cost_to_rp = peer_cost;
            assert_eq!(compute_df(&st, false), DfState::Forwarding);

            st.local_is_dr = false;
            assert_eq!(compute_df(&st, false), DfState::NotForwarding);
        }
    }

    #[test]
    fn test_peer_not_dual_active_follows_dr() {
        let mut st = binding(100, true);
        st.peer_cost_to_rp = 1;
        // Local dual-active but the peer never reported it.
        assert_eq!(compute_df(&st, true), DfState::Forwarding);
    }

    #[test]
    fn test_lower_cost_wins() {
        let st = dual_active_binding(5, 10, false);
        assert_eq!(compute_df(&st, true), DfState::Forwarding);

        let st = dual_active_binding(10, 5, true);
        assert_eq!(compute_df(&st, true), DfState::NotForwarding);
    }

    #[test]
    fn test_equal_cost_ties_on_dr() {
        let st = dual_active_binding(7, 7, true);
        assert_eq!(compute_df(&st, true), DfState::Forwarding);

        let st = dual_active_binding(7, 7, false);
        assert_eq!(compute_df(&st, true), DfState::NotForwarding);
    }

    #[test]
    fn test_peer_cost_defaults_unreachable() {
        // A fresh binding with dual-active on both sides but no peer
        // cost yet always wins the comparison.
        let mut st = binding(1_000_000, false);
        st.peer_dual_active = true;
        assert_eq!(compute_df(&st, true), DfState::Forwarding);
    }

    #[test]
    fn test_apply_transitions_once() {
        let oif = CountingOif::default();
        let mut st = binding(5, true);

        apply_df(&mut st, DfState::Forwarding, &oif);
        assert!(st.am_df);
        assert_eq!(oif.adds.load(Ordering::SeqCst), 1);

        // Re-applying the same desired state is a no-op.
        apply_df(&mut st, DfState::Forwarding, &oif);
        assert_eq!(oif.adds.load(Ordering::SeqCst), 1);
        assert_eq!(oif.removes.load(Ordering::SeqCst), 0);

        apply_df(&mut st, DfState::NotForwarding, &oif);
        assert!(!st.am_df);
        assert_eq!(oif.removes.load(Ordering::SeqCst), 1);

        apply_df(&mut st, DfState::NotForwarding, &oif);
        assert_eq!(oif.removes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_peer_fields_is_atomic() {
        let mut st = dual_active_binding(5, 1, false);
        st.peer_is_dr = true;

        st.reset_peer_fields();
        assert_eq!(st.peer_cost_to_rp, ROUTE_METRIC_MAX);
        assert!(!st.peer_is_dr);
        assert!(!st.peer_dual_active);
    }
}
