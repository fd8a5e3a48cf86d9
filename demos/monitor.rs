//! Simulates one routing instance attached to an MLAG.
//!
//! Connects to a broker (see `mock-broker`), configures an interface
//! for dual-active, binds a flow to it and prints every coordination
//! message and outgoing-interface transition. Start two of these with
//! different costs against one broker and watch the lower cost win.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use dfsync::{DfSync, Flow, InterfaceName, LinkState, LoggingOifHandler, SyncConfig, VrfName};

#[derive(Parser)]
#[command(name = "monitor")]
#[command(about = "Minimal dfsync routing instance", long_about = None)]
struct Cli {
    /// Broker socket path.
    #[arg(short, long, default_value = "/tmp/dfsync-broker.sock")]
    socket: PathBuf,

    /// Interface to configure for dual-active.
    #[arg(short, long, default_value = "swp1")]
    interface: InterfaceName,

    /// Local cost to the multicast tree root.
    #[arg(short, long, default_value_t = 10)]
    cost: u32,

    /// Claim the Designated Router role on the interface.
    #[arg(long)]
    dr: bool,

    /// Multicast flow to bind, as `source,group`.
    #[arg(short, long, default_value = "10.1.1.1,239.1.1.1")]
    flow: String,
}

#[tokio::main]
async fn main() -> dfsync::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let (source, group) = cli
        .flow
        .split_once(',')
        .ok_or_else(|| dfsync::Error::Protocol("flow must be `source,group`".into()))?;
    let flow = Flow::new(
        source
            .parse()
            .map_err(|_| dfsync::Error::Protocol(format!("bad source address: {}", source)))?,
        group
            .parse()
            .map_err(|_| dfsync::Error::Protocol(format!("bad group address: {}", group)))?,
    );

    let config = SyncConfig {
        socket_path: cli.socket,
        reconnect_interval: Duration::from_secs(2),
    };
    let sync = DfSync::start(config, LoggingOifHandler);
    let mut relay_rx = sync.subscribe();

    sync.configure_dual_active(cli.interface.clone())?;
    sync.dr_changed(cli.interface.clone(), cli.dr)?;
    sync.flow_bound(VrfName::new("default")?, 0, flow, cli.interface.clone(), cli.cost)?;

    sync.wait_link_state(LinkState::Connected).await?;
    info!("connected to broker, watching coordination messages");

    loop {
        tokio::select! {
            msg = relay_rx.recv() => match msg {
                Ok(msg) => info!(message = ?msg, "from broker"),
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Some(st) = sync.binding(VrfName::new("default")?, flow, cli.interface.clone()).await? {
        info!(
            %flow,
            interface = %cli.interface,
            am_df = st.am_df,
            peer_cost = st.peer_cost_to_rp,
            "final binding state"
        );
    }

    sync.shutdown().await
}
