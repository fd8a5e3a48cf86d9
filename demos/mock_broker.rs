//! Minimal coordination broker for manual testing.
//!
//! Accepts dfsync clients on a unix-domain socket, answers every
//! registration with a status update and relays mroute and PIM status
//! frames between the connected clients. Run two `monitor` instances
//! against one broker to watch the DF election converge.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use dfsync::wire::StatusUpdate;
use dfsync::{Error, Message, MlagRole, PeerState};

#[derive(Parser)]
#[command(name = "mock-broker")]
#[command(about = "Relay broker for dfsync clients", long_about = None)]
struct Cli {
    /// Socket path to listen on.
    #[arg(short, long, default_value = "/tmp/dfsync-broker.sock")]
    socket: PathBuf,

    /// Advisory MLAG role reported to every client.
    #[arg(long, default_value = "primary")]
    role: String,
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
    let role = match cli.role.as_str() {
        "primary" => MlagRole::Primary,
        "secondary" => MlagRole::Secondary,
        _ => MlagRole::None,
    };

    // A previous run may have left the socket file behind.
    let _ = std::fs::remove_file(&cli.socket);
    let listener = UnixListener::bind(&cli.socket)?;
    info!(socket = %cli.socket.display(), %role, "broker listening");

    let (relay_tx, _) = broadcast::channel::<(u64, Vec<u8>)>(256);
    let next_id = AtomicU64::new(1);

    loop {
        let (stream, _) = listener.accept().await?;
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        info!(client = id, "client connected");

        let tx = relay_tx.clone();
        let rx = relay_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = serve_client(id, stream, role, tx, rx).await {
                debug!(client = id, error = %e, "client connection ended");
            }
            info!(client = id, "client disconnected");
        });
    }
}

async fn serve_client(
    id: u64,
    mut stream: UnixStream,
    role: MlagRole,
    relay_tx: broadcast::Sender<(u64, Vec<u8>)>,
    mut relay_rx: broadcast::Receiver<(u64, Vec<u8>)>,
) -> dfsync::Result<()> {
    let mut read_buf = [0u8; 4096];
    let mut frame_buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            result = stream.read(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    return Ok(());
                }
                frame_buf.extend_from_slice(&read_buf[..n]);

                loop {
                    let (msg, consumed) = match Message::decode(&frame_buf) {
                        Ok(out) => out,
                        Err(Error::Incomplete) => break,
                        Err(e) => {
                            warn!(client = id, error = %e, "dropping undecodable input");
                            frame_buf.clear();
                            break;
                        }
                    };
                    frame_buf.drain(..consumed);
                    handle_message(id, msg, role, &mut stream, &relay_tx).await?;
                }
            }

            relayed = relay_rx.recv() => {
                match relayed {
                    Ok((from, frame)) if from != id => {
                        stream.write_all(&frame).await?;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(client = id, missed = n, "relay receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

async fn handle_message(
    id: u64,
    msg: Message,
    role: MlagRole,
    stream: &mut UnixStream,
    relay_tx: &broadcast::Sender<(u64, Vec<u8>)>,
) -> dfsync::Result<()> {
    info!(client = id, message = ?msg, "received");

    match &msg {
        Message::Register { .. } => {
            let status = Message::StatusUpdate(StatusUpdate {
                my_role: role,
                peer_state: PeerState::Running,
            });
            stream.write_all(&status.encode()?).await?;
        }
        Message::Deregister => {}
        // Everything else goes to the other clients.
        _ => {
            let _ = relay_tx.send((id, msg.encode()?));
        }
    }
    Ok(())
}
