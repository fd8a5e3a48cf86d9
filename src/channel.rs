//! Transport channel to the coordination broker.
//!
//! Owns the unix-domain socket, reassembles length-prefixed frames on
//! read, drains the outbound queue on write, and runs the reconnect
//! state machine (DISCONNECTED -> CONNECTING -> CONNECTED). The retry
//! timer and the connected state are mutually exclusive by construction:
//! the timer is only armed from the disconnected branches.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};

use crate::queue::OutboundQueue;
use crate::types::LinkState;
use crate::wire::{self, Message};

/// Control commands for the channel task.
#[derive(Debug)]
pub(crate) enum ChannelControl {
    /// A local client needs the channel; connect if not already up.
    Open,
    /// No local client needs the channel any more; disconnect.
    Close,
    /// Tear down the task for good.
    Shutdown,
}

enum ConnOutcome {
    /// Connection lost; retry after the reconnect interval.
    Lost,
    /// Close requested; go back to idle until the next open.
    Closed,
    /// Shutdown requested.
    Shutdown,
}

/// Runs the broker channel until shutdown.
///
/// Sits idle until an [`ChannelControl::Open`] arrives, then keeps a
/// connection up (reconnecting on loss) until closed or shut down.
pub(crate) async fn channel_task(
    path: PathBuf,
    reconnect_interval: Duration,
    queue: Arc<OutboundQueue>,
    inbound_tx: mpsc::Sender<Message>,
    link_tx: watch::Sender<LinkState>,
    mut ctl_rx: mpsc::UnboundedReceiver<ChannelControl>,
) {
    'closed: loop {
        match ctl_rx.recv().await {
            Some(ChannelControl::Open) => {}
            Some(ChannelControl::Close) => continue 'closed,
            Some(ChannelControl::Shutdown) | None => return,
        }

        'connect: loop {
            let _ = link_tx.send(LinkState::Connecting);
            tracing::debug!(path = %path.display(), "connecting to broker");

            let stream = match UnixStream::connect(&path).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = %e,
                        "unable to connect to broker, trying again in {:?}",
                        reconnect_interval
                    );
                    let _ = link_tx.send(LinkState::Disconnected);
                    match wait_retry(reconnect_interval, &mut ctl_rx).await {
                        RetryOutcome::Retry => continue 'connect,
                        RetryOutcome::Closed => continue 'closed,
                        RetryOutcome::Shutdown => return,
                    }
                }
            };

            tracing::info!(path = %path.display(), "connection with broker established");
            let _ = link_tx.send(LinkState::Connected);

            let outcome = run_connection(stream, &queue, &inbound_tx, &mut ctl_rx).await;
            let _ = link_tx.send(LinkState::Disconnected);

            match outcome {
                ConnOutcome::Closed => continue 'closed,
                ConnOutcome::Shutdown => return,
                ConnOutcome::Lost => {
                    // Whatever is still queued predates the loss; the
                    // link-up replay regenerates current state.
                    let stale = queue.drain().len();
                    if stale > 0 {
                        tracing::debug!(stale, "dropping stale outbound frames");
                    }
                    match wait_retry(reconnect_interval, &mut ctl_rx).await {
                        RetryOutcome::Retry => continue 'connect,
                        RetryOutcome::Closed => continue 'closed,
                        RetryOutcome::Shutdown => return,
                    }
                }
            }
        }
    }
}

enum RetryOutcome {
    Retry,
    Closed,
    Shutdown,
}

/// Arms the reconnect timer, still honoring control commands.
async fn wait_retry(
    interval: Duration,
    ctl_rx: &mut mpsc::UnboundedReceiver<ChannelControl>,
) -> RetryOutcome {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => return RetryOutcome::Retry,
            ctl = ctl_rx.recv() => match ctl {
                Some(ChannelControl::Open) => continue,
                Some(ChannelControl::Close) => return RetryOutcome::Closed,
                Some(ChannelControl::Shutdown) | None => return RetryOutcome::Shutdown,
            }
        }
    }
}

/// Runs an established broker connection.
async fn run_connection(
    mut stream: UnixStream,
    queue: &OutboundQueue,
    inbound_tx: &mpsc::Sender<Message>,
    ctl_rx: &mut mpsc::UnboundedReceiver<ChannelControl>,
) -> ConnOutcome {
    // Frames queued while disconnected (registration, replayed state)
    // go out first.
    if let Err(e) = write_pending(&mut stream, queue).await {
        tracing::warn!(error = %e, "broker write failed");
        return ConnOutcome::Lost;
    }

    let mut read_buf = vec![0u8; 2 * wire::MAX_PAYLOAD_SIZE];
    let mut frame_buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            result = stream.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        tracing::info!("broker closed the connection");
                        return ConnOutcome::Lost;
                    }
                    Ok(n) => {
                        frame_buf.extend_from_slice(&read_buf[..n]);
                        if !process_frames(&mut frame_buf, inbound_tx).await {
                            return ConnOutcome::Lost;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "broker read failed");
                        return ConnOutcome::Lost;
                    }
                }
            }

            _ = queue.wait() => {
                if let Err(e) = write_pending(&mut stream, queue).await {
                    tracing::warn!(error = %e, "broker write failed");
                    return ConnOutcome::Lost;
                }
            }

            ctl = ctl_rx.recv() => match ctl {
                Some(ChannelControl::Open) => {}
                Some(ChannelControl::Close) => {
                    // Final drain so the queued de-registration reaches
                    // the broker before the socket goes away.
                    if let Err(e) = write_pending(&mut stream, queue).await {
                        tracing::debug!(error = %e, "final drain failed");
                    }
                    tracing::info!("closing broker connection");
                    return ConnOutcome::Closed;
                }
                Some(ChannelControl::Shutdown) | None => return ConnOutcome::Shutdown,
            }
        }
    }
}

/// Writes every pending outbound frame in FIFO order.
async fn write_pending(stream: &mut UnixStream, queue: &OutboundQueue) -> std::io::Result<()> {
    for frame in queue.drain() {
        tracing::trace!(len = frame.len(), "writing frame to broker");
        stream.write_all(&frame).await?;
    }
    Ok(())
}

/// Splits and dispatches every complete frame in `buf`.
///
/// A payload that fails to decode is dropped and processing continues
/// with the next frame; only a desynchronized length field (past the
/// hard payload limit) is unrecoverable and clears the buffer. Returns
/// false when the inbound receiver is gone.
async fn process_frames(buf: &mut Vec<u8>, inbound_tx: &mpsc::Sender<Message>) -> bool {
    loop {
        if buf.len() < wire::FRAME_LEN_SIZE {
            return true;
        }
        let frame_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if frame_len > wire::MAX_PAYLOAD_SIZE {
            tracing::warn!(frame_len, "oversized frame length, dropping read buffer");
            buf.clear();
            return true;
        }
        let total = wire::FRAME_LEN_SIZE + frame_len;
        if buf.len() < total {
            // Partial frame, wait for the next read.
            return true;
        }

        let decoded = Message::decode_payload(&buf[wire::FRAME_LEN_SIZE..total]);
        buf.drain(..total);

        match decoded {
            Ok(msg) => {
                tracing::trace!(msg_type = ?msg.message_type(), "frame from broker");
                if inbound_tx.send(msg).await.is_err() {
                    return false;
                }
            }
            // Protocol skew, not corruption: drop the frame and move on.
            Err(e) => tracing::warn!(error = %e, "dropping undecodable frame"),
        }
    }
}
