//! Per-connection plumbing: socket halves, framing, and the four pumps.
//!
//! A transport is built fresh for every successful dial and destroyed on
//! disconnect. Its pumps:
//! - read: bytes -> frames; heartbeats to the pacemaker paths, the rest to
//!   the inbound queue
//! - write: outbound queue -> socket, flushed per frame
//! - dispatch: inbound queue -> dispatcher
//! - heartbeat: the pacemaker's probe cycle
//!
//! All four are cancelled as a group through one shutdown signal; `stop` is
//! idempotent and awaits them with errors suppressed. Unflushed outbound
//! frames may be lost on shutdown; their conversations stay tracked in the
//! dispatcher and replay on the next attach.

use std::net::SocketAddr;
use std::time::Duration;

use esdb_protocol::{Frame, FrameCodec, command};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connector::ConnectorCommand;
use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use crate::pacemaker::Pacemaker;

pub struct Transport {
    id: u64,
    peer: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Wire up a fresh connection: create the queues, attach the dispatcher
    /// (which replays tracked conversations onto the new outbound queue),
    /// then spawn the pumps. The attach happens before any pump runs, so
    /// replayed frames precede all new traffic on this connection.
    pub fn start(
        id: u64,
        stream: TcpStream,
        dispatcher: Dispatcher,
        ctrl: mpsc::UnboundedSender<ConnectorCommand>,
        heartbeat_period: Duration,
        response_timeout: Duration,
    ) -> std::io::Result<Transport> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel::<Uuid>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        dispatcher.attach(outbound_tx.clone());

        let pacemaker = Pacemaker::new(
            id,
            outbound_tx.clone(),
            heartbeat_rx,
            ctrl.clone(),
            heartbeat_period,
            response_timeout,
        );

        let tasks = vec![
            tokio::spawn(read_pump(
                id,
                FramedRead::new(read_half, FrameCodec::new()),
                outbound_tx,
                inbound_tx,
                heartbeat_tx,
                ctrl.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(write_pump(
                id,
                FramedWrite::new(write_half, FrameCodec::new()),
                outbound_rx,
                ctrl,
                shutdown_rx.clone(),
            )),
            tokio::spawn(dispatch_pump(dispatcher, inbound_rx, shutdown_rx.clone())),
            tokio::spawn(heartbeat_pump(pacemaker, shutdown_rx)),
        ];

        Ok(Transport {
            id,
            peer,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Cancel all pumps and wait them out. Safe to call more than once.
    ///
    /// The abort is the backstop for a pump parked inside an await the
    /// shutdown signal cannot reach (a write against a stalled socket, a
    /// delivery channel nobody is reading).
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        debug!(transport_id = self.id, "transport stopped");
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

async fn read_pump(
    transport_id: u64,
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedSender<Frame>,
    heartbeat_responses: mpsc::UnboundedSender<Uuid>,
    ctrl: mpsc::UnboundedSender<ConnectorCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => match frame.command {
                    command::HEARTBEAT_REQUEST => {
                        debug!(conversation_id = %frame.conversation_id, "answering server heartbeat");
                        let _ = outbound.send(Frame::heartbeat_response(frame.conversation_id));
                    }
                    command::HEARTBEAT_RESPONSE => {
                        let _ = heartbeat_responses.send(frame.conversation_id);
                    }
                    _ => {
                        let _ = inbound.send(frame);
                    }
                },
                Some(Err(e)) => {
                    warn!(transport_id, error = %e, "read failed");
                    let _ = ctrl.send(ConnectorCommand::HandleConnectionFailed {
                        transport_id,
                        error: ClientError::Transport(e.to_string()),
                    });
                    break;
                }
                None => {
                    debug!(transport_id, "peer closed the connection");
                    let _ = ctrl.send(ConnectorCommand::HandleConnectionClosed { transport_id });
                    break;
                }
            }
        }
    }
}

async fn write_pump(
    transport_id: u64,
    mut frames: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    ctrl: mpsc::UnboundedSender<ConnectorCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = frames.send(frame).await {
                        warn!(transport_id, error = %e, "write failed");
                        let _ = ctrl.send(ConnectorCommand::HandleConnectionFailed {
                            transport_id,
                            error: ClientError::Transport(e.to_string()),
                        });
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

async fn dispatch_pump(
    dispatcher: Dispatcher,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
            }
            frame = inbound.recv() => match frame {
                Some(frame) => dispatcher.dispatch(frame).await,
                None => break,
            }
        }
    }
}

async fn heartbeat_pump(pacemaker: Pacemaker, mut shutdown: watch::Receiver<bool>) {
    tokio::select! {
        biased;
        _ = shutdown.changed() => {}
        _ = pacemaker.run() => {}
    }
}
