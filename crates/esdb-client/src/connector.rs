//! Supervisor state machine: discovery, dialling, transport lifecycle,
//! reconnect with per-node retry bookkeeping, and liveness judgement.
//!
//! Every transition is driven by one control queue consumed by a single
//! task, so connector state is never touched concurrently. Transport pumps
//! and the pacemaker feed the same queue; their commands carry the id of
//! the transport that raised them, which lets the loop discard stragglers
//! from a connection it has already replaced.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::discovery::{Discovery, DiscoveryRetryPolicy, NodeService};
use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use crate::transport::Transport;

/// Consecutive heartbeat failures tolerated before the transport is torn
/// down. TODO: make configurable alongside the heartbeat timings.
const HEARTBEAT_FAILURE_LIMIT: u32 = 3;

/// Capacity of the event fan-out; slow observers lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Begin,
    Connecting,
    Connected,
    Stopping,
    Stopped,
}

/// Commands processed by the control loop, strictly in FIFO order.
#[derive(Debug)]
pub enum ConnectorCommand {
    /// Dial the given node, or run discovery first when absent.
    Connect(Option<NodeService>),
    HandleConnectFailure(ClientError),
    HandleConnectionOpened(TcpStream),
    HandleConnectionClosed {
        transport_id: u64,
    },
    HandleConnectionFailed {
        transport_id: u64,
        error: ClientError,
    },
    HandleHeartbeatFailed {
        transport_id: u64,
    },
    HandleHeartbeatSuccess {
        transport_id: u64,
        conversation_id: Uuid,
    },
    /// Discovery is exhausted; nothing left to dial.
    HandleConnectorFailed(ClientError),
    Stop(Option<ClientError>),
}

/// Connection lifecycle notifications fanned out to observers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(SocketAddr),
    Disconnected,
    Stopped(Option<ClientError>),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front door to the control loop.
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    ctrl: mpsc::UnboundedSender<ConnectorCommand>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectorHandle {
    pub fn connect(&self) {
        let _ = self.ctrl.send(ConnectorCommand::Connect(None));
    }

    pub fn connect_to(&self, node: NodeService) {
        let _ = self.ctrl.send(ConnectorCommand::Connect(Some(node)));
    }

    pub fn stop(&self, error: Option<ClientError>) {
        let _ = self.ctrl.send(ConnectorCommand::Stop(error));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub struct Connector {
    state: ConnectorState,
    discovery: Box<dyn Discovery>,
    retry_policy: DiscoveryRetryPolicy,
    dispatcher: Dispatcher,
    ctrl_tx: mpsc::UnboundedSender<ConnectorCommand>,
    ctrl_rx: mpsc::UnboundedReceiver<ConnectorCommand>,
    events: broadcast::Sender<ConnectionEvent>,
    transport: Option<Transport>,
    target_node: Option<NodeService>,
    heartbeat_failures: u32,
    connection_counter: u64,
    connect_timeout: Duration,
    heartbeat_period: Duration,
    response_timeout: Duration,
}

impl Connector {
    /// Spawn the control loop. The join handle resolves once the connector
    /// reaches `Stopped`.
    pub fn spawn(
        discovery: Box<dyn Discovery>,
        dispatcher: Dispatcher,
        config: &ClientConfig,
    ) -> (ConnectorHandle, JoinHandle<()>) {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let connector = Connector {
            state: ConnectorState::Begin,
            discovery,
            retry_policy: DiscoveryRetryPolicy::new(config.retries_per_node, config.retry_delay),
            dispatcher,
            ctrl_tx: ctrl_tx.clone(),
            ctrl_rx,
            events: events.clone(),
            transport: None,
            target_node: None,
            heartbeat_failures: 0,
            connection_counter: 0,
            connect_timeout: config.connect_timeout,
            heartbeat_period: config.heartbeat_period,
            response_timeout: config.response_timeout,
        };
        let join = tokio::spawn(connector.run());
        (ConnectorHandle { ctrl: ctrl_tx, events }, join)
    }

    async fn run(mut self) {
        while let Some(cmd) = self.ctrl_rx.recv().await {
            debug!(state = ?self.state, command = ?cmd, "control command");
            match cmd {
                ConnectorCommand::Connect(target) => {
                    if matches!(
                        self.state,
                        ConnectorState::Begin | ConnectorState::Connecting
                    ) {
                        self.state = ConnectorState::Connecting;
                        self.attempt_connect(target).await;
                    } else {
                        debug!(state = ?self.state, "ignoring connect request");
                    }
                }
                ConnectorCommand::HandleConnectFailure(error) => {
                    if self.state == ConnectorState::Connecting {
                        warn!(node = ?self.target_node, error = %error, "connect attempt failed");
                        if let Some(node) = self.target_node.clone() {
                            self.retry_policy.record_failure(&node);
                        }
                        self.reconnect().await;
                    }
                }
                ConnectorCommand::HandleConnectionOpened(stream) => {
                    if self.state == ConnectorState::Connecting {
                        self.on_connection_opened(stream);
                    } else {
                        debug!(state = ?self.state, "discarding connection opened out of state");
                    }
                }
                ConnectorCommand::HandleConnectionClosed { transport_id } => {
                    if self.is_current(transport_id) {
                        self.on_connection_lost(None).await;
                    }
                }
                ConnectorCommand::HandleConnectionFailed {
                    transport_id,
                    error,
                } => {
                    if self.is_current(transport_id) {
                        self.on_connection_lost(Some(error)).await;
                    }
                }
                ConnectorCommand::HandleHeartbeatFailed { transport_id } => {
                    if self.is_current(transport_id) {
                        self.on_heartbeat_failed().await;
                    }
                }
                ConnectorCommand::HandleHeartbeatSuccess {
                    transport_id,
                    conversation_id,
                } => {
                    if self.is_current(transport_id) {
                        debug!(%conversation_id, "heartbeat acknowledged");
                        self.heartbeat_failures = 0;
                        if let Some(node) = self.target_node.clone() {
                            self.retry_policy.record_success(&node);
                        }
                    }
                }
                ConnectorCommand::HandleConnectorFailed(error) => {
                    error!(error = %error, "no connection can be established");
                    self.shutdown(Some(error)).await;
                    break;
                }
                ConnectorCommand::Stop(error) => {
                    self.shutdown(error).await;
                    break;
                }
            }
        }
    }

    /// Pump notifications can outlive their transport; only the current one
    /// gets a say.
    fn is_current(&self, transport_id: u64) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.id() == transport_id)
    }

    async fn attempt_connect(&mut self, target: Option<NodeService>) {
        let node = match target {
            Some(node) => node,
            None => {
                debug!("performing node discovery");
                match self.discovery.discover().await {
                    Ok(node) => node,
                    Err(e) => {
                        let _ = self
                            .ctrl_tx
                            .send(ConnectorCommand::HandleConnectorFailed(e.into()));
                        return;
                    }
                }
            }
        };
        info!(node = %node, "connecting");
        self.target_node = Some(node.clone());

        let dial = TcpStream::connect((node.address.as_str(), node.port));
        let cmd = match timeout(self.connect_timeout, dial).await {
            Ok(Ok(stream)) => ConnectorCommand::HandleConnectionOpened(stream),
            Ok(Err(e)) => ConnectorCommand::HandleConnectFailure(ClientError::Connect {
                address: node.address.clone(),
                port: node.port,
                message: e.to_string(),
            }),
            Err(_) => ConnectorCommand::HandleConnectFailure(ClientError::Connect {
                address: node.address.clone(),
                port: node.port,
                message: format!("timed out after {:?}", self.connect_timeout),
            }),
        };
        let _ = self.ctrl_tx.send(cmd);
    }

    fn on_connection_opened(&mut self, stream: TcpStream) {
        self.connection_counter += 1;
        match Transport::start(
            self.connection_counter,
            stream,
            self.dispatcher.clone(),
            self.ctrl_tx.clone(),
            self.heartbeat_period,
            self.response_timeout,
        ) {
            Ok(transport) => {
                let peer = transport.peer();
                info!(%peer, transport_id = transport.id(), "connected");
                self.heartbeat_failures = 0;
                self.transport = Some(transport);
                self.state = ConnectorState::Connected;
                let _ = self.events.send(ConnectionEvent::Connected(peer));
            }
            Err(e) => {
                let _ = self
                    .ctrl_tx
                    .send(ConnectorCommand::HandleConnectFailure(ClientError::Transport(
                        e.to_string(),
                    )));
            }
        }
    }

    async fn on_connection_lost(&mut self, error: Option<ClientError>) {
        if self.state != ConnectorState::Connected {
            return;
        }
        match &error {
            Some(e) => info!(error = %e, "connection lost, restarting"),
            None => info!("connection closed gracefully, restarting"),
        }
        self.teardown_transport().await;
        self.state = ConnectorState::Connecting;
        self.reconnect().await;
    }

    async fn on_heartbeat_failed(&mut self) {
        self.heartbeat_failures += 1;
        warn!(
            failures = self.heartbeat_failures,
            limit = HEARTBEAT_FAILURE_LIMIT,
            "heartbeat failed"
        );
        if self.heartbeat_failures >= HEARTBEAT_FAILURE_LIMIT {
            self.heartbeat_failures = 0;
            self.teardown_transport().await;
            self.state = ConnectorState::Connecting;
            self.reconnect().await;
        }
    }

    /// Stop the transport (if any), detach the dispatcher, announce.
    async fn teardown_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.stop().await;
            self.dispatcher.detach();
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    /// Decide where the next attempt goes: the same node with backoff while
    /// its retry budget lasts, otherwise mark it failed and rediscover.
    async fn reconnect(&mut self) {
        match self.target_node.clone() {
            None => {
                let _ = self.ctrl_tx.send(ConnectorCommand::Connect(None));
            }
            Some(node) => {
                if self.retry_policy.should_retry(&node) {
                    self.retry_policy.wait(&node).await;
                    let _ = self.ctrl_tx.send(ConnectorCommand::Connect(Some(node)));
                } else {
                    warn!(node = %node, "retry budget exhausted, marking node failed");
                    self.discovery.mark_failed(&node);
                    self.target_node = None;
                    let _ = self.ctrl_tx.send(ConnectorCommand::Connect(None));
                }
            }
        }
    }

    async fn shutdown(&mut self, error: Option<ClientError>) {
        info!(error = ?error, "stopping connector");
        self.state = ConnectorState::Stopping;
        if let Some(mut transport) = self.transport.take() {
            transport.stop().await;
            self.dispatcher.detach();
        }
        self.dispatcher.fail_all(error.clone()).await;
        let _ = self.events.send(ConnectionEvent::Stopped(error));
        self.state = ConnectorState::Stopped;
    }
}
