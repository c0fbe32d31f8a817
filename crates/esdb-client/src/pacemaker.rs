//! Heartbeat pacemaker: keeps the liveness signal flowing in both
//! directions.
//!
//! Inbound probes are answered by the read pump straight onto the outbound
//! queue (see [`esdb_protocol::Frame::heartbeat_response`]); they never pass
//! through the dispatcher. This type drives the outbound side: one probe per
//! `heartbeat_period` under a fixed conversation id, with the verdict for
//! each probe reported to the connector. The connector, not the pacemaker,
//! judges when enough failures mean the peer is dead.

use std::time::Duration;

use esdb_protocol::Frame;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connector::ConnectorCommand;

pub struct Pacemaker {
    transport_id: u64,
    heartbeat_id: Uuid,
    outbound: mpsc::UnboundedSender<Frame>,
    responses: mpsc::UnboundedReceiver<Uuid>,
    ctrl: mpsc::UnboundedSender<ConnectorCommand>,
    heartbeat_period: Duration,
    response_timeout: Duration,
}

impl Pacemaker {
    pub fn new(
        transport_id: u64,
        outbound: mpsc::UnboundedSender<Frame>,
        responses: mpsc::UnboundedReceiver<Uuid>,
        ctrl: mpsc::UnboundedSender<ConnectorCommand>,
        heartbeat_period: Duration,
        response_timeout: Duration,
    ) -> Pacemaker {
        Pacemaker {
            transport_id,
            heartbeat_id: Uuid::new_v4(),
            outbound,
            responses,
            ctrl,
            heartbeat_period,
            response_timeout,
        }
    }

    /// Send-wait-sleep cycle. Exits when either side of the transport goes
    /// away; cancellation by the transport is a silent exit.
    pub async fn run(mut self) {
        loop {
            // A response that straggles in after its timeout window must not
            // satisfy the next probe.
            while self.responses.try_recv().is_ok() {}

            if self
                .outbound
                .send(Frame::heartbeat_request(self.heartbeat_id))
                .is_err()
            {
                break;
            }
            debug!(heartbeat_id = %self.heartbeat_id, "heartbeat probe sent");

            match timeout(self.response_timeout, self.await_response()).await {
                Ok(true) => {
                    let _ = self.ctrl.send(ConnectorCommand::HandleHeartbeatSuccess {
                        transport_id: self.transport_id,
                        conversation_id: self.heartbeat_id,
                    });
                }
                Ok(false) => break,
                Err(_) => {
                    warn!(
                        heartbeat_id = %self.heartbeat_id,
                        timeout = ?self.response_timeout,
                        "heartbeat probe went unanswered"
                    );
                    let _ = self.ctrl.send(ConnectorCommand::HandleHeartbeatFailed {
                        transport_id: self.transport_id,
                    });
                }
            }

            sleep(self.heartbeat_period).await;
        }
    }

    /// True when the matching response arrived, false when the response
    /// channel closed underneath us.
    async fn await_response(&mut self) -> bool {
        while let Some(conversation_id) = self.responses.recv().await {
            if conversation_id == self.heartbeat_id {
                debug!(heartbeat_id = %self.heartbeat_id, "heartbeat answered");
                return true;
            }
            debug!(%conversation_id, "ignoring unmatched heartbeat response");
        }
        false
    }
}
