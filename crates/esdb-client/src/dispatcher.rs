//! Conversation ownership and reply correlation.
//!
//! The dispatcher outlives transports. Its conversation map survives
//! reconnects, and `attach` replays the opening frame of everything still
//! tracked onto the fresh outbound queue before any new traffic moves, which
//! is the replay guarantee callers rely on: a conversation started while
//! disconnected (or interrupted mid-flight) is re-sent with its original
//! conversation id on the next connection.
//!
//! Locking: the map sits behind a mutex that is never held across an await.
//! Waking waiters and pushing onto bounded delivery channels happens
//! strictly after the lock is released.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use esdb_protocol::{Frame, RecordedEvent, command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversations::{AckEvents, Conversation, ReplyAction, SubscriptionDescriptor};
use crate::error::ClientError;

type StreamItem = Result<RecordedEvent, ClientError>;
type Outcome = Result<ConversationReply, ClientError>;

// ---------------------------------------------------------------------------
// Caller-facing handles
// ---------------------------------------------------------------------------

/// What a resolved conversation hands back to its caller.
#[derive(Debug)]
pub enum ConversationReply {
    /// One-way conversation was queued; there is nothing to wait for.
    Sent,
    /// Final response frame of a single-shot exchange.
    Scalar(Frame),
    /// Live page stream of a reading conversation.
    Stream(EventStream),
    /// Confirmed persistent subscription.
    Subscription(SubscriptionHandle),
}

/// Caller-visible future for a conversation's outcome.
///
/// The handle stays valid across reconnects; dropping it without awaiting
/// leaves the conversation tracked (use [`ResultHandle::cancel`] to abandon
/// it explicitly).
#[derive(Debug)]
pub struct ResultHandle {
    conversation_id: Uuid,
    dispatcher: Dispatcher,
    rx: oneshot::Receiver<Outcome>,
}

impl ResultHandle {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Wait for the conversation to resolve.
    pub async fn reply(self) -> Outcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Resolve, expecting a single-shot reply.
    pub async fn scalar(self) -> Result<Frame, ClientError> {
        match self.reply().await? {
            ConversationReply::Scalar(frame) => Ok(frame),
            other => Err(ClientError::Protocol(format!(
                "expected a scalar reply, got {other:?}"
            ))),
        }
    }

    /// Resolve, expecting a streaming reply.
    pub async fn stream(self) -> Result<EventStream, ClientError> {
        match self.reply().await? {
            ConversationReply::Stream(stream) => Ok(stream),
            other => Err(ClientError::Protocol(format!(
                "expected a stream reply, got {other:?}"
            ))),
        }
    }

    /// Resolve, expecting a subscription reply.
    pub async fn subscription(self) -> Result<SubscriptionHandle, ClientError> {
        match self.reply().await? {
            ConversationReply::Subscription(handle) => Ok(handle),
            other => Err(ClientError::Protocol(format!(
                "expected a subscription reply, got {other:?}"
            ))),
        }
    }

    /// Abandon the conversation. The transport is untouched; the entry is
    /// simply dropped from the map.
    pub fn cancel(self) {
        self.dispatcher.remove(self.conversation_id);
    }
}

/// Ordered event delivery for a streaming conversation.
///
/// Ends when the channel closes; on failure a single error item arrives
/// immediately before the end.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamItem>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for EventStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamItem>> {
        self.rx.poll_recv(cx)
    }
}

/// A confirmed persistent subscription: event delivery plus acknowledgement.
#[derive(Debug)]
pub struct SubscriptionHandle {
    descriptor: SubscriptionDescriptor,
    events: EventStream,
    dispatcher: Dispatcher,
}

impl SubscriptionHandle {
    pub fn descriptor(&self) -> &SubscriptionDescriptor {
        &self.descriptor
    }

    pub async fn next(&mut self) -> Option<StreamItem> {
        self.events.next().await
    }

    /// Acknowledge processed events. Flows through the dispatcher as a
    /// one-way conversation so it lands on whichever transport is current.
    pub fn ack(&self, processed_event_ids: Vec<Uuid>) {
        let ack = AckEvents::new(
            self.descriptor.subscription_id.clone(),
            processed_event_ids,
            self.descriptor.credentials.clone(),
        );
        let _ = self.dispatcher.start_conversation(Box::new(ack));
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct ActiveConversation {
    conversation: Box<dyn Conversation>,
    slot: ResultSlot,
}

enum ResultSlot {
    /// Initial reply not delivered yet.
    Waiting(oneshot::Sender<Outcome>),
    /// An iterator was handed out; items flow through this sender.
    Streaming(mpsc::Sender<StreamItem>),
    /// A subscription was handed out; events flow through this sender.
    Subscribed(mpsc::Sender<StreamItem>),
    /// Placeholder while a reply action is being applied.
    Done,
}

struct Inner {
    conversations: HashMap<Uuid, ActiveConversation>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

/// Deferred waiter wake-up, executed after the map lock is released.
enum Wakeup {
    None,
    Resolve {
        tx: oneshot::Sender<Outcome>,
        outcome: Outcome,
    },
    Push {
        tx: mpsc::Sender<StreamItem>,
        items: Vec<StreamItem>,
    },
    ResolveAndPush {
        resolve: oneshot::Sender<Outcome>,
        outcome: Outcome,
        tx: mpsc::Sender<StreamItem>,
        items: Vec<StreamItem>,
    },
}

/// Cheaply cloneable handle; all clones share one conversation map.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Mutex<Inner>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Mutex::new(Inner {
                conversations: HashMap::new(),
                outbound: None,
            })),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a conversation to the engine.
    ///
    /// One-way conversations are sent best-effort and never tracked.
    /// Everything else is tracked until terminal; if no transport is
    /// attached the opening frame is deferred until the next `attach`.
    pub fn start_conversation(&self, conversation: Box<dyn Conversation>) -> ResultHandle {
        let conversation_id = conversation.id();
        let (tx, rx) = oneshot::channel();

        let mut inner = self.locked();
        if conversation.is_one_way() {
            match &inner.outbound {
                Some(outbound) => {
                    let _ = outbound.send(conversation.start());
                }
                None => debug!(
                    conversation_id = %conversation_id,
                    "one-way conversation dropped while disconnected"
                ),
            }
            drop(inner);
            let _ = tx.send(Ok(ConversationReply::Sent));
        } else {
            debug!(
                conversation_id = %conversation_id,
                deferred = inner.outbound.is_none(),
                "starting conversation"
            );
            let start = conversation.start();
            let _ = inner.conversations.insert(
                conversation_id,
                ActiveConversation {
                    conversation,
                    slot: ResultSlot::Waiting(tx),
                },
            );
            if let Some(outbound) = &inner.outbound {
                let _ = outbound.send(start);
            }
            drop(inner);
        }

        ResultHandle {
            conversation_id,
            dispatcher: self.clone(),
            rx,
        }
    }

    /// A transport became active: replay the opening frame of every tracked
    /// conversation onto its outbound queue, then adopt the queue for new
    /// traffic.
    pub fn attach(&self, outbound: mpsc::UnboundedSender<Frame>) {
        let mut inner = self.locked();
        info!(
            tracked = inner.conversations.len(),
            "transport attached, replaying tracked conversations"
        );
        for active in inner.conversations.values() {
            let _ = outbound.send(active.conversation.start());
        }
        inner.outbound = Some(outbound);
    }

    /// Transport lost: conversations stay tracked for the next attach.
    pub fn detach(&self) {
        self.locked().outbound = None;
    }

    /// Drop a conversation without resolving it.
    pub fn remove(&self, conversation_id: Uuid) {
        if self
            .locked()
            .conversations
            .remove(&conversation_id)
            .is_some()
        {
            debug!(conversation_id = %conversation_id, "conversation removed");
        }
    }

    pub fn has_conversation(&self, conversation_id: Uuid) -> bool {
        self.locked().conversations.contains_key(&conversation_id)
    }

    pub fn tracked(&self) -> usize {
        self.locked().conversations.len()
    }

    /// Route one inbound frame to its conversation and apply the directive
    /// it returns.
    pub async fn dispatch(&self, frame: Frame) {
        let conversation_id = frame.conversation_id;
        let wakeup = {
            let mut inner = self.locked();
            let Some(mut active) = inner.conversations.remove(&conversation_id) else {
                warn!(
                    conversation_id = %conversation_id,
                    command = command::name(frame.command),
                    "no conversation for inbound frame, dropping"
                );
                return;
            };

            let reply = active.conversation.respond_to(&frame);
            if let Some(follow_up) = reply.outbound {
                if let Some(outbound) = &inner.outbound {
                    let _ = outbound.send(follow_up);
                }
            }
            let finished = active.conversation.is_complete();
            let slot = std::mem::replace(&mut active.slot, ResultSlot::Done);

            match (reply.action, slot) {
                (ReplyAction::CompleteScalar(reply_frame), ResultSlot::Waiting(tx)) => {
                    Wakeup::Resolve {
                        tx,
                        outcome: Ok(ConversationReply::Scalar(reply_frame)),
                    }
                }
                (ReplyAction::CompleteError(err), ResultSlot::Waiting(tx)) => Wakeup::Resolve {
                    tx,
                    outcome: Err(err),
                },
                (
                    ReplyAction::CompleteError(err),
                    ResultSlot::Streaming(tx) | ResultSlot::Subscribed(tx),
                ) => Wakeup::Push {
                    tx,
                    items: vec![Err(err)],
                },
                (ReplyAction::BeginIterator { events, buffer_hint }, ResultSlot::Waiting(tx)) => {
                    let (items_tx, items_rx) = mpsc::channel(buffer_hint.saturating_mul(2).max(1));
                    if !finished {
                        active.slot = ResultSlot::Streaming(items_tx.clone());
                        let _ = inner.conversations.insert(conversation_id, active);
                    }
                    Wakeup::ResolveAndPush {
                        resolve: tx,
                        outcome: Ok(ConversationReply::Stream(EventStream { rx: items_rx })),
                        tx: items_tx,
                        items: events.into_iter().map(Ok).collect(),
                    }
                }
                (ReplyAction::YieldToIterator(events), ResultSlot::Streaming(tx)) => {
                    if !finished {
                        active.slot = ResultSlot::Streaming(tx.clone());
                        let _ = inner.conversations.insert(conversation_id, active);
                    }
                    Wakeup::Push {
                        tx,
                        items: events.into_iter().map(Ok).collect(),
                    }
                }
                (ReplyAction::CompleteIterator(events), ResultSlot::Streaming(tx)) => {
                    // Not reinserted: the sender drops after the final push,
                    // which ends the stream.
                    Wakeup::Push {
                        tx,
                        items: events.into_iter().map(Ok).collect(),
                    }
                }
                (ReplyAction::RaiseToIterator(err), ResultSlot::Streaming(tx)) => Wakeup::Push {
                    tx,
                    items: vec![Err(err)],
                },
                (ReplyAction::BeginPersistentSubscription(descriptor), ResultSlot::Waiting(tx)) => {
                    let (items_tx, items_rx) = mpsc::channel(descriptor.buffer_size.max(1));
                    if !finished {
                        active.slot = ResultSlot::Subscribed(items_tx.clone());
                        let _ = inner.conversations.insert(conversation_id, active);
                    }
                    let handle = SubscriptionHandle {
                        descriptor,
                        events: EventStream { rx: items_rx },
                        dispatcher: self.clone(),
                    };
                    Wakeup::Resolve {
                        tx,
                        outcome: Ok(ConversationReply::Subscription(handle)),
                    }
                }
                (ReplyAction::YieldToSubscription(event), ResultSlot::Subscribed(tx)) => {
                    if !finished {
                        active.slot = ResultSlot::Subscribed(tx.clone());
                        let _ = inner.conversations.insert(conversation_id, active);
                    }
                    Wakeup::Push {
                        tx,
                        items: vec![Ok(event)],
                    }
                }
                (ReplyAction::RaiseToSubscription(err), ResultSlot::Subscribed(tx)) => {
                    Wakeup::Push {
                        tx,
                        items: vec![Err(err)],
                    }
                }
                (ReplyAction::FinishSubscription, ResultSlot::Subscribed(_)) => {
                    // Dropping the sender ends the subscription stream.
                    Wakeup::None
                }
                (action, _slot) => {
                    warn!(
                        conversation_id = %conversation_id,
                        action = ?action,
                        "reply action does not fit the conversation's result slot, dropping"
                    );
                    Wakeup::None
                }
            }
        };

        match wakeup {
            Wakeup::None => {}
            Wakeup::Resolve { tx, outcome } => {
                let _ = tx.send(outcome);
            }
            Wakeup::Push { tx, items } => self.push_items(conversation_id, &tx, items).await,
            Wakeup::ResolveAndPush {
                resolve,
                outcome,
                tx,
                items,
            } => {
                let _ = resolve.send(outcome);
                self.push_items(conversation_id, &tx, items).await;
            }
        }
    }

    /// Deliver every outstanding conversation a terminal outcome: scalar
    /// waiters get the error (`ConnectionClosed` when none is given), open
    /// streams get the error item, or only the end-of-stream close on a
    /// clean shutdown.
    pub async fn fail_all(&self, error: Option<ClientError>) {
        let drained: Vec<ActiveConversation> = {
            let mut inner = self.locked();
            inner.outbound = None;
            inner
                .conversations
                .drain()
                .map(|(_, active)| active)
                .collect()
        };
        if !drained.is_empty() {
            info!(
                outstanding = drained.len(),
                "resolving outstanding conversations"
            );
        }
        for active in drained {
            match active.slot {
                ResultSlot::Waiting(tx) => {
                    let err = error.clone().unwrap_or(ClientError::ConnectionClosed);
                    let _ = tx.send(Err(err));
                }
                ResultSlot::Streaming(tx) | ResultSlot::Subscribed(tx) => {
                    if let Some(err) = error.clone() {
                        let _ = tx.send(Err(err)).await;
                    }
                }
                ResultSlot::Done => {}
            }
        }
    }

    async fn push_items(
        &self,
        conversation_id: Uuid,
        tx: &mpsc::Sender<StreamItem>,
        items: Vec<StreamItem>,
    ) {
        for item in items {
            if tx.send(item).await.is_err() {
                debug!(
                    conversation_id = %conversation_id,
                    "consumer dropped the stream, cancelling conversation"
                );
                self.remove(conversation_id);
                break;
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tracked", &self.tracked())
            .finish()
    }
}
