//! In-process message bus with NATS-style subject semantics.
//!
//! The node owns two logical buses: the external one the control plane and
//! trigger publishers use, and the internal one shared with the in-guest
//! agents. Both are instances of [`Bus`]: subjects are dot-separated tokens,
//! subscriptions may use `*`/`>` wildcards, and requests force a full
//! round trip with a per-request deadline.
//!
//! Each subscription dispatches on its own task, in order; separate
//! subscriptions run concurrently. [`Subscription::drain`] stops new
//! deliveries and waits for already-delivered messages to finish, which is
//! the primitive machine teardown relies on.

pub mod subject;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use self::subject::{subject_matches, valid_pattern, valid_subject};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    #[error("no responders on subject {0}")]
    NoResponders(String),
    #[error("request on subject {0} timed out")]
    Timeout(String),
    #[error("request on subject {0} received no reply")]
    NoReply(String),
}

/// Message headers. Lookups are case-sensitive; producers use the canonical
/// lower-case names from `nex-agent-api`.
#[derive(Debug, Clone, Default)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// One slot shared by every delivered copy of a request; the first responder
/// consumes it.
#[derive(Clone, Debug)]
struct ReplySlot(Arc<Mutex<Option<oneshot::Sender<Message>>>>);

impl ReplySlot {
    fn new(tx: oneshot::Sender<Message>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    fn take(&self) -> Option<oneshot::Sender<Message>> {
        self.0.lock().expect("reply slot lock poisoned").take()
    }
}

#[derive(Clone)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    reply: Option<ReplySlot>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers: Headers::new(),
            reply: None,
        }
    }

    /// Build a request message and the receiver its reply will arrive on.
    /// [`Bus::request`] wraps this; direct construction is useful when a
    /// message is handed to a handler without a bus round trip.
    pub fn new_request(
        subject: impl Into<String>,
        payload: Vec<u8>,
    ) -> (Self, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        let mut msg = Self::new(subject, payload);
        msg.reply = Some(ReplySlot::new(tx));
        (msg, rx)
    }

    /// Whether the sender is waiting for a reply.
    #[allow(dead_code)] // public API exercised in tests
    pub fn can_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer a request. Returns false when the message was not a request,
    /// another responder got there first, or the requester gave up.
    pub fn respond(&self, payload: Vec<u8>) -> bool {
        self.respond_msg(Message::new("_reply", payload))
    }

    /// Answer a request with a full message (payload and headers).
    pub fn respond_msg(&self, reply: Message) -> bool {
        match self.reply.as_ref().and_then(ReplySlot::take) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("request", &self.reply.is_some())
            .finish()
    }
}

/// A subscription callback. Implementations carry whatever context they need
/// as struct fields.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: Message);
}

#[derive(Debug)]
struct Route {
    pattern: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default, Debug)]
struct BusInner {
    next_id: AtomicU64,
    routes: RwLock<HashMap<u64, Route>>,
}

/// Cloneable bus handle.
#[derive(Clone, Default, Debug)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler for every message matching `pattern`.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        if !valid_pattern(pattern) {
            return Err(BusError::InvalidSubject(pattern.to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.inner
            .routes
            .write()
            .expect("bus route lock poisoned")
            .insert(
                id,
                Route {
                    pattern: pattern.to_string(),
                    tx,
                },
            );

        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handler.handle(msg).await;
            }
        });

        debug!(pattern, id, "subscribed");
        Ok(Subscription {
            id,
            pattern: pattern.to_string(),
            bus: self.clone(),
            task: Some(task),
        })
    }

    /// Publish a message; returns how many subscriptions it was delivered to.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<usize, BusError> {
        self.publish_msg(Message::new(subject, payload)).await
    }

    pub async fn publish_msg(&self, msg: Message) -> Result<usize, BusError> {
        if !valid_subject(&msg.subject) {
            return Err(BusError::InvalidSubject(msg.subject.clone()));
        }

        let routes = self.inner.routes.read().expect("bus route lock poisoned");
        let mut delivered = 0;
        for route in routes.values() {
            if subject_matches(&route.pattern, &msg.subject) && route.tx.send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Publish a request and await the first reply within `timeout`.
    pub async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        self.request_msg(Message::new(subject, payload), timeout).await
    }

    pub async fn request_msg(&self, msg: Message, timeout: Duration) -> Result<Message, BusError> {
        let subject = msg.subject.clone();
        let (mut request, rx) = Message::new_request(subject.clone(), msg.payload);
        request.headers = msg.headers;

        let delivered = self.publish_msg(request).await?;
        if delivered == 0 {
            return Err(BusError::NoResponders(subject));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Every delivered copy was dropped without a response.
            Ok(Err(_)) => Err(BusError::NoReply(subject)),
            Err(_) => Err(BusError::Timeout(subject)),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner
            .routes
            .write()
            .expect("bus route lock poisoned")
            .remove(&id);
    }
}

/// Handle to an installed subscription. Dropping it stops new deliveries;
/// [`Subscription::drain`] additionally waits for in-flight handling.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    pattern: String,
    bus: Bus,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// The pattern this subscription was created with.
    pub fn subject(&self) -> &str {
        &self.pattern
    }

    /// Stop receiving new messages, then wait until every message already
    /// delivered to this subscription has been handled.
    pub async fn drain(mut self) {
        self.bus.unsubscribe(self.id);
        if let Some(task) = self.task.take() {
            // Removing the route dropped the sender; the dispatch task exits
            // once the buffered backlog is handled.
            let _ = task.await;
        }
        debug!(pattern = %self.pattern, "subscription drained");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
