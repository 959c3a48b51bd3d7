//! In-process broker with NATS subject semantics.
//!
//! Useful for tests and single-process meshes. Subjects are dot-separated
//! tokens; subscriptions may use `*` for one token and a trailing `>` for one
//! or more tokens. The broker can be toggled offline to exercise reconnects.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{Backend, Connector, InboundMessage, Link, LinkEvent, MessageStream};
use crate::{TransportConfig, TransportError, TransportResult};

const INBOX_PREFIX: &str = "_INBOX";

struct Route {
    id: u64,
    pattern: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

struct BrokerInner {
    routes: Mutex<Vec<Route>>,
    next_route: AtomicU64,
    online: watch::Sender<bool>,
    connect_delay: Mutex<Duration>,
    published: AtomicU64,
}

impl BrokerInner {
    fn routes(&self) -> MutexGuard<'_, Vec<Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, pattern: &str) -> MemorySubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        self.routes().push(Route {
            id,
            pattern: pattern.to_owned(),
            sender,
        });
        MemorySubscription {
            id,
            broker: Arc::clone(self),
            receiver,
        }
    }

    fn deliver(&self, subject: &str, payload: &Bytes, reply: Option<&str>) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let routes = self.routes();
        routes
            .iter()
            .filter(|route| subject_matches(&route.pattern, subject))
            .filter(|route| {
                route
                    .sender
                    .send(InboundMessage::new(
                        subject,
                        payload.clone(),
                        reply.map(str::to_owned),
                    ))
                    .is_ok()
            })
            .count()
    }
}

/// Shared in-process message broker.
///
/// Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("online", &self.is_online())
            .field("subscriptions", &self.inner.routes().len())
            .finish()
    }
}

impl MemoryBroker {
    /// Creates an online broker with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        let (online, _) = watch::channel(true);
        Self {
            inner: Arc::new(BrokerInner {
                routes: Mutex::new(Vec::new()),
                next_route: AtomicU64::new(1),
                online,
                connect_delay: Mutex::new(Duration::ZERO),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a connector that dials this broker.
    #[must_use]
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// Takes the broker offline or brings it back.
    ///
    /// Going offline signals link loss to every connected session. Existing
    /// subscriptions survive the outage.
    pub fn set_online(&self, online: bool) {
        let previous = self.inner.online.send_replace(online);
        if previous != online {
            info!(online, "memory broker availability changed");
        }
    }

    /// Returns whether the broker accepts traffic.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Delays every subsequent connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self
            .inner
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Returns the subject patterns of all live subscriptions, reply inboxes
    /// included.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.inner
            .routes()
            .iter()
            .map(|route| route.pattern.clone())
            .collect()
    }

    /// Returns the number of subscriptions that would receive `subject`.
    #[must_use]
    pub fn interest(&self, subject: &str) -> usize {
        self.inner
            .routes()
            .iter()
            .filter(|route| subject_matches(&route.pattern, subject))
            .count()
    }

    /// Returns the number of messages published through the broker.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &TransportConfig) -> TransportResult<Link> {
        let delay = *self
            .broker
            .inner
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.broker.is_online() {
            return Err(TransportError::connection(format!(
                "connection refused by {}",
                config.server_address()
            )));
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let mut online = self.broker.inner.online.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = events.closed() => break,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let is_online = *online.borrow_and_update();
                        if !is_online
                            && events
                                .send(LinkEvent::Lost { reason: "broker went offline".to_owned() })
                                .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        debug!(server = %config.server_address(), "connected to memory broker");
        Ok(Link {
            backend: Arc::new(MemoryBackend {
                broker: self.broker.clone(),
                closed: AtomicBool::new(false),
            }),
            events: receiver,
        })
    }
}

struct MemoryBackend {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryBackend {
    fn ensure_usable(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::publish("connection closed"));
        }
        if !self.broker.is_online() {
            return Err(TransportError::publish("broker offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        self.ensure_usable()?;
        self.broker.inner.deliver(subject, &payload, None);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> TransportResult<MessageStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::subscribe(subject, "connection closed"));
        }
        Ok(self.broker.inner.register(subject).boxed())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> TransportResult<Bytes> {
        self.ensure_usable()?;
        let inbox = format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple());
        let mut replies = self.broker.inner.register(&inbox);

        if self.broker.inner.deliver(subject, &payload, Some(&inbox)) == 0 {
            return Err(TransportError::NoResponders {
                subject: subject.to_owned(),
            });
        }

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => Ok(reply.payload().clone()),
            Ok(None) => Err(TransportError::connection("reply inbox closed")),
            Err(_) => Err(TransportError::RequestTimeout(timeout)),
        }
    }

    async fn flush(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn reconnect(&self) -> TransportResult<()> {
        if self.broker.is_online() {
            Ok(())
        } else {
            Err(TransportError::connection("broker offline"))
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Subscription stream; deregisters its route when dropped.
struct MemorySubscription {
    id: u64,
    broker: Arc<BrokerInner>,
    receiver: mpsc::UnboundedReceiver<InboundMessage>,
}

impl Stream for MemorySubscription {
    type Item = InboundMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let id = self.id;
        self.broker.routes().retain(|route| route.id != id);
    }
}

/// Returns whether `subject` matches the subscription `pattern`.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) | (None, None) => return true,
            (Some("*"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            _ => return false,
        }
    }
}
