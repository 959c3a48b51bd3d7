//! Transport session: connection lifecycle, subscriptions, and reconnects.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use agent_config::MessagingConfig;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, Connector, LinkEvent, MessageHandler, MessageStream};
use crate::lifecycle::{Lifecycle, LifecycleError, SessionEvent, SessionState};
use crate::{TransportError, TransportResult};

const NOTICE_CAPACITY: usize = 16;

/// Connection settings for a [`TransportSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    server_address: String,
    connect_timeout: Duration,
    max_reconnect_attempts: usize,
    reconnect_interval: Duration,
    max_payload: usize,
}

impl TransportConfig {
    /// Creates a configuration for `server_address` with default limits.
    #[must_use]
    pub fn new(server_address: impl Into<String>) -> Self {
        Self::from(&MessagingConfig::default().with_server_address(server_address))
    }

    /// Returns the server address.
    #[must_use]
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    /// Returns the connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the reconnect attempt budget.
    #[must_use]
    pub const fn max_reconnect_attempts(&self) -> usize {
        self.max_reconnect_attempts
    }

    /// Returns the spacing between reconnect attempts.
    #[must_use]
    pub const fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    /// Returns the maximum payload size in bytes.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Overrides the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the reconnect policy.
    #[must_use]
    pub const fn with_reconnect(mut self, attempts: usize, interval: Duration) -> Self {
        self.max_reconnect_attempts = attempts;
        self.reconnect_interval = interval;
        self
    }

    /// Overrides the payload limit.
    #[must_use]
    pub const fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] when the address is empty or a
    /// duration or limit is zero.
    pub fn validate(&self) -> TransportResult<()> {
        if self.server_address.trim().is_empty() {
            return Err(TransportError::InvalidConfig("server address cannot be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "connect timeout must be greater than zero",
            ));
        }
        if self.reconnect_interval.is_zero() {
            return Err(TransportError::InvalidConfig(
                "reconnect interval must be greater than zero",
            ));
        }
        if self.max_payload == 0 {
            return Err(TransportError::InvalidConfig(
                "max payload must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl From<&MessagingConfig> for TransportConfig {
    fn from(config: &MessagingConfig) -> Self {
        Self {
            server_address: config.server_address().to_owned(),
            connect_timeout: config.connect_timeout(),
            max_reconnect_attempts: config.max_reconnect_attempts(),
            reconnect_interval: config.reconnect_interval(),
            max_payload: config.max_payload(),
        }
    }
}

/// Unsolicited events raised by a session after it connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The link dropped and was restored; subscriptions were refreshed.
    Reconnected,
    /// The link dropped and could not be restored. The session is closed.
    TransportLost {
        /// Number of reconnect attempts made.
        attempts: usize,
    },
}

/// Identifies a subscription for [`TransportSession::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Returns the numeric identifier.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

struct Subscription {
    subject: String,
    handler: Arc<dyn MessageHandler>,
    pump: JoinHandle<()>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<SessionState>,
    backend: RwLock<Option<Arc<dyn Backend>>>,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    next_subscription: AtomicU64,
    notices: broadcast::Sender<SessionNotice>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Owns one pub/sub connection for one agent.
///
/// The session is a cheap handle; clones share the same connection. It moves
/// through `Disconnected -> Connecting -> Connected -> (Reconnecting <->
/// Connected) -> Closed`. Call [`close`](Self::close) when done: background
/// tasks hold the connection open until then.
#[derive(Clone)]
pub struct TransportSession {
    shared: Arc<Shared>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("server", &self.shared.config.server_address)
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

impl TransportSession {
    /// Creates a disconnected session that will dial through `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                lifecycle: Mutex::new(Lifecycle::new()),
                state,
                backend: RwLock::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                notices,
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Returns a receiver for reconnect and transport-lost notices.
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.shared.notices.subscribe()
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    /// Connects to the server, waiting at most the configured connect timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] when the server refuses or the
    /// timeout elapses, [`TransportError::InvalidConfig`] for unusable
    /// settings, and [`TransportError::InvalidState`] unless the session is
    /// disconnected.
    pub async fn connect(&self) -> TransportResult<()> {
        let shared = &self.shared;
        shared.config.validate()?;
        shared
            .apply(SessionEvent::Dial)
            .map_err(|_| self.invalid_state("connect"))?;

        let address = shared.config.server_address();
        let connect_timeout = shared.config.connect_timeout();
        let link = match timeout(connect_timeout, shared.connector.connect(&shared.config)).await {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => {
                let _ = shared.apply(SessionEvent::Failed);
                warn!(server = %address, %err, "transport connect failed");
                return Err(err);
            }
            Err(_) => {
                let _ = shared.apply(SessionEvent::Failed);
                warn!(server = %address, ?connect_timeout, "transport connect timed out");
                return Err(TransportError::connection(format!(
                    "timed out after {connect_timeout:?} connecting to {address}"
                )));
            }
        };

        *write(&shared.backend) = Some(Arc::clone(&link.backend));
        if shared.apply(SessionEvent::Established).is_err() {
            // Closed while the dial was in flight.
            write(&shared.backend).take();
            return Err(self.invalid_state("connect"));
        }

        let monitor = tokio::spawn(monitor_link(Arc::clone(shared), link.events));
        if let Some(previous) = lock(&shared.monitor).replace(monitor) {
            previous.abort();
        }

        info!(server = %address, "transport session connected");
        Ok(())
    }

    /// Publishes `payload` on `channel` without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PayloadTooLarge`] above the payload limit and
    /// [`TransportError::Publish`] when the session is not connected or the
    /// backend rejects the message.
    pub async fn publish(&self, channel: &str, payload: Bytes) -> TransportResult<()> {
        self.check_payload(&payload)?;
        let backend = self.connected_backend()?;
        backend.publish(channel, payload).await
    }

    /// Registers `handler` to be invoked once per message arriving on `channel`.
    ///
    /// Messages on one subscription are handled sequentially in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidState`] unless connected, or the
    /// backend's [`TransportError::Subscribe`] error.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> TransportResult<SubscriptionHandle> {
        if !self.state().is_connected() {
            return Err(self.invalid_state("subscribe"));
        }
        let backend = self
            .shared
            .current_backend()
            .ok_or_else(|| self.invalid_state("subscribe"))?;
        let stream = backend.subscribe(channel).await?;

        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        let pump = tokio::spawn(pump(channel.to_owned(), stream, Arc::clone(&handler)));
        lock(&self.shared.subscriptions).insert(
            id,
            Subscription {
                subject: channel.to_owned(),
                handler,
                pump,
            },
        );

        debug!(channel, subscription = id, "subscribed");
        Ok(SubscriptionHandle(id))
    }

    /// Cancels a subscription. Returns `false` when the handle is unknown.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = lock(&self.shared.subscriptions).remove(&handle.0);
        match removed {
            Some(subscription) => {
                subscription.pump.abort();
                debug!(channel = %subscription.subject, subscription = handle.0, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Publishes `payload` on `channel` and waits for exactly one reply sent to
    /// the transport's ephemeral reply address.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::RequestTimeout`] when no reply arrives in
    /// time, [`TransportError::NoResponders`] when nobody listens on
    /// `channel`, plus the same errors as [`publish`](Self::publish).
    pub async fn request(
        &self,
        channel: &str,
        payload: Bytes,
        request_timeout: Duration,
    ) -> TransportResult<Bytes> {
        self.check_payload(&payload)?;
        let backend = self.connected_backend()?;
        backend.request(channel, payload, request_timeout).await
    }

    /// Unsubscribes everything, flushes pending publishes, and disconnects.
    ///
    /// Calling `close` on a closed session does nothing.
    ///
    /// # Errors
    ///
    /// Currently infallible; flush and close failures are logged.
    pub async fn close(&self) -> TransportResult<()> {
        let shared = &self.shared;
        if self.state().is_terminal() {
            return Ok(());
        }
        let _ = shared.apply(SessionEvent::Close);

        if let Some(monitor) = lock(&shared.monitor).take() {
            monitor.abort();
        }
        shared.teardown().await;
        info!(server = %shared.config.server_address, "transport session closed");
        Ok(())
    }

    fn check_payload(&self, payload: &Bytes) -> TransportResult<()> {
        let limit = self.shared.config.max_payload();
        if payload.len() > limit {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }
        Ok(())
    }

    fn connected_backend(&self) -> TransportResult<Arc<dyn Backend>> {
        let state = self.state();
        if !state.is_connected() {
            return Err(TransportError::publish(format!("session is {state}")));
        }
        self.shared
            .current_backend()
            .ok_or_else(|| TransportError::publish("session has no connection"))
    }

    fn invalid_state(&self, action: &'static str) -> TransportError {
        TransportError::InvalidState {
            action,
            state: self.state(),
        }
    }
}

impl Shared {
    fn apply(&self, event: SessionEvent) -> Result<SessionState, LifecycleError> {
        let mut lifecycle = lock(&self.lifecycle);
        let state = lifecycle.transition(event)?;
        self.state.send_replace(state);
        Ok(state)
    }

    fn current_backend(&self) -> Option<Arc<dyn Backend>> {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs the reconnect policy after a link loss. Returns `false` once the
    /// session should stop watching the link.
    async fn recover(&self, reason: &str, events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> bool {
        if self.apply(SessionEvent::LinkLost).is_err() {
            return false;
        }
        let attempts = self.config.max_reconnect_attempts();
        warn!(reason, max_attempts = attempts, "transport link lost; reconnecting");
        let Some(backend) = self.current_backend() else {
            return false;
        };

        let restored = if attempts == 0 {
            false
        } else if backend.reconnects_itself() {
            self.await_backend_recovery(events).await
        } else {
            self.retry_reconnect(backend.as_ref()).await
        };

        if !restored {
            self.exhaust(attempts).await;
            return false;
        }
        if self.apply(SessionEvent::Restored).is_err() {
            return false;
        }
        info!("transport link restored");
        self.resubscribe(backend.as_ref()).await;
        let _ = self.notices.send(SessionNotice::Reconnected);
        true
    }

    async fn retry_reconnect(&self, backend: &dyn Backend) -> bool {
        let attempts = self.config.max_reconnect_attempts();
        for attempt in 1..=attempts {
            sleep(self.config.reconnect_interval()).await;
            match backend.reconnect().await {
                Ok(()) => {
                    debug!(attempt, "reconnect attempt succeeded");
                    return true;
                }
                Err(err) => warn!(attempt, max_attempts = attempts, %err, "reconnect attempt failed"),
            }
        }
        false
    }

    /// Waits for a self-reconnecting backend to report the outcome.
    ///
    /// Each of the backend's attempts may take up to the connect timeout on
    /// top of the reconnect interval; past that budget the link is given up.
    async fn await_backend_recovery(&self, events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> bool {
        let per_attempt = self.config.reconnect_interval() + self.config.connect_timeout();
        let attempts = u32::try_from(self.config.max_reconnect_attempts()).unwrap_or(u32::MAX);
        let deadline = tokio::time::Instant::now() + per_attempt.saturating_mul(attempts);

        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(LinkEvent::Restored)) => return true,
                Ok(Some(LinkEvent::Lost { reason })) => {
                    debug!(reason, "link still down");
                }
                Ok(Some(LinkEvent::Exhausted { reason })) => {
                    warn!(reason, "backend gave up reconnecting");
                    return false;
                }
                Ok(None) => return false,
                Err(_) => {
                    warn!("backend did not report a reconnect within its budget");
                    return false;
                }
            }
        }
    }

    async fn exhaust(&self, attempts: usize) {
        if self.apply(SessionEvent::Exhausted).is_err() {
            return;
        }
        error!(attempts, "transport lost; reconnect attempts exhausted");
        self.teardown().await;
        let _ = self.notices.send(SessionNotice::TransportLost { attempts });
    }

    async fn resubscribe(&self, backend: &dyn Backend) {
        let entries: Vec<(u64, String, Arc<dyn MessageHandler>)> = {
            let subscriptions = lock(&self.subscriptions);
            subscriptions
                .iter()
                .map(|(id, sub)| {
                    sub.pump.abort();
                    (*id, sub.subject.clone(), Arc::clone(&sub.handler))
                })
                .collect()
        };

        for (id, subject, handler) in entries {
            match backend.subscribe(&subject).await {
                Ok(stream) => {
                    let pump = tokio::spawn(pump(subject.clone(), stream, handler));
                    match lock(&self.subscriptions).get_mut(&id) {
                        Some(entry) => entry.pump = pump,
                        None => pump.abort(),
                    }
                    debug!(channel = %subject, subscription = id, "subscription refreshed");
                }
                Err(err) => warn!(channel = %subject, %err, "failed to refresh subscription"),
            }
        }
    }

    async fn teardown(&self) {
        let subscriptions: Vec<Subscription> = lock(&self.subscriptions)
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for subscription in &subscriptions {
            subscription.pump.abort();
        }

        let backend = write(&self.backend).take();
        if let Some(backend) = backend {
            match timeout(self.config.connect_timeout(), backend.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(%err, "flush during shutdown failed"),
                Err(_) => debug!("flush during shutdown timed out"),
            }
            if let Err(err) = backend.close().await {
                warn!(%err, "backend close failed");
            }
        }
    }
}

async fn monitor_link(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Lost { reason } => {
                if !shared.recover(&reason, &mut events).await {
                    break;
                }
            }
            LinkEvent::Restored => debug!("link restored while connected"),
            LinkEvent::Exhausted { reason } => {
                warn!(reason, "backend gave up while connected");
                if shared.apply(SessionEvent::LinkLost).is_ok() {
                    shared.exhaust(shared.config.max_reconnect_attempts()).await;
                }
                break;
            }
        }
    }
}

async fn pump(subject: String, mut stream: MessageStream, handler: Arc<dyn MessageHandler>) {
    while let Some(message) = stream.next().await {
        let outcome = AssertUnwindSafe(handler.handle(message))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            error!(channel = %subject, "subscription handler panicked; continuing");
        }
    }
    debug!(channel = %subject, "subscription stream ended");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
