use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agent_transport::{
    InboundMessage, MemoryBroker, MessageHandler, SessionNotice, SessionState, TransportConfig,
    TransportError, TransportSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

struct Forwarding {
    sink: mpsc::UnboundedSender<InboundMessage>,
}

#[async_trait]
impl MessageHandler for Forwarding {
    async fn handle(&self, message: InboundMessage) {
        let _ = self.sink.send(message);
    }
}

struct Panicking {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageHandler for Panicking {
    async fn handle(&self, message: InboundMessage) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_ne!(message.payload().as_ref(), b"boom", "handler blew up");
    }
}

struct Echo {
    session: TransportSession,
}

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(&self, message: InboundMessage) {
        if let Some(reply) = message.reply() {
            let _ = self.session.publish(reply, message.payload().clone()).await;
        }
    }
}

fn config() -> TransportConfig {
    TransportConfig::new("memory://mesh").with_reconnect(3, Duration::from_millis(20))
}

async fn connected(broker: &MemoryBroker) -> TransportSession {
    let session = TransportSession::new(broker.connector(), config());
    session.connect().await.unwrap();
    session
}

fn forwarding() -> (Arc<Forwarding>, mpsc::UnboundedReceiver<InboundMessage>) {
    let (sink, rx) = mpsc::unbounded_channel();
    (Arc::new(Forwarding { sink }), rx)
}

#[tokio::test]
async fn publish_reaches_wildcard_subscribers() {
    let broker = MemoryBroker::new();
    let session = connected(&broker).await;
    assert_eq!(session.state(), SessionState::Connected);

    let (handler, mut rx) = forwarding();
    session.subscribe("agents.direct.*", handler).await.unwrap();
    session
        .publish("agents.direct.bob", Bytes::from_static(b"hello"))
        .await
        .unwrap();

    let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(message.subject(), "agents.direct.bob");
    assert_eq!(message.payload().as_ref(), b"hello");
    assert!(message.reply().is_none());
}

#[tokio::test]
async fn publish_requires_connection() {
    let broker = MemoryBroker::new();
    let session = TransportSession::new(broker.connector(), config());
    let err = session
        .publish("agents.all", Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Publish { .. }));
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let broker = MemoryBroker::new();
    let session = TransportSession::new(broker.connector(), config().with_max_payload(4));
    session.connect().await.unwrap();
    let err = session
        .publish("agents.all", Bytes::from_static(b"too long"))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::PayloadTooLarge { size: 8, limit: 4 });
    assert_eq!(broker.published_count(), 0);
}

#[tokio::test]
async fn refused_connect_can_be_retried() {
    let broker = MemoryBroker::new();
    broker.set_online(false);
    let session = TransportSession::new(broker.connector(), config());
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::Connection { .. }));
    assert_eq!(session.state(), SessionState::Disconnected);

    broker.set_online(true);
    session.connect().await.unwrap();
    assert!(session.state().is_connected());
}

#[tokio::test]
async fn slow_connect_times_out() {
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Duration::from_millis(500));
    let session = TransportSession::new(
        broker.connector(),
        config().with_connect_timeout(Duration::from_millis(30)),
    );
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::Connection { .. }));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn panicking_handler_keeps_subscription_alive() {
    let broker = MemoryBroker::new();
    let session = connected(&broker).await;
    let calls = Arc::new(AtomicUsize::new(0));
    session
        .subscribe(
            "agents.all",
            Arc::new(Panicking {
                calls: Arc::clone(&calls),
            }),
        )
        .await
        .unwrap();

    session
        .publish("agents.all", Bytes::from_static(b"boom"))
        .await
        .unwrap();
    session
        .publish("agents.all", Bytes::from_static(b"fine"))
        .await
        .unwrap();

    timeout(WAIT, async {
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn request_reply_and_timeout_release_inbox() {
    let broker = MemoryBroker::new();
    let responder = connected(&broker).await;
    let requester = connected(&broker).await;
    responder
        .subscribe(
            "agents.request.echo",
            Arc::new(Echo {
                session: responder.clone(),
            }),
        )
        .await
        .unwrap();

    let reply = requester
        .request("agents.request.echo", Bytes::from_static(b"ping"), WAIT)
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"ping");

    let (silent, _rx) = forwarding();
    responder
        .subscribe("agents.request.silent", silent)
        .await
        .unwrap();
    let err = requester
        .request(
            "agents.request.silent",
            Bytes::from_static(b"ping"),
            Duration::from_millis(40),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::RequestTimeout(_)));
    assert!(
        broker
            .active_subscriptions()
            .iter()
            .all(|subject| !subject.starts_with("_INBOX"))
    );
}

#[tokio::test]
async fn link_loss_recovers_and_refreshes_subscriptions() {
    let broker = MemoryBroker::new();
    let session = connected(&broker).await;
    let mut notices = session.notices();
    let (handler, mut rx) = forwarding();
    session.subscribe("agents.all", handler).await.unwrap();

    broker.set_online(false);
    let mut states = session.state_changes();
    timeout(WAIT, states.wait_for(|state| *state == SessionState::Reconnecting))
        .await
        .unwrap()
        .unwrap();
    broker.set_online(true);

    let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
    assert_eq!(notice, SessionNotice::Reconnected);
    assert!(session.state().is_connected());
    assert_eq!(session.subscription_count(), 1);

    session
        .publish("agents.all", Bytes::from_static(b"after"))
        .await
        .unwrap();
    let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(message.payload().as_ref(), b"after");
}

#[tokio::test]
async fn exhausted_reconnects_close_the_session() {
    let broker = MemoryBroker::new();
    let session = TransportSession::new(
        broker.connector(),
        config().with_reconnect(2, Duration::from_millis(10)),
    );
    session.connect().await.unwrap();
    let mut notices = session.notices();

    broker.set_online(false);
    let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
    assert_eq!(notice, SessionNotice::TransportLost { attempts: 2 });
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.subscription_count(), 0);

    let err = session
        .publish("agents.all", Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Publish { .. }));
}

#[tokio::test]
async fn close_is_idempotent_and_drops_subscriptions() {
    let broker = MemoryBroker::new();
    let session = connected(&broker).await;
    let (handler, _rx) = forwarding();
    let handle = session.subscribe("agents.all", handler).await.unwrap();
    assert_eq!(session.subscription_count(), 1);

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.subscription_count(), 0);
    assert!(!session.unsubscribe(handle));
    assert!(matches!(
        session.connect().await,
        Err(TransportError::InvalidState { .. })
    ));
}
