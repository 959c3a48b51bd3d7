use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_transport::{
    Backend, Connector, InboundMessage, Link, LinkEvent, MessageHandler, MessageStream,
    SessionNotice, SessionState, TransportConfig, TransportError, TransportResult,
    TransportSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

/// Backend that reconnects on its own; the test drives its link events.
#[derive(Default)]
struct Script {
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    reconnects: AtomicUsize,
    subscribes: AtomicUsize,
    closes: AtomicUsize,
}

impl Script {
    fn send(&self, event: LinkEvent) {
        let events = self.events.lock().unwrap();
        events.as_ref().unwrap().send(event).unwrap();
    }

    fn lost(&self) {
        self.send(LinkEvent::Lost {
            reason: "socket reset".to_owned(),
        });
    }
}

struct ScriptedConnector(Arc<Script>);

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _config: &TransportConfig) -> TransportResult<Link> {
        let (events, receiver) = mpsc::unbounded_channel();
        *self.0.events.lock().unwrap() = Some(events);
        Ok(Link {
            backend: Arc::new(ScriptedBackend(Arc::clone(&self.0))),
            events: receiver,
        })
    }
}

struct ScriptedBackend(Arc<Script>);

#[async_trait]
impl Backend for ScriptedBackend {
    async fn publish(&self, _subject: &str, _payload: Bytes) -> TransportResult<()> {
        Ok(())
    }

    async fn subscribe(&self, _subject: &str) -> TransportResult<MessageStream> {
        self.0.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(futures::stream::pending().boxed())
    }

    async fn request(
        &self,
        subject: &str,
        _payload: Bytes,
        _timeout: Duration,
    ) -> TransportResult<Bytes> {
        Err(TransportError::NoResponders {
            subject: subject.to_owned(),
        })
    }

    async fn flush(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn reconnect(&self) -> TransportResult<()> {
        self.0.reconnects.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::connection("not driven by the session"))
    }

    fn reconnects_itself(&self) -> bool {
        true
    }

    async fn close(&self) -> TransportResult<()> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Ignore;

#[async_trait]
impl MessageHandler for Ignore {
    async fn handle(&self, _message: InboundMessage) {}
}

async fn connected(config: TransportConfig) -> (TransportSession, Arc<Script>) {
    let script = Arc::new(Script::default());
    let session = TransportSession::new(Arc::new(ScriptedConnector(Arc::clone(&script))), config);
    session.connect().await.unwrap();
    (session, script)
}

async fn wait_for_state(session: &TransportSession, state: SessionState) {
    timeout(WAIT, async {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn restored_event_reconnects_and_refreshes_subscriptions() {
    let (session, script) = connected(
        TransportConfig::new("nats://mesh").with_reconnect(3, Duration::from_millis(10)),
    )
    .await;
    session.subscribe("agents.all", Arc::new(Ignore)).await.unwrap();
    let mut notices = session.notices();

    script.lost();
    wait_for_state(&session, SessionState::Reconnecting).await;
    script.send(LinkEvent::Restored);

    let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
    assert_eq!(notice, SessionNotice::Reconnected);
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(script.reconnects.load(Ordering::SeqCst), 0);
    assert_eq!(script.subscribes.load(Ordering::SeqCst), 2);
    session.close().await.unwrap();
}

#[tokio::test]
async fn slow_client_reconnect_is_waited_for() {
    // Three 100 ms intervals would be over long before the client's first
    // attempt with a 500 ms connect timeout finishes.
    let (session, script) = connected(
        TransportConfig::new("nats://mesh")
            .with_connect_timeout(Duration::from_millis(500))
            .with_reconnect(3, Duration::from_millis(100)),
    )
    .await;
    let mut notices = session.notices();

    script.lost();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(session.state(), SessionState::Reconnecting);

    script.send(LinkEvent::Restored);
    let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
    assert_eq!(notice, SessionNotice::Reconnected);
    session.close().await.unwrap();
}

#[tokio::test]
async fn exhausted_event_closes_without_waiting_out_the_budget() {
    let (session, script) = connected(
        TransportConfig::new("nats://mesh").with_reconnect(3, Duration::from_secs(5)),
    )
    .await;
    let mut notices = session.notices();

    script.lost();
    script.send(LinkEvent::Exhausted {
        reason: "reconnect limit".to_owned(),
    });

    let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
    assert_eq!(notice, SessionNotice::TransportLost { attempts: 3 });
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn silent_client_is_given_up_after_its_budget() {
    let (session, script) = connected(
        TransportConfig::new("nats://mesh")
            .with_connect_timeout(Duration::from_millis(50))
            .with_reconnect(2, Duration::from_millis(50)),
    )
    .await;
    let mut notices = session.notices();

    script.lost();
    let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
    assert_eq!(notice, SessionNotice::TransportLost { attempts: 2 });
    assert_eq!(script.reconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn zero_budget_gives_up_at_once() {
    let (session, script) = connected(
        TransportConfig::new("nats://mesh").with_reconnect(0, Duration::from_secs(5)),
    )
    .await;
    let mut notices = session.notices();

    script.lost();
    let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
    assert_eq!(notice, SessionNotice::TransportLost { attempts: 0 });
}

#[tokio::test]
async fn close_releases_the_backend_once() {
    let (session, script) = connected(TransportConfig::new("nats://mesh")).await;
    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}
