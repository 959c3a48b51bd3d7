//! NATS backend built on `async-nats`.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_nats::connection::State;
use async_nats::{Client, ClientError, ConnectOptions, Event, RequestErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{Backend, Connector, InboundMessage, Link, LinkEvent, MessageStream};
use crate::{TransportConfig, TransportError, TransportResult};

/// Dials a NATS server.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

impl NatsConnector {
    /// Returns a shareable connector.
    #[must_use]
    pub fn shared() -> Arc<dyn Connector> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, config: &TransportConfig) -> TransportResult<Link> {
        let (events, receiver) = mpsc::unbounded_channel();
        let interval = config.reconnect_interval();

        let options = ConnectOptions::new()
            .connection_timeout(config.connect_timeout())
            .max_reconnects(client_reconnect_budget(config.max_reconnect_attempts()))
            .reconnect_delay_callback(move |_| interval)
            .request_timeout(None)
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    if let Some(link_event) = link_event(&event) {
                        let _ = events.send(link_event);
                    } else {
                        debug!(event = ?event, "NATS client event");
                    }
                }
            });

        let client = options
            .connect(config.server_address())
            .await
            .map_err(|err| TransportError::connection(err.to_string()))?;

        debug!(server = %config.server_address(), "connected to NATS");
        Ok(Link {
            backend: Arc::new(NatsBackend {
                client: RwLock::new(Some(client)),
            }),
            events: receiver,
        })
    }
}

/// `async-nats` treats a zero budget as unlimited; the session gives up
/// without reconnecting instead, so the client needs at least one attempt.
fn client_reconnect_budget(attempts: usize) -> usize {
    attempts.max(1)
}

fn link_event(event: &Event) -> Option<LinkEvent> {
    match event {
        Event::Disconnected => Some(LinkEvent::Lost {
            reason: "disconnected from NATS server".to_owned(),
        }),
        Event::Connected => Some(LinkEvent::Restored),
        Event::ClientError(ClientError::MaxReconnects) => Some(LinkEvent::Exhausted {
            reason: "NATS client reached its reconnect limit".to_owned(),
        }),
        _ => None,
    }
}

/// A connected NATS client.
#[derive(Debug)]
pub struct NatsBackend {
    client: RwLock<Option<Client>>,
}

impl NatsBackend {
    fn client(&self) -> TransportResult<Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::publish("NATS connection closed"))
    }
}

#[async_trait]
impl Backend for NatsBackend {
    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        self.client()?
            .publish(subject.to_owned(), payload)
            .await
            .map_err(|err| TransportError::publish(err.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> TransportResult<MessageStream> {
        let subscriber = self
            .client()?
            .subscribe(subject.to_owned())
            .await
            .map_err(|err| TransportError::subscribe(subject, err.to_string()))?;

        Ok(subscriber
            .map(|message| {
                InboundMessage::new(
                    message.subject.to_string(),
                    message.payload,
                    message.reply.map(|reply| reply.to_string()),
                )
            })
            .boxed())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> TransportResult<Bytes> {
        let client = self.client()?;
        let pending = client.request(subject.to_owned(), payload);
        match tokio::time::timeout(timeout, pending).await {
            Ok(Ok(reply)) => Ok(reply.payload),
            Ok(Err(err)) => match err.kind() {
                RequestErrorKind::NoResponders => Err(TransportError::NoResponders {
                    subject: subject.to_owned(),
                }),
                RequestErrorKind::TimedOut => Err(TransportError::RequestTimeout(timeout)),
                _ => Err(TransportError::publish(err.to_string())),
            },
            Err(_) => Err(TransportError::RequestTimeout(timeout)),
        }
    }

    async fn flush(&self) -> TransportResult<()> {
        self.client()?
            .flush()
            .await
            .map_err(|err| TransportError::publish(err.to_string()))
    }

    async fn reconnect(&self) -> TransportResult<()> {
        match self.client()?.connection_state() {
            State::Connected => Ok(()),
            state => {
                warn!(?state, "NATS client still not connected");
                Err(TransportError::connection(format!("NATS client is {state:?}")))
            }
        }
    }

    fn reconnects_itself(&self) -> bool {
        true
    }

    /// Drops the client; the session flushes before calling this. The
    /// connection task ends once no subscriber or request holds a clone.
    async fn close(&self) -> TransportResult<()> {
        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if client.is_some() {
            debug!("NATS connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_still_caps_client_reconnects() {
        assert_eq!(client_reconnect_budget(0), 1);
        assert_eq!(client_reconnect_budget(10), 10);
    }

    #[test]
    fn client_events_map_to_link_events() {
        assert!(matches!(
            link_event(&Event::Disconnected),
            Some(LinkEvent::Lost { .. })
        ));
        assert_eq!(link_event(&Event::Connected), Some(LinkEvent::Restored));
        assert!(matches!(
            link_event(&Event::ClientError(ClientError::MaxReconnects)),
            Some(LinkEvent::Exhausted { .. })
        ));
        assert_eq!(link_event(&Event::LameDuckMode), None);
    }
}
