//! Publish session with a statum state machine.
//!
//! The session walks three states with compile-time transition safety:
//!
//! ```text
//! Connecting ──► Publishing ──► Disconnecting
//! ```
//!
//! `Connecting` blocks on the link event channel until the connection is
//! acknowledged. `Publishing` emits the counter series at a fixed
//! cadence (a one-second delay precedes every publish) while draining
//! link events; received messages are counted by the session itself, and
//! a rejected subscription aborts the run. `Disconnecting` tears the
//! connection down through the client handle.

use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use statum::{machine, state};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::link::LinkEvent;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Link closed: {0}")]
    LinkClosed(String),

    #[error("Server rejected resubscribe to topic: {0}")]
    SubscriptionRejected(String),

    #[error("Failed to publish message: {0}")]
    Publish(String),

    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Failed to disconnect: {0}")]
    Disconnect(String),
}

/// What the publishing phase sends and how often.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub topic: String,
    pub message: String,
    /// Number of messages to send; `0` means publish until cancelled.
    pub count: u64,
    pub qos: QoS,
    pub cadence: Duration,
}

impl SessionSettings {
    pub fn new(topic: String, message: String, count: u64) -> Self {
        Self {
            topic,
            message,
            count,
            qos: QoS::AtLeastOnce,
            cadence: Duration::from_secs(1),
        }
    }
}

/// Bounded counter series; the payload source for the publish loop.
///
/// A target of `0` never completes. The sequence number never exceeds a
/// positive target.
#[derive(Debug, Clone)]
pub struct MessageSeries {
    target: u64,
    issued: u64,
}

impl MessageSeries {
    pub fn new(target: u64) -> Self {
        Self { target, issued: 0 }
    }

    /// Next sequence number and its rendered payload, or `None` once the
    /// series is complete.
    pub fn next_payload(&mut self) -> Option<(u64, String)> {
        if self.is_complete() {
            return None;
        }
        self.issued += 1;
        Some((self.issued, render_counter(self.issued)))
    }

    pub fn is_complete(&self) -> bool {
        self.target != 0 && self.issued >= self.target
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn target(&self) -> u64 {
        self.target
    }
}

/// Renders the counter payload for one sequence number.
pub fn render_counter(sequence: u64) -> String {
    serde_json::json!({ "testy": sequence }).to_string()
}

/// Encodes the rendered object text once more as a JSON string.
///
/// The wire deliberately carries the string-wrapped form; receivers
/// unwrap one layer before reading the object.
pub fn wire_payload(rendered: &str) -> Result<String, SessionError> {
    serde_json::to_string(rendered).map_err(|e| SessionError::Encode(e.to_string()))
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Connecting,
    Publishing,
    Disconnecting,
}

/// Publish session with compile-time state safety via statum.
#[machine]
#[derive(Debug)]
pub struct PubSession<S: SessionState> {
    client: AsyncClient,
    events: mpsc::Receiver<LinkEvent>,
    settings: SessionSettings,
    series: MessageSeries,
    received: u64,
    cancel: CancellationToken,
}

impl<S: SessionState> PubSession<S> {
    pub fn received(&self) -> u64 {
        self.received
    }

    /// True once a positive target of inbound messages has been seen.
    pub fn received_all(&self) -> bool {
        self.settings.count > 0 && self.received >= self.settings.count
    }
}

impl PubSession<Connecting> {
    pub fn create(
        client: AsyncClient,
        events: mpsc::Receiver<LinkEvent>,
        settings: SessionSettings,
        cancel: CancellationToken,
    ) -> Self {
        debug!("Session created for topic '{}'", settings.topic);
        let series = MessageSeries::new(settings.count);
        Self::new(client, events, settings, series, 0, cancel)
    }

    /// Blocks until the link reports an accepted connection.
    pub async fn wait_connected(mut self) -> Result<PubSession<Publishing>, SessionError> {
        loop {
            let event = self
                .events
                .recv()
                .await
                .ok_or_else(|| SessionError::LinkClosed("event channel closed".to_string()))?;
            match event {
                LinkEvent::Connected { session_present } => {
                    info!("Connected! (session_present: {})", session_present);
                    return Ok(self.transition());
                }
                LinkEvent::Interrupted { reason } => {
                    warn!("Connection interrupted. error: {}", reason);
                }
                other => debug!("Ignoring link event while connecting: {:?}", other),
            }
        }
    }
}

impl PubSession<Publishing> {
    /// Publishes the counter series, one message per cadence period.
    ///
    /// A blank message skips the loop entirely. A zero count publishes
    /// until the cancellation token fires.
    pub async fn publish_all(mut self) -> Result<PubSession<Disconnecting>, SessionError> {
        if self.settings.message.is_empty() {
            info!("Message is blank, skipping the publish loop");
            return Ok(self.transition());
        }
        if self.settings.count == 0 {
            info!("Sending messages until program killed");
        } else {
            info!("Sending {} message(s)", self.settings.count);
        }

        let cancel = self.cancel.clone();
        while !self.series.is_complete() {
            // The delay precedes the publish; link events are drained
            // while it runs.
            let sleep = tokio::time::sleep(self.settings.cadence);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = cancel.cancelled() => {
                        info!(
                            "Cancelled after {} message(s), disconnecting",
                            self.series.issued()
                        );
                        return Ok(self.transition());
                    }
                    event = self.events.recv() => match event {
                        Some(event) => self.handle_event(event)?,
                        None => {
                            return Err(SessionError::LinkClosed(
                                "event channel closed".to_string(),
                            ))
                        }
                    },
                }
            }

            let Some((_, rendered)) = self.series.next_payload() else {
                break;
            };
            info!(
                "Publishing message to topic '{}': {}",
                self.settings.topic, rendered
            );
            let payload = wire_payload(&rendered)?;
            self.client
                .publish(self.settings.topic.clone(), self.settings.qos, false, payload)
                .await
                .map_err(|e| SessionError::Publish(e.to_string()))?;
        }

        Ok(self.transition())
    }

    fn handle_event(&mut self, event: LinkEvent) -> Result<(), SessionError> {
        match event {
            LinkEvent::Message(message) => {
                info!(
                    "Received message from topic '{}': {}",
                    message.topic, message.payload
                );
                self.received += 1;
                if self.received_all() {
                    info!("All {} message(s) received", self.settings.count);
                }
            }
            LinkEvent::SubscriptionRejected { topic } => {
                return Err(SessionError::SubscriptionRejected(topic));
            }
            LinkEvent::Interrupted { reason } => {
                warn!("Connection interrupted. error: {}", reason);
            }
            LinkEvent::Resumed { session_present } => {
                info!("Connection resumed. session_present: {}", session_present);
            }
            LinkEvent::Connected { .. } => {
                debug!("Ignoring duplicate connect acknowledgement");
            }
        }
        Ok(())
    }
}

impl PubSession<Disconnecting> {
    pub async fn disconnect(self) -> Result<(), SessionError> {
        info!("Disconnecting...");
        self.client
            .disconnect()
            .await
            .map_err(|e| SessionError::Disconnect(e.to_string()))?;
        info!("Disconnected!");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::link::ReceivedMessage;
    use rumqttc::MqttOptions;

    fn test_client() -> AsyncClient {
        let options = MqttOptions::new("test-session", "localhost", 1883);
        // The event loop is kept alive but never polled: requests queue
        // in the client channel and nothing touches the network. (If it
        // were dropped, the request receiver would go with it and every
        // publish would fail.)
        let (client, event_loop) = AsyncClient::new(options, 32);
        std::mem::forget(event_loop);
        client
    }

    fn session(
        count: u64,
        message: &str,
    ) -> (PubSession<Connecting>, mpsc::Sender<LinkEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let settings = SessionSettings {
            cadence: Duration::from_millis(10),
            ..SessionSettings::new("test/topic".to_string(), message.to_string(), count)
        };
        let session = PubSession::create(test_client(), rx, settings, CancellationToken::new());
        (session, tx)
    }

    #[test]
    fn series_emits_the_exact_sequence() {
        let mut series = MessageSeries::new(3);
        let payloads: Vec<String> = std::iter::from_fn(|| series.next_payload())
            .map(|(_, payload)| payload)
            .collect();

        assert_eq!(
            payloads,
            vec![
                r#"{"testy":1}"#.to_string(),
                r#"{"testy":2}"#.to_string(),
                r#"{"testy":3}"#.to_string(),
            ]
        );
        assert!(series.is_complete());
    }

    #[test]
    fn series_never_exceeds_a_positive_target() {
        let mut series = MessageSeries::new(2);
        while series.next_payload().is_some() {}
        assert_eq!(series.issued(), 2);
        assert!(series.next_payload().is_none());
        assert_eq!(series.issued(), 2);
    }

    #[test]
    fn zero_target_never_completes() {
        let mut series = MessageSeries::new(0);
        for expected in 1..=1000u64 {
            let (sequence, _) = series.next_payload().unwrap();
            assert_eq!(sequence, expected);
        }
        assert!(!series.is_complete());
    }

    #[test]
    fn wire_payload_wraps_the_object_text_once_more() {
        let rendered = render_counter(1);
        assert_eq!(rendered, r#"{"testy":1}"#);
        assert_eq!(wire_payload(&rendered).unwrap(), r#""{\"testy\":1}""#);
    }

    #[tokio::test]
    async fn wait_connected_survives_an_early_interruption() {
        let (session, tx) = session(1, "Hello World!");
        tx.send(LinkEvent::Interrupted {
            reason: "connection reset".to_string(),
        })
        .await
        .unwrap();
        tx.send(LinkEvent::Connected {
            session_present: false,
        })
        .await
        .unwrap();

        let publishing = session.wait_connected().await.unwrap();
        assert_eq!(publishing.received(), 0);
    }

    #[tokio::test]
    async fn wait_connected_fails_when_the_link_goes_away() {
        let (session, tx) = session(1, "Hello World!");
        drop(tx);

        assert!(matches!(
            session.wait_connected().await,
            Err(SessionError::LinkClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_all_sends_the_configured_count() {
        let (session, tx) = session(3, "Hello World!");
        tx.send(LinkEvent::Connected {
            session_present: false,
        })
        .await
        .unwrap();

        let publishing = session.wait_connected().await.unwrap();
        let disconnecting = publishing.publish_all().await.unwrap();
        disconnecting.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_rejected_subscription_aborts_publishing() {
        let (session, tx) = session(5, "Hello World!");
        tx.send(LinkEvent::Connected {
            session_present: false,
        })
        .await
        .unwrap();
        tx.send(LinkEvent::SubscriptionRejected {
            topic: "test/topic".to_string(),
        })
        .await
        .unwrap();

        let publishing = session.wait_connected().await.unwrap();
        match publishing.publish_all().await {
            Err(SessionError::SubscriptionRejected(topic)) => assert_eq!(topic, "test/topic"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn received_messages_are_counted_toward_the_target() {
        let (session, tx) = session(2, "Hello World!");
        tx.send(LinkEvent::Connected {
            session_present: false,
        })
        .await
        .unwrap();
        tx.send(LinkEvent::Message(ReceivedMessage::from_parts(
            "test/topic".to_string(),
            r#"{"testy":1}"#.to_string(),
        )))
        .await
        .unwrap();
        tx.send(LinkEvent::Message(ReceivedMessage::from_parts(
            "test/topic".to_string(),
            r#"{"testy":2}"#.to_string(),
        )))
        .await
        .unwrap();

        let publishing = session.wait_connected().await.unwrap();
        let disconnecting = publishing.publish_all().await.unwrap();
        assert!(disconnecting.received_all());
        assert_eq!(disconnecting.received(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_blank_message_skips_publishing() {
        let (session, tx) = session(3, "");
        tx.send(LinkEvent::Connected {
            session_present: false,
        })
        .await
        .unwrap();

        let publishing = session.wait_connected().await.unwrap();
        let _disconnecting = publishing.publish_all().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_an_unbounded_run() {
        let (tx, rx) = mpsc::channel(16);
        let settings = SessionSettings {
            cadence: Duration::from_millis(10),
            ..SessionSettings::new("test/topic".to_string(), "Hello World!".to_string(), 0)
        };
        let cancel = CancellationToken::new();
        let session = PubSession::create(test_client(), rx, settings, cancel.clone());

        tx.send(LinkEvent::Connected {
            session_present: false,
        })
        .await
        .unwrap();
        let publishing = session.wait_connected().await.unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let disconnecting = publishing.publish_all().await.unwrap();
        canceller.await.unwrap();
        disconnecting.disconnect().await.unwrap();
    }
}
