//! Event pump between the `rumqttc` event loop and the session.
//!
//! The pump owns the subscription list: on every accepted CONNACK that
//! arrives without a present session it re-issues every subscription and
//! matches SUBACK return codes back to topic names in request order, so
//! the initial subscribe and resubscription after a lost session share
//! one code path. Everything else is translated into [`LinkEvent`]
//! values for the session to consume.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::NaiveDateTime;
use rumqttc::{AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, Packet, QoS, SubAck,
    SubscribeReasonCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before the next poll after a connection error.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Connection lifecycle and message events, in arrival order.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// First accepted CONNACK.
    Connected { session_present: bool },
    /// Any later accepted CONNACK.
    Resumed { session_present: bool },
    /// The connection dropped or the broker refused it; the event loop
    /// retries on its own.
    Interrupted { reason: String },
    /// An inbound publish on a subscribed topic.
    Message(ReceivedMessage),
    /// The broker refused a (re)subscription; fatal for the session.
    SubscriptionRejected { topic: String },
}

/// An inbound message with its arrival timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: String,
    pub timestamp: NaiveDateTime,
}

impl ReceivedMessage {
    pub fn from_parts(topic: String, payload: String) -> Self {
        Self {
            topic,
            payload,
            timestamp: chrono::Local::now().naive_local(),
        }
    }
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}: {}", self.timestamp, self.topic, self.payload)
    }
}

/// A topic the pump keeps subscribed across sessions.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

/// Spawns the pump task. It runs until the event receiver goes away.
pub fn spawn_pump(
    client: AsyncClient,
    event_loop: EventLoop,
    events: mpsc::Sender<LinkEvent>,
    subscriptions: Vec<Subscription>,
) -> JoinHandle<()> {
    let pump = LinkPump {
        client,
        events,
        subscriptions,
        pending_subacks: VecDeque::new(),
        connected_once: false,
    };
    tokio::spawn(pump.run(event_loop))
}

struct LinkPump {
    client: AsyncClient,
    events: mpsc::Sender<LinkEvent>,
    subscriptions: Vec<Subscription>,
    /// Topic batches awaiting a SUBACK, in request order.
    pending_subacks: VecDeque<Vec<String>>,
    connected_once: bool,
}

impl LinkPump {
    async fn run(mut self, mut event_loop: EventLoop) {
        loop {
            let forwarded = match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => self.handle_connack(ack).await,
                Ok(Event::Incoming(Packet::SubAck(ack))) => self.handle_suback(ack).await,
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    let message = ReceivedMessage::from_parts(publish.topic, payload);
                    debug!("Inbound publish: {}", message);
                    self.forward(LinkEvent::Message(message)).await
                }
                Ok(event) => {
                    debug!("Ignoring protocol event: {:?}", event);
                    Ok(())
                }
                Err(e) => {
                    warn!("Connection interrupted. error: {}", e);
                    let sent = self
                        .forward(LinkEvent::Interrupted {
                            reason: e.to_string(),
                        })
                        .await;
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                    sent
                }
            };
            if forwarded.is_err() {
                break;
            }
        }
        debug!("Link pump stopped");
    }

    async fn handle_connack(&mut self, ack: ConnAck) -> Result<(), ()> {
        if ack.code != ConnectReturnCode::Success {
            warn!("Broker refused the connection: {:?}", ack.code);
            return self
                .forward(LinkEvent::Interrupted {
                    reason: format!("{:?}", ack.code),
                })
                .await;
        }

        let event = if self.connected_once {
            info!(
                "Connection resumed. session_present: {}",
                ack.session_present
            );
            LinkEvent::Resumed {
                session_present: ack.session_present,
            }
        } else {
            self.connected_once = true;
            LinkEvent::Connected {
                session_present: ack.session_present,
            }
        };
        self.forward(event).await?;

        if !ack.session_present {
            self.subscribe_all().await;
        }
        Ok(())
    }

    /// Issues every configured subscription and records the batch for
    /// SUBACK matching.
    async fn subscribe_all(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }
        if !self.pending_subacks.is_empty() {
            debug!("Dropping stale SUBACK bookkeeping from the previous session");
            self.pending_subacks.clear();
        }
        info!(
            "Session did not persist. Subscribing to {} topic(s)...",
            self.subscriptions.len()
        );
        for subscription in &self.subscriptions {
            match self
                .client
                .subscribe(subscription.topic.clone(), subscription.qos)
                .await
            {
                Ok(()) => self
                    .pending_subacks
                    .push_back(vec![subscription.topic.clone()]),
                Err(e) => error!(
                    "Failed to request subscription to '{}': {}",
                    subscription.topic, e
                ),
            }
        }
    }

    async fn handle_suback(&mut self, ack: SubAck) -> Result<(), ()> {
        let Some(topics) = self.pending_subacks.pop_front() else {
            debug!("SUBACK without a pending request (pkid {})", ack.pkid);
            return Ok(());
        };
        match match_suback(&topics, &ack.return_codes) {
            Ok(granted) => {
                for (topic, qos) in granted {
                    info!("Subscribed to '{}' with {:?}", topic, qos);
                }
                Ok(())
            }
            Err(topic) => {
                error!("Server rejected resubscribe to topic: {}", topic);
                self.forward(LinkEvent::SubscriptionRejected { topic }).await
            }
        }
    }

    async fn forward(&self, event: LinkEvent) -> Result<(), ()> {
        self.events.send(event).await.map_err(|_| ())
    }
}

/// Zips SUBACK return codes with the requested topics.
///
/// Returns the granted topic/QoS pairs, or the first topic the broker
/// rejected. A missing code counts as a rejection of its topic.
pub fn match_suback(
    topics: &[String],
    codes: &[SubscribeReasonCode],
) -> Result<Vec<(String, QoS)>, String> {
    let mut granted = Vec::with_capacity(topics.len());
    for (index, topic) in topics.iter().enumerate() {
        match codes.get(index) {
            Some(SubscribeReasonCode::Success(qos)) => granted.push((topic.clone(), *qos)),
            Some(SubscribeReasonCode::Failure) | None => return Err(topic.clone()),
        }
    }
    Ok(granted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn granted_codes_zip_with_topics_in_order() {
        let granted = match_suback(
            &topics(&["a/b", "c/d"]),
            &[
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Success(QoS::AtMostOnce),
            ],
        )
        .unwrap();

        assert_eq!(
            granted,
            vec![
                ("a/b".to_string(), QoS::AtLeastOnce),
                ("c/d".to_string(), QoS::AtMostOnce),
            ]
        );
    }

    #[test]
    fn a_failure_code_names_the_rejected_topic() {
        let result = match_suback(
            &topics(&["a/b", "c/d"]),
            &[
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        );
        assert_eq!(result, Err("c/d".to_string()));
    }

    #[test]
    fn a_missing_code_rejects_its_topic() {
        let result = match_suback(
            &topics(&["a/b", "c/d"]),
            &[SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        );
        assert_eq!(result, Err("c/d".to_string()));
    }

    #[test]
    fn received_messages_render_topic_and_payload() {
        let message =
            ReceivedMessage::from_parts("test/topic".to_string(), "{\"testy\":1}".to_string());
        let rendered = message.to_string();
        assert!(rendered.contains("test/topic"));
        assert!(rendered.contains("{\"testy\":1}"));
    }
}
