//! MQTT transport for the cross-node bridge, using rumqttc.
//!
//! Each category maps to the topic `<prefix>/<category>`. Messages go out
//! at QoS 0: the bridge is best-effort and a broker-side retry would only
//! deliver stale notifications late.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bridge::{PubSub, PubSubMessage};
use crate::error::BridgeError;
use crate::event::EventCategory;

/// Capacity of the incoming message channel.
const INCOMING_CAPACITY: usize = 1024;

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 256;

/// MQTT connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBridgeConfig {
    /// Broker URL, e.g. `mqtt://localhost:1883`.
    pub broker_url: String,
    /// Client id; must be unique per node.
    pub client_id: String,
    /// Topic prefix shared by all nodes of a deployment.
    pub topic_prefix: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
}

impl Default for MqttBridgeConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: format!("tasksync-{}", uuid::Uuid::new_v4()),
            topic_prefix: "tasksync".to_string(),
            keep_alive_secs: 30,
        }
    }
}

/// Pub/sub over an MQTT broker.
pub struct MqttPubSub {
    client: AsyncClient,
    topic_prefix: String,
    event_loop: Mutex<Option<EventLoop>>,
    message_tx: broadcast::Sender<PubSubMessage>,
}

impl MqttPubSub {
    /// Create the client. The connection is made by the event loop, which
    /// starts on the first [`PubSub::subscribe`].
    pub fn connect(config: MqttBridgeConfig) -> Result<Self, BridgeError> {
        let (host, port) = parse_broker_url(&config.broker_url)?;

        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (message_tx, _) = broadcast::channel(INCOMING_CAPACITY);

        info!(
            broker = %config.broker_url,
            client_id = %config.client_id,
            "MQTT bridge client created"
        );

        Ok(Self {
            client,
            topic_prefix: config.topic_prefix,
            event_loop: Mutex::new(Some(event_loop)),
            message_tx,
        })
    }

    fn topic(&self, category: EventCategory) -> String {
        topic_for(&self.topic_prefix, category)
    }

    fn spawn_event_loop(&self, mut event_loop: EventLoop) {
        let client = self.client.clone();
        let prefix = self.topic_prefix.clone();
        let message_tx = self.message_tx.clone();

        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(category) = category_for(&prefix, &publish.topic) else {
                            debug!(topic = %publish.topic, "Ignoring message on unknown topic");
                            continue;
                        };
                        // No receivers is fine.
                        let _ = message_tx.send(PubSubMessage {
                            category,
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!(code = ?ack.code, "Connected to MQTT broker");
                        // Clean sessions drop subscriptions on reconnect.
                        for category in EventCategory::ALL {
                            if let Err(e) =
                                client.try_subscribe(topic_for(&prefix, category), QoS::AtMostOnce)
                            {
                                warn!(category = %category, error = %e, "MQTT subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("MQTT subscription acknowledged");
                    }
                    Ok(Event::Incoming(Packet::PingResp)) | Ok(Event::Outgoing(_)) => {}
                    Ok(event) => {
                        debug!(?event, "MQTT event");
                    }
                    Err(e) => {
                        error!(error = %e, "MQTT connection error");
                        // rumqttc reconnects on the next poll.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl PubSub for MqttPubSub {
    async fn publish(&self, category: EventCategory, payload: Vec<u8>) -> Result<(), BridgeError> {
        let topic = self.topic(category);
        let len = payload.len();
        self.client
            .publish(&topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))?;
        debug!(topic = %topic, bytes = len, "Published to MQTT");
        Ok(())
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<PubSubMessage>, BridgeError> {
        let rx = self.message_tx.subscribe();
        let event_loop = self.event_loop.lock().take();
        if let Some(event_loop) = event_loop {
            self.spawn_event_loop(event_loop);
        }
        Ok(rx)
    }
}

fn topic_for(prefix: &str, category: EventCategory) -> String {
    format!("{}/{}", prefix, category.as_str())
}

fn category_for(prefix: &str, topic: &str) -> Option<EventCategory> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    EventCategory::parse(rest)
}

/// Parse a broker URL into host and port.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), BridgeError> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port) = match stripped.split_once(':') {
        Some((host, port)) => {
            let port = port
                .trim_end_matches('/')
                .parse()
                .map_err(|_| BridgeError::Connection(format!("invalid port in URL: {}", url)))?;
            (host, port)
        }
        None => (stripped.trim_end_matches('/'), 1883),
    };

    if host.is_empty() {
        return Err(BridgeError::Connection(format!("invalid broker URL: {}", url)));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url_with_port() {
        let (host, port) = parse_broker_url("mqtt://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_default_port() {
        let (host, port) = parse_broker_url("tcp://broker.example.com").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_errors() {
        assert!(parse_broker_url("mqtt://host:notaport").is_err());
        assert!(parse_broker_url("mqtt://").is_err());
    }

    #[test]
    fn test_topics() {
        assert_eq!(
            topic_for("tasksync", EventCategory::TaskSync),
            "tasksync/task-sync"
        );
        assert_eq!(
            category_for("tasksync", "tasksync/presence-sync"),
            Some(EventCategory::PresenceSync)
        );
        assert_eq!(category_for("tasksync", "other/presence-sync"), None);
        assert_eq!(category_for("tasksync", "tasksync/unknown"), None);
    }

    #[tokio::test]
    async fn test_client_creation_does_not_connect() {
        let pubsub = MqttPubSub::connect(MqttBridgeConfig::default()).unwrap();
        assert_eq!(pubsub.topic(EventCategory::ActivitySync), "tasksync/activity-sync");
    }
}
