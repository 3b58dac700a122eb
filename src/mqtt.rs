//! Shared MQTT client.
//!
//! One connection serves every subsystem: providers subscribe to the topics
//! they own and unsubscribe on teardown, controllers publish telemetry under
//! the configured topic prefix. Subscriptions are dispatched by exact topic
//! match from the event loop task.

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;

pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),
    #[error("JSON path '{0}' not found in payload")]
    PathMissing(String),
    #[error("value at '{0}' is not numeric")]
    NotNumeric(String),
}

pub struct MqttService {
    client: Option<AsyncClient>,
    prefix: String,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<HashMap<String, MessageCallback>>>,
}

impl MqttService {
    /// Connects and spawns the event loop task. With MQTT disabled in the
    /// configuration, returns a no-op service.
    pub fn new(config: &MqttConfig, cancel: CancellationToken) -> Arc<Self> {
        if !config.enabled {
            return Arc::new(Self {
                client: None,
                prefix: config.topic_prefix.clone(),
                connected: Arc::new(AtomicBool::new(false)),
                subscriptions: Arc::new(Mutex::new(HashMap::new())),
            });
        }

        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(60));
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 100);

        let connected = Arc::new(AtomicBool::new(false));
        let subscriptions: Arc<Mutex<HashMap<String, MessageCallback>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let service = Arc::new(Self {
            client: Some(client.clone()),
            prefix: config.topic_prefix.clone(),
            connected: Arc::clone(&connected),
            subscriptions: Arc::clone(&subscriptions),
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("MQTT event loop stopped");
                        return;
                    }
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("MQTT connected");
                            connected.store(true, Ordering::Relaxed);

                            // the broker forgets subscriptions across
                            // reconnects; re-issue all of them
                            let topics: Vec<String> =
                                subscriptions.lock().keys().cloned().collect();
                            for topic in topics {
                                if let Err(e) =
                                    client.subscribe(topic.as_str(), QoS::AtMostOnce).await
                                {
                                    warn!(topic, error = %e, "MQTT resubscribe failed");
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let callback = subscriptions.lock().get(&publish.topic).cloned();
                            if let Some(callback) = callback {
                                callback(&publish.topic, &publish.payload);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            connected.store(false, Ordering::Relaxed);
                            warn!(error = %e, "MQTT connection error, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        service
    }

    /// A service that drops every publish and subscription. Used when MQTT
    /// is disabled and in tests.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            client: None,
            prefix: String::new(),
            connected: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Subscribe to a full topic. The callback runs on the event loop task
    /// and must not block.
    pub async fn subscribe(&self, topic: &str, callback: MessageCallback) {
        self.subscriptions
            .lock()
            .insert(topic.to_string(), callback);

        if let Some(client) = &self.client {
            if let Err(e) = client.subscribe(topic, QoS::AtMostOnce).await {
                warn!(topic, error = %e, "MQTT subscribe failed");
            } else {
                debug!(topic, "MQTT subscribed");
            }
        }
    }

    pub async fn unsubscribe(&self, topic: &str) {
        self.subscriptions.lock().remove(topic);

        if let Some(client) = &self.client {
            if let Err(e) = client.unsubscribe(topic).await {
                warn!(topic, error = %e, "MQTT unsubscribe failed");
            }
        }
    }

    /// Publish under the configured prefix.
    pub async fn publish(&self, subtopic: &str, payload: String) {
        self.publish_raw(subtopic, payload, false).await;
    }

    /// Publish a retained value under the configured prefix. Used for the
    /// small amount of persistent state (battery charge history).
    pub async fn publish_retained(&self, subtopic: &str, payload: String) {
        self.publish_raw(subtopic, payload, true).await;
    }

    async fn publish_raw(&self, subtopic: &str, payload: String, retain: bool) {
        let Some(client) = &self.client else { return };

        let topic = format!("{}{}", self.prefix, subtopic);
        if let Err(e) = client
            .publish(topic.as_str(), QoS::AtMostOnce, retain, payload)
            .await
        {
            warn!(topic, error = %e, "MQTT publish failed");
        }
    }
}

/// Extract a numeric value from a payload that is either a bare number or a
/// JSON document addressed by an optional dotted path.
pub fn numeric_from_payload(payload: &[u8], json_path: Option<&str>) -> Result<f32, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    let text = text.trim();

    if json_path.is_none() {
        if let Ok(value) = text.parse::<f32>() {
            return Ok(value);
        }
    }

    let document: serde_json::Value =
        serde_json::from_str(text).map_err(|e| PayloadError::NotJson(e.to_string()))?;

    let path = json_path.unwrap_or("");
    let mut node = &document;
    if !path.is_empty() {
        for key in path.split('.') {
            node = node
                .get(key)
                .ok_or_else(|| PayloadError::PathMissing(path.to_string()))?;
        }
    }

    match node {
        serde_json::Value::Number(number) => number
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| PayloadError::NotNumeric(path.to_string())),
        serde_json::Value::String(string) => string
            .trim()
            .parse::<f32>()
            .map_err(|_| PayloadError::NotNumeric(path.to_string())),
        _ => Err(PayloadError::NotNumeric(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_number() {
        assert_eq!(numeric_from_payload(b"42.5", None).unwrap(), 42.5);
        assert_eq!(numeric_from_payload(b"  -17 \n", None).unwrap(), -17.0);
    }

    #[test]
    fn parses_json_scalar_without_path() {
        assert_eq!(numeric_from_payload(b"23.4", None).unwrap(), 23.4);
    }

    #[test]
    fn parses_dotted_path() {
        let payload = br#"{"battery": {"soc": {"value": 81.5}}}"#;
        assert_eq!(
            numeric_from_payload(payload, Some("battery.soc.value")).unwrap(),
            81.5
        );
    }

    #[test]
    fn parses_numeric_string_leaf() {
        let payload = br#"{"power": "230.0"}"#;
        assert_eq!(numeric_from_payload(payload, Some("power")).unwrap(), 230.0);
    }

    #[test]
    fn missing_path_is_an_error() {
        let payload = br#"{"a": 1}"#;
        assert!(matches!(
            numeric_from_payload(payload, Some("b")),
            Err(PayloadError::PathMissing(_))
        ));
    }

    #[test]
    fn non_numeric_leaf_is_an_error() {
        let payload = br#"{"a": [1, 2]}"#;
        assert!(matches!(
            numeric_from_payload(payload, Some("a")),
            Err(PayloadError::NotNumeric(_))
        ));
    }
}
