//! MQTT 3.1.1 and MQTT 5 behind one client/session interface.
//!
//! rumqttc ships the two protocol versions as separate APIs with different
//! event and packet types. The adapter picks one [`ProtocolDialect`] at
//! connect time and from then on only talks to [`BrokerClient`] and
//! [`Session`], so message handling is identical for either dialect.

use rumqttc::v5;
use rumqttc::v5::mqttbytes::v5::Packet as V5Packet;
use rumqttc::{Event, Outgoing, Packet, QoS};
use std::fmt;
use std::time::Duration;

use crate::error::BridgeError;

const REQUEST_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolDialect {
    V311,
    V5,
}

impl fmt::Display for ProtocolDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolDialect::V311 => write!(f, "MQTT 3.1.1"),
            ProtocolDialect::V5 => write!(f, "MQTT 5"),
        }
    }
}

/// Everything needed to open a session, independent of the dialect.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub credentials: Option<(String, String)>,
}

/// Dialect-neutral view of what the network loop observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Broker accepted the handshake (initial connect or reconnect).
    Connected,
    Message { topic: String, payload: Vec<u8> },
    SubscriptionDenied { reason: String },
    /// Our own disconnect request went out.
    Disconnected,
    Other,
}

/// Client half: cheap to clone, usable from any task.
#[derive(Clone)]
pub enum BrokerClient {
    V311(rumqttc::AsyncClient),
    V5(v5::AsyncClient),
}

/// Network half: must be polled continuously to drive the connection.
pub enum Session {
    V311(rumqttc::EventLoop),
    V5(v5::EventLoop),
}

/// Creates a client and its not-yet-connected session for `dialect`.
///
/// No I/O happens here; the handshake starts on the first [`Session::poll`].
pub fn open(dialect: ProtocolDialect, options: &SessionOptions) -> (BrokerClient, Session) {
    match dialect {
        ProtocolDialect::V311 => {
            let mut mqtt_options =
                rumqttc::MqttOptions::new(&options.client_id, &options.host, options.port);
            mqtt_options.set_keep_alive(options.keep_alive);
            mqtt_options.set_clean_session(true);
            if let Some((username, password)) = &options.credentials {
                mqtt_options.set_credentials(username, password);
            }
            let (client, eventloop) = rumqttc::AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
            (BrokerClient::V311(client), Session::V311(eventloop))
        }
        ProtocolDialect::V5 => {
            let mut mqtt_options =
                v5::MqttOptions::new(&options.client_id, &options.host, options.port);
            mqtt_options.set_keep_alive(options.keep_alive);
            mqtt_options.set_clean_start(true);
            if let Some((username, password)) = &options.credentials {
                mqtt_options.set_credentials(username, password);
            }
            let (client, eventloop) = v5::AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
            (BrokerClient::V5(client), Session::V5(eventloop))
        }
    }
}

impl BrokerClient {
    pub fn dialect(&self) -> ProtocolDialect {
        match self {
            BrokerClient::V311(_) => ProtocolDialect::V311,
            BrokerClient::V5(_) => ProtocolDialect::V5,
        }
    }

    /// Queues a subscription request. Safe to call from the task that polls
    /// the session, since it never waits for the network loop.
    pub fn try_subscribe(&self, topic: &str) -> Result<(), BridgeError> {
        let result = match self {
            BrokerClient::V311(client) => client
                .try_subscribe(topic, QoS::AtMostOnce)
                .map_err(|e| e.to_string()),
            BrokerClient::V5(client) => client
                .try_subscribe(topic, v5::mqttbytes::QoS::AtMostOnce)
                .map_err(|e| e.to_string()),
        };
        result.map_err(|reason| BridgeError::Subscription {
            topic: topic.to_string(),
            reason,
        })
    }

    /// Queues a publish without waiting for the network loop.
    pub fn try_publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError> {
        let result = match self {
            BrokerClient::V311(client) => client
                .try_publish(topic, QoS::AtMostOnce, false, payload.to_owned())
                .map_err(|e| e.to_string()),
            BrokerClient::V5(client) => client
                .try_publish(topic, v5::mqttbytes::QoS::AtMostOnce, false, payload.to_owned())
                .map_err(|e| e.to_string()),
        };
        result.map_err(|reason| BridgeError::publish(topic, reason))
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), String> {
        match self {
            BrokerClient::V311(client) => client.unsubscribe(topic).await.map_err(|e| e.to_string()),
            BrokerClient::V5(client) => client.unsubscribe(topic).await.map_err(|e| e.to_string()),
        }
    }

    pub async fn disconnect(&self) -> Result<(), String> {
        match self {
            BrokerClient::V311(client) => client.disconnect().await.map_err(|e| e.to_string()),
            BrokerClient::V5(client) => client.disconnect().await.map_err(|e| e.to_string()),
        }
    }
}

impl Session {
    /// Drives the connection one step. Errors describe a broken or refused
    /// connection; polling again afterwards reconnects.
    pub async fn poll(&mut self) -> Result<SessionEvent, String> {
        match self {
            Session::V311(eventloop) => eventloop
                .poll()
                .await
                .map(from_v311)
                .map_err(|e| e.to_string()),
            Session::V5(eventloop) => eventloop
                .poll()
                .await
                .map(from_v5)
                .map_err(|e| e.to_string()),
        }
    }
}

pub fn from_v311(event: Event) -> SessionEvent {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => SessionEvent::Connected,
        Event::Incoming(Packet::Publish(publish)) => SessionEvent::Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        },
        Event::Incoming(Packet::SubAck(suback)) => {
            let denied = suback
                .return_codes
                .iter()
                .any(|code| matches!(code, rumqttc::SubscribeReasonCode::Failure));
            if denied {
                SessionEvent::SubscriptionDenied {
                    reason: format!("broker returned {:?}", suback.return_codes),
                }
            } else {
                SessionEvent::Other
            }
        }
        Event::Outgoing(Outgoing::Disconnect) => SessionEvent::Disconnected,
        _ => SessionEvent::Other,
    }
}

/// Same mapping for MQTT 5. Publish properties are accepted and ignored.
pub fn from_v5(event: v5::Event) -> SessionEvent {
    match event {
        v5::Event::Incoming(V5Packet::ConnAck(_)) => SessionEvent::Connected,
        v5::Event::Incoming(V5Packet::Publish(publish)) => {
            match String::from_utf8(publish.topic.to_vec()) {
                Ok(topic) => SessionEvent::Message {
                    topic,
                    payload: publish.payload.to_vec(),
                },
                // a topic we cannot name cannot be the watched one
                Err(_) => SessionEvent::Other,
            }
        }
        v5::Event::Incoming(V5Packet::SubAck(suback)) => {
            let denied = suback.return_codes.iter().any(|code| {
                !matches!(code, v5::mqttbytes::v5::SubscribeReasonCode::Success(_))
            });
            if denied {
                SessionEvent::SubscriptionDenied {
                    reason: format!("broker returned {:?}", suback.return_codes),
                }
            } else {
                SessionEvent::Other
            }
        }
        v5::Event::Outgoing(Outgoing::Disconnect) => SessionEvent::Disconnected,
        _ => SessionEvent::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v311_publish_becomes_message() {
        let publish = rumqttc::Publish::new("ucb/test/topic/distance", QoS::AtMostOnce, "12.5");
        assert_eq!(
            from_v311(Event::Incoming(Packet::Publish(publish))),
            SessionEvent::Message {
                topic: "ucb/test/topic/distance".to_string(),
                payload: b"12.5".to_vec(),
            }
        );
    }

    #[test]
    fn v5_publish_becomes_the_same_message() {
        let publish = v5::mqttbytes::v5::Publish::new(
            "ucb/test/topic/distance",
            v5::mqttbytes::QoS::AtMostOnce,
            "12.5",
            None,
        );
        assert_eq!(
            from_v5(v5::Event::Incoming(V5Packet::Publish(publish))),
            SessionEvent::Message {
                topic: "ucb/test/topic/distance".to_string(),
                payload: b"12.5".to_vec(),
            }
        );
    }

    #[test]
    fn v311_suback_failure_is_reported() {
        let denied = rumqttc::SubAck::new(7, vec![rumqttc::SubscribeReasonCode::Failure]);
        assert!(matches!(
            from_v311(Event::Incoming(Packet::SubAck(denied))),
            SessionEvent::SubscriptionDenied { .. }
        ));

        let granted = rumqttc::SubAck::new(
            8,
            vec![rumqttc::SubscribeReasonCode::Success(QoS::AtMostOnce)],
        );
        assert_eq!(
            from_v311(Event::Incoming(Packet::SubAck(granted))),
            SessionEvent::Other
        );
    }

    #[test]
    fn outgoing_disconnect_is_reported_for_both_dialects() {
        assert_eq!(
            from_v311(Event::Outgoing(Outgoing::Disconnect)),
            SessionEvent::Disconnected
        );
        assert_eq!(
            from_v5(v5::Event::Outgoing(Outgoing::Disconnect)),
            SessionEvent::Disconnected
        );
        assert_eq!(from_v311(Event::Incoming(Packet::PingResp)), SessionEvent::Other);
    }

    #[tokio::test]
    async fn open_selects_the_requested_dialect() {
        let options = SessionOptions {
            client_id: "dialect-test".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            keep_alive: Duration::from_secs(30),
            credentials: None,
        };
        let (client, _session) = open(ProtocolDialect::V5, &options);
        assert_eq!(client.dialect(), ProtocolDialect::V5);
        let (client, _session) = open(ProtocolDialect::V311, &options);
        assert_eq!(client.dialect(), ProtocolDialect::V311);
    }
}
