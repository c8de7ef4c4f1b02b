use crate::config::Config;
use crate::dialect::{self, BrokerClient, ProtocolDialect, Session, SessionEvent, SessionOptions};
use crate::error::BridgeError;
use crate::last_value::Recorder;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

/// Outbound half of the broker, as seen by the tool operations.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Fire-and-forget publish. Fails only when the session is not up or the
    /// request queue is full; delivery is never confirmed.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Identity and subscriptions of the one live broker session.
#[derive(Debug, Clone)]
pub struct BrokerConnection {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub dialect: ProtocolDialect,
    pub topics: BTreeSet<String>,
}

impl BrokerConnection {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Routes deliveries for the watched topic into the last-value cell.
#[derive(Debug)]
pub struct SensorFeed {
    topic: String,
    recorder: Recorder,
}

impl SensorFeed {
    pub fn new(topic: impl Into<String>, recorder: Recorder) -> Self {
        Self {
            topic: topic.into(),
            recorder,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns `Ok(true)` when the payload was recorded and `Ok(false)` when
    /// the topic is not the watched one. Never blocks.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> Result<bool, BridgeError> {
        if topic != self.topic {
            return Ok(false);
        }
        let reading = decode_payload(topic, payload)?;
        self.recorder.set(reading);
        Ok(true)
    }
}

/// UTF-8 text with surrounding whitespace removed; empty readings are rejected.
pub fn decode_payload(topic: &str, payload: &[u8]) -> Result<String, BridgeError> {
    let text = std::str::from_utf8(payload).map_err(|e| BridgeError::decode(topic, e))?;
    let text = text.trim();
    if text.is_empty() {
        return Err(BridgeError::decode(topic, "empty payload"));
    }
    Ok(text.to_string())
}

#[derive(Debug, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Reconnected,
    Stop,
}

pub struct MqttService {
    client_state: Mutex<ClientState>,
    client: BrokerClient,
    connection: BrokerConnection,
    feed: SensorFeed,
    shutting_down: AtomicBool,
    pub(crate) config: Config,
}

impl MqttService {
    pub(crate) fn new(config: Config, client: BrokerClient, recorder: Recorder) -> Arc<Self> {
        let connection = BrokerConnection {
            client_id: config.mqtt_client_id.clone(),
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            dialect: client.dialect(),
            topics: BTreeSet::from([config.sensor_topic.clone()]),
        };
        Arc::new(Self {
            client_state: Mutex::new(ClientState::Connecting),
            client,
            connection,
            feed: SensorFeed::new(config.sensor_topic.clone(), recorder),
            shutting_down: AtomicBool::new(false),
            config,
        })
    }

    /// Opens the broker session and subscribes to the watched topic.
    ///
    /// Dialects are tried in the configured order, each with its own retry
    /// budget. The returned [`Session`] must be handed to [`MqttService::run`].
    pub async fn connect(
        config: Config,
        recorder: Recorder,
    ) -> Result<(Arc<Self>, Session), BridgeError> {
        let options = SessionOptions {
            client_id: config.mqtt_client_id.clone(),
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            keep_alive: config.keep_alive(),
            credentials: config
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
        };
        let endpoint = format!("{}:{}", options.host, options.port);
        let attempt_timeout = Duration::from_millis(config.mqtt_connect_timeout_ms);

        let mut last_error = None;
        for &dialect in config.mqtt_protocol.candidates() {
            info!("Connecting to MQTT broker at {} using {}...", endpoint, dialect);

            let strategy = ExponentialBackoff::from_millis(10)
                .factor(50)
                .max_delay(Duration::from_secs(10))
                .take(config.mqtt_connect_attempts.saturating_sub(1));

            let outcome = Retry::start(strategy, || {
                Self::handshake(dialect, &options, attempt_timeout)
            })
            .await;

            match outcome {
                Ok((client, session)) => {
                    info!("Connected to MQTT broker at {} ({}).", endpoint, dialect);
                    let service = Self::new(config, client, recorder);
                    service.on_connected().await;
                    return Ok((service, session));
                }
                Err(e) => {
                    warn!("{} handshake failed: {}", dialect, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(BridgeError::Connection {
            endpoint,
            reason: "no protocol dialect configured".to_string(),
        }))
    }

    async fn handshake(
        dialect: ProtocolDialect,
        options: &SessionOptions,
        limit: Duration,
    ) -> Result<(BrokerClient, Session), BridgeError> {
        let endpoint = format!("{}:{}", options.host, options.port);
        let (client, mut session) = dialect::open(dialect, options);

        let connack = async {
            loop {
                match session.poll().await {
                    Ok(SessionEvent::Connected) => return Ok(()),
                    Ok(_) => continue,
                    Err(reason) => return Err(reason),
                }
            }
        };
        let outcome = timeout(limit, connack).await;

        match outcome {
            Ok(Ok(())) => Ok((client, session)),
            Ok(Err(reason)) => {
                debug!("Handshake with {} failed: {}", endpoint, reason);
                Err(BridgeError::Connection { endpoint, reason })
            }
            Err(_) => Err(BridgeError::Connection {
                endpoint,
                reason: format!("no CONNACK within {:?}", limit),
            }),
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    async fn set_state(&self, state: ClientState) {
        let mut client_state = self.client_state.lock().await;
        *client_state = state;
    }

    pub async fn is_connected(&self) -> bool {
        *self.client_state.lock().await == ClientState::Connected
    }

    /// Runs on every accepted handshake so subscriptions survive reconnects.
    async fn on_connected(&self) {
        self.set_state(ClientState::Connected).await;
        for topic in &self.connection.topics {
            match self.client.try_subscribe(topic) {
                Ok(()) => info!("Subscribed to topic '{}'.", topic),
                Err(e) => error!("{}", e),
            }
        }
    }

    /// Drives the session until shutdown or until the retry budget is spent.
    ///
    /// This is the background network context: it owns the only writer of the
    /// last-value cell and never waits on tool callers.
    pub async fn run(self: Arc<Self>, mut session: Session) {
        let initial_retry_interval = Duration::from_millis(self.config.mqtt_retry_interval_ms);
        let max_retries = self.config.mqtt_max_retries;
        let mut retry_interval = initial_retry_interval;
        let mut retries = 0;

        loop {
            match session.poll().await {
                Ok(event) => match self.handle_event(event).await {
                    LoopControl::Continue => {}
                    LoopControl::Reconnected => {
                        retries = 0;
                        retry_interval = initial_retry_interval;
                    }
                    LoopControl::Stop => break,
                },
                Err(e) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        debug!("MQTT event loop closed during shutdown: {}", e);
                        break;
                    }

                    error!("Error in MQTT event loop: {}", e);
                    self.set_state(ClientState::Disconnected).await;

                    retries += 1;
                    if max_retries >= 0 && retries > max_retries {
                        error!(
                            "Maximum number of retries ({}) reached. Stopping the service.",
                            max_retries
                        );
                        self.set_state(ClientState::Error(e)).await;
                        break;
                    }

                    warn!(
                        "Lost connection to MQTT broker. Retrying in {:?}...",
                        retry_interval
                    );
                    sleep(retry_interval).await;
                    retry_interval = (retry_interval * 2).min(Duration::from_secs(60));
                    self.set_state(ClientState::Connecting).await;
                }
            }
        }
        info!("MQTT event loop stopped.");
    }

    async fn handle_event(&self, event: SessionEvent) -> LoopControl {
        match event {
            SessionEvent::Connected => {
                info!("Reconnected to MQTT broker.");
                self.on_connected().await;
                LoopControl::Reconnected
            }
            SessionEvent::Message { topic, payload } => {
                match self.feed.on_message(&topic, &payload) {
                    Ok(true) => debug!("Reading updated from '{}'.", topic),
                    Ok(false) => warn!("Unknown topic received: {}", topic),
                    Err(e) => warn!("Dropping message: {}", e),
                }
                LoopControl::Continue
            }
            SessionEvent::SubscriptionDenied { reason } => {
                let e = BridgeError::Subscription {
                    topic: self.feed.topic().to_string(),
                    reason,
                };
                error!("{}", e);
                LoopControl::Continue
            }
            SessionEvent::Disconnected if self.shutting_down.load(Ordering::SeqCst) => {
                LoopControl::Stop
            }
            SessionEvent::Disconnected | SessionEvent::Other => LoopControl::Continue,
        }
    }

    /// Unsubscribes and disconnects. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for topic in &self.connection.topics {
            if let Err(e) = self.client.unsubscribe(topic).await {
                warn!("Failed to unsubscribe from '{}': {}", topic, e);
            }
        }
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to disconnect from MQTT broker: {}", e);
        }
        self.set_state(ClientState::Disconnected).await;
    }
}

#[async_trait]
impl Publisher for MqttService {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError> {
        if !self.is_connected().await {
            return Err(BridgeError::publish(topic, "client is not connected"));
        }

        match self.client.try_publish(topic, payload) {
            Ok(()) => {
                info!("Message published to '{}': {}", topic, payload);
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                Err(e)
            }
        }
    }
}
