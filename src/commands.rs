use crate::mqtt_service::Publisher;
use tracing::{info, warn};

/// Actuator commands understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    On,
    Off,
}

impl Command {
    /// Case- and whitespace-insensitive lookup; Spanish and English tokens.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "encender" | "on" => Some(Command::On),
            "apagar" | "off" => Some(Command::Off),
            _ => None,
        }
    }

    /// Payload the device expects on the actuator topic.
    pub fn payload(self) -> &'static str {
        match self {
            Command::On => "ON",
            Command::Off => "OFF",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Command::On => "LED on",
            Command::Off => "LED off",
        }
    }
}

/// Publishes `input` to the actuator topic and describes what happened.
///
/// Always returns a description; publish failures are reported in the text.
pub async fn control_actuator(publisher: &dyn Publisher, topic: &str, input: &str) -> String {
    let Some(command) = Command::parse(input) else {
        warn!("Rejected actuator command {:?}", input);
        return "Unrecognized command. Use 'encender'/'on' or 'apagar'/'off'.".to_string();
    };

    match publisher.publish(topic, command.payload()).await {
        Ok(()) => {
            info!("Actuator command {:?} sent to '{}'", command, topic);
            format!("{} (published '{}')", command.describe(), command.payload())
        }
        Err(e) => {
            warn!("Actuator command {:?} not sent: {}", command, e);
            format!(
                "Could not send '{}' to the device: {}",
                command.payload(),
                e
            )
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::BridgeError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory stand-in for the broker.
    #[derive(Default)]
    pub(crate) struct FakePublisher {
        pub(crate) sent: Mutex<Vec<(String, String)>>,
        pub(crate) offline: bool,
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        async fn publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError> {
            if self.offline {
                return Err(BridgeError::publish(topic, "client is not connected"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    const TOPIC: &str = "ucb/test/topic/led";

    #[test]
    fn parses_both_vocabularies() {
        for token in ["on", "ON", "  Encender ", "eNcEnDeR\n"] {
            assert_eq!(Command::parse(token), Some(Command::On), "{token:?}");
        }
        for token in ["off", " OFF", "apagar", "APAGAR\t"] {
            assert_eq!(Command::parse(token), Some(Command::Off), "{token:?}");
        }
        for token in ["", "toggle", "o n", "onn"] {
            assert_eq!(Command::parse(token), None, "{token:?}");
        }
    }

    #[tokio::test]
    async fn on_tokens_publish_on() {
        let publisher = FakePublisher::default();
        let reply = control_actuator(&publisher, TOPIC, " Encender ").await;
        assert_eq!(reply, "LED on (published 'ON')");
        assert_eq!(
            *publisher.sent.lock().unwrap(),
            vec![(TOPIC.to_string(), "ON".to_string())]
        );
    }

    #[tokio::test]
    async fn off_tokens_publish_off() {
        let publisher = FakePublisher::default();
        let reply = control_actuator(&publisher, TOPIC, "off").await;
        assert_eq!(reply, "LED off (published 'OFF')");
        assert_eq!(
            *publisher.sent.lock().unwrap(),
            vec![(TOPIC.to_string(), "OFF".to_string())]
        );
    }

    #[tokio::test]
    async fn unknown_tokens_publish_nothing() {
        let publisher = FakePublisher::default();
        let reply = control_actuator(&publisher, TOPIC, "blink").await;
        assert!(reply.starts_with("Unrecognized command"));
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_described_not_raised() {
        let publisher = FakePublisher {
            offline: true,
            ..Default::default()
        };
        let reply = control_actuator(&publisher, TOPIC, "on").await;
        assert!(reply.starts_with("Could not send 'ON'"));
        assert!(reply.contains("not connected"));
    }
}
