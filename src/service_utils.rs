use std::io;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::dialect::Session;
use crate::mqtt_service::MqttService;
use crate::tool_server::{self, ToolBridge};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Start the MQTT event loop on its own task
pub fn start_mqtt_service(mqtt_service: Arc<MqttService>, session: Session) -> JoinHandle<()> {
    tokio::spawn(async move {
        mqtt_service.run(session).await;
    })
}

/// Serve tool calls on stdin/stdout until input closes or a termination signal arrives
pub async fn serve_stdio(bridge: Arc<ToolBridge>) -> io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = tool_server::serve(bridge, stdin, stdout) => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Termination signal received."),
                Err(e) => error!("Failed to handle termination signal: {:?}", e),
            }
            Ok(())
        }
    }
}

/// Unsubscribe, disconnect and stop the event loop, each within a bounded time
pub async fn handle_shutdown(mqtt_service: Arc<MqttService>, mut event_loop: JoinHandle<()>) {
    info!("Bridge is shutting down...");

    if timeout(SHUTDOWN_GRACE, mqtt_service.shutdown()).await.is_err() {
        warn!("Broker did not accept the disconnect in time.");
    }

    // give the loop a moment to flush UNSUBSCRIBE and DISCONNECT
    if timeout(SHUTDOWN_GRACE, &mut event_loop).await.is_err() {
        warn!("MQTT event loop did not stop in time; aborting it.");
        event_loop.abort();
    }

    info!("Bridge shut down.");
}
