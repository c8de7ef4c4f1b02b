mod commands;
mod config;
mod dialect;
mod error;
mod last_value;
mod mqtt_service;
mod reader;
mod service_utils;
mod tool_server;

use crate::config::Config;
use crate::mqtt_service::MqttService;
use crate::service_utils::{handle_shutdown, serve_stdio, start_mqtt_service};
use crate::tool_server::ToolBridge;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

fn main() -> ExitCode {
    // stdout carries the tool protocol, logs go to stderr only
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the async runtime: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run());

    // the stdin reader thread may still be parked on a read
    runtime.shutdown_timeout(Duration::from_millis(500));
    code
}

async fn run() -> ExitCode {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    let (recorder, reading) = last_value::channel();

    // Without a broker session nothing downstream can work
    let (mqtt_service, session) = match MqttService::connect(config.clone(), recorder).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let event_loop = start_mqtt_service(mqtt_service.clone(), session);

    let bridge = Arc::new(ToolBridge::new(mqtt_service.clone(), reading, &config));
    info!(
        "Bridging {} over {} (watching '{}', commanding '{}') as '{}'.",
        mqtt_service.connection().endpoint(),
        mqtt_service.connection().dialect,
        config.sensor_topic,
        config.actuator_topic,
        mqtt_service.connection().client_id,
    );

    let served = serve_stdio(bridge).await;

    handle_shutdown(mqtt_service, event_loop).await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Tool transport failed: {:?}", e);
            ExitCode::FAILURE
        }
    }
}
