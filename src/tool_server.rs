//! Line-delimited JSON-RPC 2.0 over a byte stream, the transport MCP stdio
//! clients speak. Two tools are exposed: `control_led` and `get_distance`.
//!
//! Every request runs on its own task so a slow `get_distance` never holds
//! up other callers. Responses are written by a single writer task, one JSON
//! document per line.

use crate::commands;
use crate::config::Config;
use crate::last_value::LastValue;
use crate::mqtt_service::Publisher;
use crate::reader::{self, sanitize_timeout};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// The two caller-facing operations, bound to one broker and one cell.
pub struct ToolBridge {
    publisher: Arc<dyn Publisher>,
    reading: LastValue,
    actuator_topic: String,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl ToolBridge {
    pub fn new(publisher: Arc<dyn Publisher>, reading: LastValue, config: &Config) -> Self {
        let max_timeout = Duration::from_secs_f64(config.max_read_timeout_secs);
        Self {
            publisher,
            reading,
            actuator_topic: config.actuator_topic.clone(),
            default_timeout: sanitize_timeout(config.read_timeout_secs, max_timeout),
            max_timeout,
        }
    }

    pub async fn control_actuator(&self, command: &str) -> String {
        commands::control_actuator(self.publisher.as_ref(), &self.actuator_topic, command).await
    }

    pub async fn get_latest_reading(&self, timeout_secs: Option<f64>) -> String {
        let timeout = timeout_secs
            .map(|secs| sanitize_timeout(secs, self.max_timeout))
            .unwrap_or(self.default_timeout);
        reader::get_latest_reading(&self.reading, timeout).await
    }

    async fn call(&self, name: &str, arguments: Value) -> Result<String, RpcError> {
        match name {
            "control_led" => {
                let args: ControlArgs = parse_arguments(arguments)?;
                Ok(self.control_actuator(&args.command).await)
            }
            "get_distance" => {
                let args: ReadingArgs = parse_arguments(arguments)?;
                Ok(self.get_latest_reading(args.timeout_sec).await)
            }
            other => Err(RpcError::new(INVALID_PARAMS, format!("Unknown tool: {}", other))),
        }
    }
}

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn new(id: Value, outcome: Result<Value, RpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            jsonrpc: "2.0",
            id,
            result,
            error,
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize, Default)]
struct ControlArgs {
    command: String,
}

#[derive(Deserialize, Default)]
struct ReadingArgs {
    #[serde(default)]
    timeout_sec: Option<f64>,
}

/// Missing or `null` arguments deserialize as the type's default.
fn parse_arguments<T>(arguments: Value) -> Result<T, RpcError>
where
    T: DeserializeOwned + Default,
{
    if arguments.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(arguments).map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))
}

fn tool_descriptors() -> Value {
    json!([
        {
            "name": "control_led",
            "description": "Publish ON/OFF to the device's LED topic. command: 'encender' | 'apagar' | 'on' | 'off'.",
            "inputSchema": {
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }
        },
        {
            "name": "get_distance",
            "description": "Latest distance reading published by the device. Waits up to timeout_sec if nothing has arrived yet.",
            "inputSchema": {
                "type": "object",
                "properties": { "timeout_sec": { "type": "number", "default": 2.0 } }
            }
        }
    ])
}

async fn dispatch(bridge: &ToolBridge, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "initialize" => {
            let version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(PROTOCOL_VERSION)
                .to_string();
            Ok(json!({
                "protocolVersion": version,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_descriptors() })),
        "tools/call" => {
            let call: CallParams = serde_json::from_value(params)
                .map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))?;
            debug!(tool = %call.name, "Tool call");
            let text = bridge.call(&call.name, call.arguments).await?;
            Ok(json!({
                "content": [{ "type": "text", "text": text }],
                "isError": false
            }))
        }
        other => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        )),
    }
}

/// Handles one raw line; `None` means nothing should be written back.
async fn handle_line(bridge: &ToolBridge, line: &str) -> Option<RpcResponse> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!("Unparseable request: {}", e);
            return Some(RpcResponse::new(
                Value::Null,
                Err(RpcError::new(PARSE_ERROR, e.to_string())),
            ));
        }
    };
    let id = value.get("id").cloned();

    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return Some(RpcResponse::new(
                id.unwrap_or(Value::Null),
                Err(RpcError::new(INVALID_REQUEST, e.to_string())),
            ));
        }
    };

    let outcome = dispatch(bridge, &request.method, request.params).await;
    match request.id {
        Some(id) => Some(RpcResponse::new(id, outcome)),
        None => {
            debug!(method = %request.method, "Notification handled");
            None
        }
    }
}

async fn send_response(tx: &mpsc::Sender<String>, response: &RpcResponse) {
    match serde_json::to_string(response) {
        Ok(encoded) => {
            if tx.send(encoded).await.is_err() {
                debug!("Response dropped, the output writer has stopped.");
            }
        }
        Err(e) => error!("Failed to encode response: {}", e),
    }
}

/// Serves requests from `input` until it reaches end of stream.
///
/// Returns once every in-flight request has been answered.
pub async fn serve<R, W>(bridge: Arc<ToolBridge>, input: R, mut output: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut input = input;
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if input.read_until(b'\n', &mut raw).await? == 0 {
            break;
        }

        let line = match std::str::from_utf8(&raw) {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Request is not valid UTF-8: {}", e);
                let response = RpcResponse::new(
                    Value::Null,
                    Err(RpcError::new(PARSE_ERROR, format!("invalid UTF-8: {}", e))),
                );
                send_response(&tx, &response).await;
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        let bridge = bridge.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = handle_line(&bridge, &line).await {
                send_response(&tx, &response).await;
            }
        });
    }

    info!("Tool input closed.");
    // the writer drains once every handler has dropped its sender
    drop(tx);
    writer.await.map_err(io::Error::other)?
}
