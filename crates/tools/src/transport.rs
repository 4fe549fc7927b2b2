//! Tool-server transports
//!
//! Three transports share one request/response vocabulary: `list_tools`,
//! `invoke`, and unsolicited notifications. Requests carry a correlation id;
//! a reply matches by id regardless of transport.
//!
//! - `StdioTransport`: one long-lived child process, length-prefixed JSON
//!   frames over stdin/stdout (u32 big-endian length, then the payload).
//! - `SseTransport`: each request is an HTTP POST answered by a
//!   `text/event-stream` whose `data:` events carry correlated replies.
//! - `HttpStreamTransport`: each request is an HTTP POST answered by a
//!   chunked NDJSON stream.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::InvokeError;

/// A tool as described by its server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub input_schema: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// An unsolicited server notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNotification {
    pub kind: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: u64,
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ok: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
    /// Present on notification frames instead of `id`
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

fn response_to_result(response: RpcResponse) -> Result<serde_json::Value, InvokeError> {
    if let Some(err) = response.error {
        return Err(match err.kind.as_str() {
            "unknown-tool" => InvokeError::UnknownTool(err.message),
            "invalid-params" => InvokeError::InvalidParams(err.message),
            "unavailable" => InvokeError::ServerUnavailable(err.message),
            _ => InvokeError::ServerError(err.message),
        });
    }
    response
        .ok
        .ok_or_else(|| InvokeError::ServerError("reply carried neither ok nor error".to_string()))
}

fn parse_tool_list(value: serde_json::Value) -> Result<Vec<RemoteToolSpec>, InvokeError> {
    #[derive(Deserialize)]
    struct ToolList {
        tools: Vec<RemoteToolSpec>,
    }
    let list: ToolList = serde_json::from_value(value)
        .map_err(|e| InvokeError::ServerError(format!("malformed tool list: {e}")))?;
    Ok(list.tools)
}

/// One tool server reachable over some transport
#[async_trait]
pub trait ServerTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, InvokeError>;

    async fn invoke(
        &self,
        tool: &str,
        params: &serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, InvokeError>;

    /// Take the notification stream, if this transport carries one.
    ///
    /// At most one caller gets the receiver.
    fn take_notifications(&self) -> Option<mpsc::Receiver<ServerNotification>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Stdio

/// Long-lived subprocess transport
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    pending: Arc<DashMap<u64, oneshot::Sender<RpcResponse>>>,
    notifications: Mutex<Option<mpsc::Receiver<ServerNotification>>>,
    next_id: AtomicU64,
    _child: Child,
}

impl StdioTransport {
    /// Spawn the server process and start the frame reader.
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, InvokeError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvokeError::ServerUnavailable(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| InvokeError::ServerUnavailable("no stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InvokeError::ServerUnavailable("no stdout handle".to_string()))?;

        let pending: Arc<DashMap<u64, oneshot::Sender<RpcResponse>>> = Arc::new(DashMap::new());
        let (notify_tx, notify_rx) = mpsc::channel(32);

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut stdout = stdout;
            loop {
                let mut len_buf = [0u8; 4];
                if stdout.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut frame = vec![0u8; len];
                if stdout.read_exact(&mut frame).await.is_err() {
                    break;
                }
                let response: RpcResponse = match serde_json::from_slice(&frame) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("stdio server sent malformed frame: {e}");
                        continue;
                    }
                };
                match response.id {
                    Some(id) => {
                        if let Some((_, tx)) = reader_pending.remove(&id) {
                            let _ = tx.send(response);
                        }
                    }
                    None => {
                        if let Some(kind) = response.kind.clone() {
                            let _ = notify_tx
                                .try_send(ServerNotification {
                                    kind,
                                    body: response.body.unwrap_or(serde_json::Value::Null),
                                });
                        }
                    }
                }
            }
            tracing::debug!("stdio server stdout closed");
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            pending,
            notifications: Mutex::new(Some(notify_rx)),
            next_id: AtomicU64::new(1),
            _child: child,
        })
    }

    async fn request(
        &self,
        op: &str,
        tool: Option<&str>,
        params: Option<&serde_json::Value>,
        deadline: Duration,
    ) -> Result<serde_json::Value, InvokeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = serde_json::to_vec(&RpcRequest { id, op, tool, params })
            .map_err(|e| InvokeError::ServerError(e.to_string()))?;

        {
            let mut stdin = self.stdin.lock().await;
            let len = (frame.len() as u32).to_be_bytes();
            if stdin.write_all(&len).await.is_err() || stdin.write_all(&frame).await.is_err() {
                self.pending.remove(&id);
                return Err(InvokeError::ServerUnavailable("write to child failed".to_string()));
            }
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => response_to_result(response),
            Ok(Err(_)) => {
                // reader task dropped the sender: process died
                Err(InvokeError::ServerUnavailable("server closed".to_string()))
            }
            Err(_) => {
                self.pending.remove(&id);
                Err(InvokeError::Timeout)
            }
        }
    }
}

#[async_trait]
impl ServerTransport for StdioTransport {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, InvokeError> {
        let value = self.request("list_tools", None, None, Duration::from_secs(10)).await?;
        parse_tool_list(value)
    }

    async fn invoke(
        &self,
        tool: &str,
        params: &serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, InvokeError> {
        self.request("invoke", Some(tool), Some(params), deadline).await
    }

    fn take_notifications(&self) -> Option<mpsc::Receiver<ServerNotification>> {
        self.notifications.try_lock().ok().and_then(|mut guard| guard.take())
    }
}

// ---------------------------------------------------------------------------
// HTTP-based transports

async fn read_correlated_line(
    response: reqwest::Response,
    id: u64,
    sse: bool,
) -> Result<RpcResponse, InvokeError> {
    let mut buffer = String::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| InvokeError::ServerUnavailable(format!("stream error: {e}")))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let mut line = buffer[..pos].trim().to_string();
            buffer.drain(..=pos);
            if sse {
                match line.strip_prefix("data:") {
                    Some(data) => line = data.trim().to_string(),
                    None => continue,
                }
            }
            if line.is_empty() {
                continue;
            }
            if let Ok(parsed) = serde_json::from_str::<RpcResponse>(&line) {
                if parsed.id == Some(id) {
                    return Ok(parsed);
                }
            }
        }
    }

    Err(InvokeError::ServerError("stream ended without a correlated reply".to_string()))
}

async fn http_request(
    client: &reqwest::Client,
    url: &str,
    next_id: &AtomicU64,
    sse: bool,
    op: &str,
    tool: Option<&str>,
    params: Option<&serde_json::Value>,
    deadline: Duration,
) -> Result<serde_json::Value, InvokeError> {
    let id = next_id.fetch_add(1, Ordering::Relaxed);
    let request = RpcRequest { id, op, tool, params };

    let exchange = async {
        let mut builder = client.post(url).json(&request);
        if sse {
            builder = builder.header(reqwest::header::ACCEPT, "text/event-stream");
        }
        let response = builder
            .send()
            .await
            .map_err(|e| InvokeError::ServerUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(InvokeError::ServerError(format!("{status}: {body}")));
        }

        read_correlated_line(response, id, sse).await
    };

    match tokio::time::timeout(deadline, exchange).await {
        Ok(result) => response_to_result(result?),
        Err(_) => Err(InvokeError::Timeout),
    }
}

/// Server-sent-events transport
pub struct SseTransport {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl SseTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ServerTransport for SseTransport {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, InvokeError> {
        let value = http_request(
            &self.client,
            &self.url,
            &self.next_id,
            true,
            "list_tools",
            None,
            None,
            Duration::from_secs(10),
        )
        .await?;
        parse_tool_list(value)
    }

    async fn invoke(
        &self,
        tool: &str,
        params: &serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, InvokeError> {
        http_request(
            &self.client,
            &self.url,
            &self.next_id,
            true,
            "invoke",
            Some(tool),
            Some(params),
            deadline,
        )
        .await
    }
}

/// Chunked HTTP streaming transport
pub struct HttpStreamTransport {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpStreamTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ServerTransport for HttpStreamTransport {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, InvokeError> {
        let value = http_request(
            &self.client,
            &self.url,
            &self.next_id,
            false,
            "list_tools",
            None,
            None,
            Duration::from_secs(10),
        )
        .await?;
        parse_tool_list(value)
    }

    async fn invoke(
        &self,
        tool: &str,
        params: &serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, InvokeError> {
        http_request(
            &self.client,
            &self.url,
            &self.next_id,
            false,
            "invoke",
            Some(tool),
            Some(params),
            deadline,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_kind_mapping() {
        let response: RpcResponse = serde_json::from_value(json!({
            "id": 1,
            "error": {"kind": "unknown-tool", "message": "no such tool"}
        }))
        .unwrap();
        assert!(matches!(
            response_to_result(response),
            Err(InvokeError::UnknownTool(_))
        ));

        let response: RpcResponse = serde_json::from_value(json!({
            "id": 2,
            "error": {"kind": "boom", "message": "broke"}
        }))
        .unwrap();
        assert!(matches!(response_to_result(response), Err(InvokeError::ServerError(_))));
    }

    #[test]
    fn test_ok_passthrough() {
        let response: RpcResponse =
            serde_json::from_value(json!({"id": 3, "ok": {"acknowledged": true}})).unwrap();
        let value = response_to_result(response).unwrap();
        assert_eq!(value["acknowledged"], true);
    }

    #[test]
    fn test_tool_list_parsing() {
        let value = json!({
            "tools": [
                {"name": "turn_on", "description": "Turn on", "input_schema": {"type": "object"}},
                {"name": "turn_off"}
            ]
        });
        let tools = parse_tool_list(value).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1].name, "turn_off");
        assert_eq!(tools[1].input_schema, json!({}));
    }

    #[test]
    fn test_notification_frame_shape() {
        let response: RpcResponse = serde_json::from_value(json!({
            "kind": "device_changed",
            "body": {"entity": "light.office"}
        }))
        .unwrap();
        assert!(response.id.is_none());
        assert_eq!(response.kind.as_deref(), Some("device_changed"));
    }
}
