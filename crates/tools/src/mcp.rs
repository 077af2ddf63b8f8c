//! MCP client over stdio: JSON-RPC 2.0, one message per line.
//!
//! [`McpSession`] speaks the protocol over any async reader/writer pair.
//! [`StdioServer`] spawns a server process and hands back a session wired
//! to its stdin/stdout after the `initialize` handshake.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use stepwise_config::CapabilityServerConfig;
use stepwise_core::capability::CapabilityDescriptor;
use stepwise_core::error::DispatchError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::rpc::{RpcSession, SessionFactory};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A JSON-RPC session with one MCP server.
pub struct McpSession<R, W> {
    server: String,
    reader: R,
    writer: W,
    next_id: i64,
    timeout: Duration,
    broken: bool,
    child: Option<Child>,
}

impl<R, W> McpSession<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(server: impl Into<String>, reader: R, writer: W, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            reader,
            writer,
            next_id: 1,
            timeout,
            broken: false,
            child: None,
        }
    }

    /// Tie the server process to this session; it is killed when dropped.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    /// Run the `initialize` handshake and send `notifications/initialized`.
    pub async fn initialize(&mut self) -> Result<Value, DispatchError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "stepwise", "version": env!("CARGO_PKG_VERSION") }
                }),
                "initialize",
            )
            .await?;
        self.send(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await?;
        let version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("?");
        debug!(server = %self.server, version, "MCP session initialized");
        Ok(result)
    }

    async fn send(&mut self, message: &Value) -> Result<(), DispatchError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| DispatchError::Rpc(format!("encode: {e}")))?;
        line.push('\n');
        let written = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await
        }
        .await;
        written.map_err(|e| {
            self.broken = true;
            DispatchError::Transport(format!("{} write: {e}", self.server))
        })
    }

    async fn read_message(&mut self) -> Result<Value, DispatchError> {
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).await.map_err(|e| {
                DispatchError::Transport(format!("{} read: {e}", self.server))
            })?;
            if read == 0 {
                return Err(DispatchError::Transport(format!(
                    "{} closed the connection",
                    self.server
                )));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(message) => return Ok(message),
                Err(_) => debug!(server = %self.server, line = trimmed, "Ignoring non-JSON output"),
            }
        }
    }

    /// Answer a request the server sent to us while we wait for our reply.
    async fn answer_server_request(&mut self, message: &Value) -> Result<(), DispatchError> {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let reply = if method == "ping" {
            json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        } else {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not supported: {method}") }
            })
        };
        self.send(&reply).await
    }

    async fn exchange(&mut self, id: i64, message: &Value) -> Result<Value, DispatchError> {
        self.send(message).await?;
        loop {
            let incoming = self.read_message().await?;
            match incoming.get("id") {
                None => {
                    let method = incoming.get("method").and_then(Value::as_str).unwrap_or("?");
                    debug!(server = %self.server, method, "Skipping notification");
                }
                Some(v) if v.as_i64() == Some(id) && incoming.get("method").is_none() => {
                    return Ok(incoming);
                }
                Some(_) if incoming.get("method").is_some() => {
                    self.answer_server_request(&incoming).await?;
                }
                Some(other) => {
                    return Err(DispatchError::Rpc(format!(
                        "{}: response id mismatch (expected {id}, got {other})",
                        self.server
                    )));
                }
            }
        }
    }

    async fn request(
        &mut self,
        method: &str,
        params: Value,
        label: &str,
    ) -> Result<Value, DispatchError> {
        if self.broken {
            return Err(DispatchError::Transport(format!(
                "{}: session is no longer usable",
                self.server
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let timeout = self.timeout;
        let response = match tokio::time::timeout(timeout, self.exchange(id, &message)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                // an unanswered or mismatched request leaves the stream out of step
                self.broken = true;
                return Err(e);
            }
            Err(_) => {
                self.broken = true;
                return Err(DispatchError::Timeout {
                    capability: label.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        if let Some(error) = response.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let text = error.get("message").and_then(Value::as_str).unwrap_or("unknown");
            return Err(DispatchError::Remote {
                capability: label.to_string(),
                message: format!("error {code}: {text}"),
            });
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| DispatchError::Rpc(format!("{}: response missing 'result'", self.server)))
    }
}

fn descriptor_from_tool(tool: &Value) -> Option<CapabilityDescriptor> {
    let name = tool.get("name").and_then(Value::as_str)?;
    let description = tool.get("description").and_then(Value::as_str).unwrap_or("");
    let empty = json!({});
    let schema = tool.get("inputSchema").unwrap_or(&empty);
    Some(CapabilityDescriptor::from_json_schema(name, description, schema))
}

/// Text parts of an MCP `content` array, joined by newlines.
fn content_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

#[async_trait]
impl<R, W> RpcSession for McpSession<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn ping(&mut self) -> Result<(), DispatchError> {
        self.request("ping", json!({}), "ping").await.map(|_| ())
    }

    async fn list_tools(&mut self) -> Result<Vec<CapabilityDescriptor>, DispatchError> {
        let mut descriptors = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.request("tools/list", params, "tools/list").await?;
            let tools = result
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| DispatchError::Rpc(format!("{}: tools/list without tools", self.server)))?;
            for tool in tools {
                match descriptor_from_tool(tool) {
                    Some(d) => descriptors.push(d),
                    None => warn!(server = %self.server, "Skipping tool without a name"),
                }
            }
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(String::from);
            if cursor.is_none() {
                break;
            }
        }
        Ok(descriptors)
    }

    async fn call_tool(
        &mut self,
        name: &str,
        args: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": Value::Object(args) }),
                name,
            )
            .await?;
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            let text = content_text(&result);
            return Err(DispatchError::Remote {
                capability: name.to_string(),
                message: if text.is_empty() { result.to_string() } else { text },
            });
        }
        Ok(result)
    }

    fn is_alive(&mut self) -> bool {
        if self.broken {
            return false;
        }
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }
}

/// Spawns an MCP server as a child process for each new session.
pub struct StdioServer {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    timeout: Duration,
}

impl StdioServer {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &CapabilityServerConfig, timeout: Duration) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn spawn(&self) -> Result<McpSession<BufReader<ChildStdout>, ChildStdin>, DispatchError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            DispatchError::Transport(format!("{}: failed to spawn '{}': {e}", self.name, self.command))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DispatchError::Transport(format!("{}: no stdin", self.name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::Transport(format!("{}: no stdout", self.name)))?;

        // drain stderr so the server never blocks on a full pipe
        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "{line}");
                }
            });
        }

        Ok(McpSession::new(&self.name, BufReader::new(stdout), stdin, self.timeout).with_child(child))
    }
}

#[async_trait]
impl SessionFactory for StdioServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Box<dyn RpcSession>, DispatchError> {
        let mut session = self.spawn().await?;
        session.initialize().await?;
        info!(server = %self.name, command = %self.command, "Capability server connected");
        Ok(Box::new(session))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    pub(crate) type TestSession = McpSession<BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

    /// Wire a session to an in-process fake server. The handler maps each
    /// client message to the lines the server writes back.
    pub(crate) fn fake_server<F>(timeout: Duration, handler: F) -> TestSession
    where
        F: Fn(&Value) -> Vec<String> + Send + 'static,
    {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                for reply in handler(&message) {
                    if server_write.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });

        McpSession::new("fake", BufReader::new(client_read), client_write, timeout)
    }

    pub(crate) fn math_handler(message: &Value) -> Vec<String> {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let reply = |result: Value| json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string();
        match message.get("method").and_then(Value::as_str) {
            Some("initialize") => vec![reply(json!({ "protocolVersion": PROTOCOL_VERSION }))],
            Some("ping") => vec![reply(json!({}))],
            Some("tools/list") => vec![reply(json!({
                "tools": [{
                    "name": "add",
                    "description": "Add two numbers",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "a": { "type": "integer" }, "b": { "type": "integer" } },
                        "required": ["a", "b"]
                    }
                }]
            }))],
            Some("tools/call") => {
                let args = &message["params"]["arguments"];
                let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
                vec![reply(json!({
                    "content": [{ "type": "text", "text": sum.to_string() }],
                    "isError": false
                }))]
            }
            _ => vec![],
        }
    }

    #[tokio::test]
    async fn handshake_list_and_call() {
        let mut session = fake_server(Duration::from_secs(5), math_handler);
        session.initialize().await.unwrap();

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].signature(), "add(a: integer, b: integer)");

        let mut args = Map::new();
        args.insert("a".into(), json!(2));
        args.insert("b".into(), json!(3));
        let result = session.call_tool("add", args).await.unwrap();
        assert_eq!(result["content"][0]["text"], "5");
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn list_tools_follows_cursor() {
        let mut session = fake_server(Duration::from_secs(5), |m| {
            let id = m["id"].clone();
            let page = match m["params"].get("cursor").and_then(Value::as_str) {
                None => json!({ "tools": [{ "name": "first" }], "nextCursor": "p2" }),
                Some(_) => json!({ "tools": [{ "name": "second" }] }),
            };
            vec![json!({ "jsonrpc": "2.0", "id": id, "result": page }).to_string()]
        });
        let tools = session.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn notifications_and_server_pings_are_handled() {
        let mut session = fake_server(Duration::from_secs(5), |m| {
            if m.get("id").is_none() || m.get("result").is_some() {
                // our notification or our answer to the server's ping
                return vec![];
            }
            let id = m["id"].clone();
            vec![
                json!({ "jsonrpc": "2.0", "method": "notifications/message", "params": {} }).to_string(),
                "server log line that is not json".to_string(),
                json!({ "jsonrpc": "2.0", "id": "srv-1", "method": "ping" }).to_string(),
                json!({ "jsonrpc": "2.0", "id": id, "result": {} }).to_string(),
            ]
        });
        session.ping().await.unwrap();
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn rpc_error_is_remote() {
        let mut session = fake_server(Duration::from_secs(5), |m| {
            vec![json!({
                "jsonrpc": "2.0",
                "id": m["id"],
                "error": { "code": -32602, "message": "bad params" }
            })
            .to_string()]
        });
        let err = session.call_tool("add", Map::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Remote { ref message, .. } if message.contains("bad params")));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn tool_error_flag_is_remote() {
        let mut session = fake_server(Duration::from_secs(5), |m| {
            vec![json!({
                "jsonrpc": "2.0",
                "id": m["id"],
                "result": { "content": [{ "type": "text", "text": "division by zero" }], "isError": true }
            })
            .to_string()]
        });
        let err = session.call_tool("divide", Map::new()).await.unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[tokio::test]
    async fn closed_connection_is_transport_failure() {
        let mut session = fake_server(Duration::from_secs(5), |_| vec![]);
        // drop the server side by making the handler task end: send a message it ignores,
        // then close our writer so its reader sees EOF
        session.writer.shutdown().await.unwrap();
        let err = session.ping().await.unwrap_err();
        assert!(err.is_transient());
        assert!(!session.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let mut session = fake_server(Duration::from_secs(2), |_| vec![]);
        let err = session.call_tool("add", Map::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { ref capability, timeout_secs: 2 } if capability == "add"));
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn mismatched_id_breaks_session() {
        let mut session = fake_server(Duration::from_secs(5), |_| {
            vec![json!({ "jsonrpc": "2.0", "id": 999, "result": {} }).to_string()]
        });
        let err = session.ping().await.unwrap_err();
        assert!(matches!(err, DispatchError::Rpc(_)));
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn spawn_failure_is_transport_error() {
        let server = StdioServer::new("missing", "/definitely/not/a/binary", vec![]);
        let err = server.connect().await.err().unwrap();
        assert!(err.is_transient());
    }
}
