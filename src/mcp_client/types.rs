//! Shared types for the lifecycle core.
//!
//! Server descriptors (raw and resolved) plus the JSON-RPC 2.0 messages used
//! by the ping/request path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── Transport Kind ─────────────────────────────────────────────────────────

/// How a client talks to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Child process speaking over its stdin/stdout.
    LocalPipe,
    /// Locally launched process listening on a port or socket path.
    LocalSocket,
    /// Externally managed HTTP-streaming endpoint.
    RemoteHttp,
    /// Externally managed socket endpoint (TCP, WebSocket).
    RemoteSocket,
}

impl TransportKind {
    /// Stable identifier, also used in the config hash.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalPipe => "local-pipe",
            Self::LocalSocket => "local-socket",
            Self::RemoteHttp => "remote-http",
            Self::RemoteSocket => "remote-socket",
        }
    }

    /// Whether this kind needs a process started on this machine.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalPipe | Self::LocalSocket)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Raw Configuration ──────────────────────────────────────────────────────

/// One server entry as supplied by an external config loader.
///
/// Field names follow the Claude Desktop `mcpServers` format; everything is
/// optional here and validated by the resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawServerConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Values may be non-strings in hand-written configs; they are stringified.
    #[serde(default)]
    pub env: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub url: Option<String>,
    /// Transport hint (`stdio`, `http`, `sse`, `websocket`, `local-socket`, …).
    #[serde(default, rename = "type")]
    pub transport: Option<String>,
    /// Working directory for launched processes.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra HTTP headers for HTTP transports.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, alias = "connectTimeoutMs")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default, alias = "requestTimeoutMs")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default, alias = "startupGraceMs")]
    pub startup_grace_ms: Option<u64>,
}

/// A named-server mapping (`{"mcpServers": {name: entry}}`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersConfig {
    #[serde(default, rename = "mcpServers", alias = "servers")]
    pub servers: HashMap<String, RawServerConfig>,
}

impl ServersConfig {
    /// Parse a JSON document in the `mcpServers` shape.
    pub fn from_json_str(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}

// ─── Resolved Configuration ─────────────────────────────────────────────────

/// Transport-specific knobs carried alongside a resolved descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    pub cwd: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub startup_grace: Option<Duration>,
}

/// A validated launch descriptor for one named server.
///
/// Never mutated after resolution; a config change means resolving again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub transport_kind: TransportKind,
    /// Present for local kinds.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Present for socket and remote kinds.
    pub url: Option<String>,
    pub options: TransportOptions,
}

impl ServerConfig {
    /// `command arg1 arg2 …` for log lines.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        if let Some(cmd) = &self.command {
            parts.push(cmd.as_str());
        }
        parts.extend(self.args.iter().map(String::as_str));
        parts.join(" ")
    }
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// Internal JSON-RPC error code, used when a response carries neither field.
pub const INTERNAL_ERROR: i32 = -32603;

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "ping", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"ping\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "result": null,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[test]
    fn test_transport_kind_serde_names() {
        let json = serde_json::to_string(&TransportKind::RemoteHttp).unwrap();
        assert_eq!(json, "\"remote-http\"");
        let kind: TransportKind = serde_json::from_str("\"local-pipe\"").unwrap();
        assert_eq!(kind, TransportKind::LocalPipe);
        assert!(kind.is_local());
        assert!(!TransportKind::RemoteSocket.is_local());
    }

    #[test]
    fn test_servers_config_claude_desktop_shape() {
        let json = r#"{
            "mcpServers": {
                "echo": {"type": "stdio", "command": "python", "args": ["examples/echo_server.py"]},
                "fetch": {"command": "uvx", "args": ["mcp-server-fetch"], "env": {"RETRIES": 3}},
                "remote": {"url": "http://localhost:8767/mcp", "type": "http"}
            }
        }"#;
        let config = ServersConfig::from_json_str(json).unwrap();
        assert_eq!(config.servers.len(), 3);
        assert_eq!(config.servers["echo"].transport.as_deref(), Some("stdio"));
        assert_eq!(config.servers["fetch"].env["RETRIES"], serde_json::json!(3));
        assert!(config.servers["remote"].command.is_none());
    }

    #[test]
    fn test_command_line() {
        let config = ServerConfig {
            name: "echo".into(),
            transport_kind: TransportKind::LocalPipe,
            command: Some("python".into()),
            args: vec!["echo_server.py".into(), "--prefix".into(), "> ".into()],
            env: BTreeMap::new(),
            url: None,
            options: TransportOptions::default(),
        };
        assert_eq!(config.command_line(), "python echo_server.py --prefix > ");
    }
}
