//! Config Resolver — turn a raw server entry into a validated `ServerConfig`.
//!
//! Transport inference, in order:
//! 1. An explicit `type` hint wins (`stdio`, `local-socket`, `http`, `websocket`, …).
//! 2. `command` without `url` → local-pipe.
//! 3. `url` without `command` → remote-http for `http(s)://`, remote-socket otherwise.
//! 4. Both → local-socket (launch the command, then dial the url).
//!
//! Pure function of its input: no filesystem or network access.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::errors::LifecycleError;
use super::transport::Endpoint;
use super::types::{RawServerConfig, ServerConfig, ServersConfig, TransportKind, TransportOptions};

/// Map a `type` hint to a transport kind.
fn parse_transport_hint(name: &str, hint: &str) -> Result<TransportKind, LifecycleError> {
    match hint.trim().to_ascii_lowercase().as_str() {
        "stdio" | "pipe" | "local-pipe" => Ok(TransportKind::LocalPipe),
        "local-socket" => Ok(TransportKind::LocalSocket),
        "http" | "https" | "sse" | "streamable-http" | "streamable_http" | "remote-http" => {
            Ok(TransportKind::RemoteHttp)
        }
        "websocket" | "ws" | "socket" | "tcp" | "remote-socket" => Ok(TransportKind::RemoteSocket),
        other => Err(config_error(name, format!("unknown transport type '{other}'"))),
    }
}

fn config_error(name: &str, reason: impl Into<String>) -> LifecycleError {
    LifecycleError::Config {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Infer the transport kind from which fields are present.
fn infer_transport(
    name: &str,
    command: Option<&str>,
    url: Option<&str>,
) -> Result<TransportKind, LifecycleError> {
    match (command, url) {
        (Some(_), None) => Ok(TransportKind::LocalPipe),
        (Some(_), Some(_)) => Ok(TransportKind::LocalSocket),
        (None, Some(url)) => {
            let lower = url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                Ok(TransportKind::RemoteHttp)
            } else {
                Ok(TransportKind::RemoteSocket)
            }
        }
        (None, None) => Err(config_error(name, "either 'command' or 'url' is required")),
    }
}

/// Environment values may be numbers or booleans in hand-written configs.
fn stringify_env(env: &HashMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Resolve one named raw entry into a validated descriptor.
pub fn resolve(name: &str, raw: &RawServerConfig) -> Result<ServerConfig, LifecycleError> {
    if name.trim().is_empty() {
        return Err(config_error(name, "server name must not be empty"));
    }

    let command = non_empty(raw.command.as_ref());
    let url = non_empty(raw.url.as_ref());

    let transport_kind = match raw.transport.as_deref() {
        Some(hint) => parse_transport_hint(name, hint)?,
        None => infer_transport(name, command.as_deref(), url.as_deref())?,
    };

    match transport_kind {
        TransportKind::LocalPipe => {
            if command.is_none() {
                return Err(config_error(name, "local-pipe server requires a non-empty 'command'"));
            }
            if url.is_some() {
                return Err(config_error(
                    name,
                    "local-pipe server must not have a 'url' (use type 'local-socket' to dial a launched process)",
                ));
            }
        }
        TransportKind::LocalSocket => {
            if command.is_none() {
                return Err(config_error(name, "local-socket server requires a non-empty 'command'"));
            }
            if url.is_none() {
                return Err(config_error(name, "local-socket server requires a 'url' to dial"));
            }
        }
        TransportKind::RemoteHttp | TransportKind::RemoteSocket => {
            if url.is_none() {
                return Err(config_error(name, format!("{transport_kind} server requires a 'url'")));
            }
            if command.is_some() {
                return Err(config_error(
                    name,
                    format!("{transport_kind} server must not have a 'command'"),
                ));
            }
        }
    }

    if let Some(url) = &url {
        let endpoint = Endpoint::parse(url).map_err(|reason| config_error(name, reason))?;
        let compatible = match transport_kind {
            TransportKind::RemoteHttp => matches!(endpoint, Endpoint::Http(_)),
            TransportKind::RemoteSocket => !matches!(endpoint, Endpoint::Http(_)),
            TransportKind::LocalSocket | TransportKind::LocalPipe => true,
        };
        if !compatible {
            return Err(config_error(
                name,
                format!("url '{url}' does not match transport {transport_kind}"),
            ));
        }
    }

    let options = TransportOptions {
        cwd: non_empty(raw.cwd.as_ref()),
        headers: raw
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        connect_timeout: raw.connect_timeout_ms.map(Duration::from_millis),
        request_timeout: raw.request_timeout_ms.map(Duration::from_millis),
        startup_grace: raw.startup_grace_ms.map(Duration::from_millis),
    };

    Ok(ServerConfig {
        name: name.to_string(),
        transport_kind,
        command,
        args: raw.args.clone(),
        env: stringify_env(&raw.env),
        url,
        options,
    })
}

/// Resolve every entry of a mapping.
///
/// Entries that fail validation are returned alongside the valid ones
/// (partial resolution is acceptable; the caller decides what to report).
pub fn resolve_all(
    config: &ServersConfig,
) -> (BTreeMap<String, ServerConfig>, Vec<LifecycleError>) {
    let mut resolved = BTreeMap::new();
    let mut errors = Vec::new();

    for (name, raw) in &config.servers {
        match resolve(name, raw) {
            Ok(server) => {
                resolved.insert(name.clone(), server);
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "skipping invalid server config");
                errors.push(e);
            }
        }
    }

    (resolved, errors)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(command: Option<&str>, url: Option<&str>, hint: Option<&str>) -> RawServerConfig {
        RawServerConfig {
            command: command.map(str::to_string),
            url: url.map(str::to_string),
            transport: hint.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_command_only_defaults_to_local_pipe() {
        let config = resolve("echo", &raw(Some("echo-server"), None, None)).unwrap();
        assert_eq!(config.transport_kind, TransportKind::LocalPipe);
        assert_eq!(config.command.as_deref(), Some("echo-server"));
        assert!(config.url.is_none());
    }

    #[test]
    fn test_http_url_infers_remote_http() {
        let config = resolve("remote", &raw(None, Some("http://localhost:8767/mcp"), None)).unwrap();
        assert_eq!(config.transport_kind, TransportKind::RemoteHttp);
    }

    #[test]
    fn test_ws_url_infers_remote_socket() {
        let config = resolve("ws", &raw(None, Some("ws://localhost:8768"), None)).unwrap();
        assert_eq!(config.transport_kind, TransportKind::RemoteSocket);
    }

    #[test]
    fn test_command_and_url_infers_local_socket() {
        let config = resolve(
            "sse",
            &raw(Some("python"), Some("http://127.0.0.1:8766/sse"), None),
        )
        .unwrap();
        assert_eq!(config.transport_kind, TransportKind::LocalSocket);
    }

    #[test]
    fn test_missing_everything_is_config_error() {
        let err = resolve("empty", &raw(None, None, None)).unwrap_err();
        assert!(matches!(err, LifecycleError::Config { .. }));
    }

    #[test]
    fn test_blank_command_is_treated_as_missing() {
        let err = resolve("blank", &raw(Some("   "), None, Some("stdio"))).unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_remote_kind_requires_url() {
        let err = resolve("r", &raw(None, None, Some("http"))).unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn test_stdio_with_url_is_contradiction() {
        let err = resolve(
            "echo-with-url",
            &raw(Some("python"), Some("http://localhost:8080"), Some("stdio")),
        )
        .unwrap_err();
        assert!(matches!(err, LifecycleError::Config { .. }));
    }

    #[test]
    fn test_remote_with_command_is_contradiction() {
        let err = resolve(
            "r",
            &raw(Some("python"), Some("http://localhost:8080"), Some("http")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("must not have a 'command'"));
    }

    #[test]
    fn test_unknown_hint_rejected() {
        let err = resolve("x", &raw(Some("x"), None, Some("carrier-pigeon"))).unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_http_hint_with_ws_url_rejected() {
        let err = resolve("x", &raw(None, Some("ws://localhost:1"), Some("http"))).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_env_values_are_stringified() {
        let mut entry = raw(Some("uvx"), None, None);
        entry.env.insert("RETRIES".into(), serde_json::json!(3));
        entry.env.insert("DEBUG".into(), serde_json::json!(true));
        entry.env.insert("NAME".into(), serde_json::json!("fetch"));
        let config = resolve("fetch", &entry).unwrap();
        assert_eq!(config.env["RETRIES"], "3");
        assert_eq!(config.env["DEBUG"], "true");
        assert_eq!(config.env["NAME"], "fetch");
    }

    #[test]
    fn test_options_carried_over() {
        let mut entry = raw(None, Some("https://example.com/mcp"), None);
        entry.headers.insert("Authorization".into(), "Bearer t".into());
        entry.connect_timeout_ms = Some(1500);
        let config = resolve("remote", &entry).unwrap();
        assert_eq!(config.options.headers["Authorization"], "Bearer t");
        assert_eq!(config.options.connect_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_resolve_all_partial() {
        let mut servers = HashMap::new();
        servers.insert("good".to_string(), raw(Some("echo-server"), None, None));
        servers.insert("bad".to_string(), raw(None, None, None));
        let (resolved, errors) = resolve_all(&ServersConfig { servers });
        assert!(resolved.contains_key("good"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].server_name(), "bad");
    }
}
