//! The editor side of the daemon: newline-delimited JSON-array framing
//! and the connection manager.
//!
//! Every value on the editor channel is an array whose first element is
//! an integer id. Positive ids are editor requests, zero marks a
//! notification, and negative ids answer daemon-initiated expr requests.
//! Outbound, the daemon writes responses `[id, result]`, ex-commands
//! `["ex", "..."]`, and expr requests `["expr", "...", neg_id]`.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedSender;

use crate::event::{ClientId, Event};

/// Editor lines longer than this are dropped (framing error class 1).
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// One parsed editor line, before the expr-table lookup decides whether a
/// bare `[id, value]` answers an outstanding expr request.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorLine {
    pub id: i64,
    pub payload: Value,
}

impl EditorLine {
    /// Method and params when the payload is a `{method, params}` call.
    pub fn call(&self) -> Option<(&str, &Value)> {
        let method = self.payload.get("method")?.as_str()?;
        let params = self.payload.get("params").unwrap_or(&Value::Null);
        Some((method, params))
    }

    pub fn is_notification(&self) -> bool {
        self.id == 0
    }
}

/// Parse one line from the editor channel.
pub fn parse_line(line: &str) -> Result<EditorLine> {
    let value: Value = serde_json::from_str(line.trim())?;
    let Value::Array(mut items) = value else {
        bail!("editor message is not an array");
    };
    if items.is_empty() {
        bail!("editor message is an empty array");
    }
    let Some(id) = items[0].as_i64() else {
        bail!("editor message id is not an integer: {}", items[0]);
    };
    let payload = if items.len() > 1 { items.remove(1) } else { Value::Null };
    Ok(EditorLine { id, payload })
}

pub fn response_line(id: i64, result: &Value) -> Value {
    json!([id, result])
}

pub fn ex_line(command: &str) -> Value {
    json!(["ex", command])
}

pub fn expr_line(expression: &str, id: i64) -> Value {
    json!(["expr", expression, id])
}

/// Escape a string for interpolation into a single-quoted Vim string.
fn vim_quote(text: &str) -> String {
    text.replace('\'', "''")
}

/// An `:echo` on the editor's status line.
pub fn ex_echo(message: &str) -> Value {
    ex_line(&format!("echo '{}'", vim_quote(message)))
}

/// An error-highlighted message the user cannot miss.
pub fn ex_error(message: &str) -> Value {
    ex_line(&format!(
        "echohl ErrorMsg | echomsg '{}' | echohl None",
        vim_quote(message)
    ))
}

/// One connected editor: the socket's write half plus its id. Reads are
/// serviced by a detached task that forwards lines as events.
pub struct ClientConnection {
    pub id: ClientId,
    writer: OwnedWriteHalf,
}

/// All connected editors, in accept order.
pub struct Connections {
    clients: BTreeMap<ClientId, ClientConnection>,
    next_id: u64,
}

impl Connections {
    pub fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Register a freshly accepted socket: assign the next id and spawn
    /// its line-reader task.
    pub fn accept(&mut self, stream: UnixStream, events: UnboundedSender<Event>) -> ClientId {
        self.next_id += 1;
        let id = ClientId(self.next_id);
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(read_lines(read_half, id, events));
        self.clients.insert(id, ClientConnection { id, writer: write_half });
        metrics::counter!("yac_clients_accepted").increment(1);
        tracing::info!(%id, "editor connected");
        id
    }

    pub fn remove(&mut self, id: ClientId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            tracing::info!(%id, "editor disconnected");
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Best-effort write of one message line. `false` means the socket is
    /// dead and the client should be removed.
    pub async fn write(&mut self, id: ClientId, message: &Value) -> bool {
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        let mut line = message.to_string();
        line.push('\n');
        match client.writer.write_all(line.as_bytes()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(%id, "write failed: {e}");
                false
            }
        }
    }

    /// Send a message to every client in accept order. A client that fails
    /// mid-broadcast does not stop the rest; the dead ids are returned for
    /// cleanup.
    pub async fn broadcast(&mut self, message: &Value) -> Vec<ClientId> {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        let mut dead = Vec::new();
        for id in ids {
            if !self.write(id, message).await {
                dead.push(id);
            }
        }
        metrics::counter!("yac_broadcasts").increment(1);
        dead
    }
}

impl Default for Connections {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain one editor socket line by line. Oversized lines are discarded
/// without killing the connection; EOF and read errors end it.
async fn read_lines(
    read_half: tokio::net::unix::OwnedReadHalf,
    id: ClientId,
    events: UnboundedSender<Event>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => {
                let _ = events.send(Event::ClientClosed { client: id });
                return;
            }
            Ok(n) if n > MAX_LINE_BYTES => {
                tracing::warn!(%id, "discarding oversized line ({n} bytes)");
            }
            Ok(_) => {
                if events
                    .send(Event::ClientLine { client: id, line: line.clone() })
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line() {
        let line = parse_line(r#"[1, {"method": "hover", "params": {"file": "/a.rs"}}]"#).unwrap();
        assert_eq!(line.id, 1);
        let (method, params) = line.call().unwrap();
        assert_eq!(method, "hover");
        assert_eq!(params["file"], "/a.rs");
        assert!(!line.is_notification());
    }

    #[test]
    fn parses_notification_line() {
        let line = parse_line(r#"[0, {"method": "did_close", "params": {"file": "/a.rs"}}]"#).unwrap();
        assert!(line.is_notification());
    }

    #[test]
    fn parses_expr_response_line() {
        let line = parse_line(r#"[-3, ["main.rs", "lib.rs"]]"#).unwrap();
        assert_eq!(line.id, -3);
        assert!(line.call().is_none());
        assert_eq!(line.payload, json!(["main.rs", "lib.rs"]));
    }

    #[test]
    fn rejects_non_array_and_bad_ids() {
        assert!(parse_line(r#"{"method": "hover"}"#).is_err());
        assert!(parse_line("[]").is_err());
        assert!(parse_line(r#"["one", {}]"#).is_err());
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn response_line_shape() {
        assert_eq!(
            response_line(7, &json!({"file": "/b.rs"})),
            json!([7, {"file": "/b.rs"}])
        );
    }

    #[test]
    fn ex_echo_quotes_single_quotes() {
        let line = ex_echo("can't index");
        assert_eq!(line, json!(["ex", "echo 'can''t index'"]));
    }

    #[test]
    fn ex_error_is_highlighted() {
        let line = ex_error("LSP server crashed");
        let text = line[1].as_str().unwrap();
        assert!(text.contains("echohl ErrorMsg"));
        assert!(text.contains("LSP server crashed"));
        assert!(text.ends_with("echohl None"));
    }

    #[test]
    fn expr_line_carries_negative_id() {
        assert_eq!(
            expr_line("map(getbufinfo(), 'v:val.name')", -5),
            json!(["expr", "map(getbufinfo(), 'v:val.name')", -5])
        );
    }
}
