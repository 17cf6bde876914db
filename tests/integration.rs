//! End-to-end tests: real Unix-socket clients against an in-process
//! daemon wired to a scripted fake language server.
//!
//! The fake server is a shell script speaking framed JSON-RPC on stdio.
//! It answers `initialize`/`hover`/`definition`, starts an indexing
//! progress cycle when a file named `index_me` is opened, publishes a
//! diagnostic (and ends the progress cycle) on `didSave`, and exits on
//! `didClose` to simulate a crash.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

use yac_lsp_bridge::daemon::Daemon;
use yac_lsp_bridge::lsp::config::Languages;

const FAKE_LSP: &str = r#"#!/bin/sh

read_message() {
    content_length=0
    while IFS=: read -r key value; do
        key=$(printf '%s' "$key" | tr -d '\r\n')
        value=$(printf '%s' "$value" | tr -d '\r\n ')
        if [ "$key" = "Content-Length" ]; then
            content_length=$value
        fi
        if [ -z "$key" ]; then
            break
        fi
    done
    if [ "$content_length" -gt 0 ]; then
        dd bs=1 count="$content_length" 2>/dev/null
    fi
}

send_message() {
    message="$1"
    printf 'Content-Length: %s\r\n\r\n%s' "${#message}" "$message"
}

while true; do
    msg=$(read_message)
    if [ -z "$msg" ]; then
        exit 0
    fi

    method=$(printf '%s' "$msg" | grep -o '"method":"[^"]*"' | head -1 | cut -d'"' -f4)
    msg_id=$(printf '%s' "$msg" | grep -o '"id":[0-9]*' | head -1 | cut -d: -f2)

    case "$method" in
        "initialize")
            send_message '{"jsonrpc":"2.0","id":'"$msg_id"',"result":{"capabilities":{"hoverProvider":true,"definitionProvider":true,"textDocumentSync":1}}}'
            ;;
        "textDocument/didOpen")
            case "$msg" in
                *index_me*)
                    send_message '{"jsonrpc":"2.0","method":"$/progress","params":{"token":"t1","value":{"kind":"begin","title":"indexing"}}}'
                    ;;
            esac
            ;;
        "textDocument/hover")
            send_message '{"jsonrpc":"2.0","id":'"$msg_id"',"result":{"contents":{"kind":"markdown","value":"fake hover text"}}}'
            ;;
        "textDocument/definition")
            case "$msg" in
                *'"line":99'*)
                    send_message '{"jsonrpc":"2.0","id":'"$msg_id"',"result":[]}'
                    ;;
                *)
                    send_message '{"jsonrpc":"2.0","id":'"$msg_id"',"result":[{"uri":"file:///tmp/target.fk","range":{"start":{"line":42,"character":0},"end":{"line":42,"character":6}}}]}'
                    ;;
            esac
            ;;
        "textDocument/didSave")
            uri=$(printf '%s' "$msg" | grep -o '"uri":"[^"]*"' | head -1 | cut -d'"' -f4)
            send_message '{"jsonrpc":"2.0","method":"textDocument/publishDiagnostics","params":{"uri":"'"$uri"'","diagnostics":[{"range":{"start":{"line":0,"character":4},"end":{"line":0,"character":9}},"severity":1,"source":"fake","message":"fake error"}]}}'
            send_message '{"jsonrpc":"2.0","method":"$/progress","params":{"token":"t1","value":{"kind":"end"}}}'
            ;;
        "textDocument/didClose")
            exit 1
            ;;
        "shutdown")
            send_message '{"jsonrpc":"2.0","id":'"$msg_id"',"result":null}'
            ;;
    esac
done
"#;

/// A workspace with a fake-language project and a daemon serving it.
struct Harness {
    socket: PathBuf,
    workspace: PathBuf,
    _tmp: tempfile::TempDir,
}

fn write_executable(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn start_daemon() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let script = tmp.path().join("fake-lsp.sh");
    write_executable(&script, FAKE_LSP);

    let workspace = tmp.path().join("project");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::write(workspace.join("fake.marker"), "").unwrap();
    std::fs::write(workspace.join("plain.fk"), "contents\n").unwrap();
    std::fs::write(workspace.join("index_me.fk"), "contents\n").unwrap();
    std::fs::write(workspace.join("main.fk"), "contents\n").unwrap();
    std::fs::write(workspace.join("formula.fk"), "contents\n").unwrap();

    let mut languages = Languages::builtin();
    languages
        .apply_overrides(&format!(
            r#"
[languages.fake]
command = "{}"
extensions = ["fk"]
root-markers = ["fake.marker"]
"#,
            script.display()
        ))
        .unwrap();

    let socket = tmp.path().join("bridge.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let daemon = Daemon::new(listener, languages, tmp.path().join("daemon.log"));
    tokio::spawn(daemon.run());

    Harness { socket, workspace, _tmp: tmp }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(harness: &Harness) -> Self {
        let stream = UnixStream::connect(&harness.socket).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self { reader: BufReader::new(read_half), writer: write_half }
    }

    async fn send(&mut self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn next_line(&mut self) -> Value {
        let mut line = String::new();
        timeout(Duration::from_secs(15), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for daemon output")
            .expect("read failed");
        assert!(!line.is_empty(), "daemon closed the connection");
        serde_json::from_str(&line).expect("daemon wrote invalid JSON")
    }

    /// Scan lines until one satisfies the predicate, skipping others
    /// (progress echoes, unrelated broadcasts).
    async fn wait_for(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..100 {
            let line = self.next_line().await;
            if pred(&line) {
                return line;
            }
        }
        panic!("expected line never arrived");
    }

    /// The response `[id, result]` for a request id.
    async fn response(&mut self, id: i64) -> Value {
        let line = self.wait_for(|l| l[0] == json!(id)).await;
        line[1].clone()
    }

    /// An `["ex", ...]` line whose command contains `needle`.
    async fn ex_containing(&mut self, needle: &str) -> String {
        let needle = needle.to_string();
        let line = self
            .wait_for(|l| {
                l[0] == json!("ex")
                    && l[1].as_str().is_some_and(|cmd| cmd.contains(&needle))
            })
            .await;
        line[1].as_str().unwrap().to_string()
    }
}

fn file_in(harness: &Harness, name: &str) -> String {
    harness.workspace.join(name).display().to_string()
}

#[tokio::test]
async fn lone_goto_roundtrips_through_fake_server() {
    let harness = start_daemon();
    let mut client = Client::connect(&harness).await;
    let file = file_in(&harness, "plain.fk");

    client.send(json!([1, {"method": "file_open", "params": {"file": file}}])).await;
    let opened = client.response(1).await;
    assert!(opened["log_file"].is_string());

    client
        .send(json!([2, {"method": "goto_definition", "params": {"file": file, "line": 10, "column": 4}}]))
        .await;
    let result = client.response(2).await;
    assert_eq!(result, json!({"file": "/tmp/target.fk", "line": 42, "column": 0}));
}

#[tokio::test]
async fn goto_with_empty_result_is_null() {
    let harness = start_daemon();
    let mut client = Client::connect(&harness).await;
    let file = file_in(&harness, "plain.fk");

    client.send(json!([1, {"method": "file_open", "params": {"file": file}}])).await;
    client.response(1).await;

    client
        .send(json!([2, {"method": "goto_definition", "params": {"file": file, "line": 99, "column": 0}}]))
        .await;
    assert_eq!(client.response(2).await, Value::Null);
}

#[tokio::test]
async fn hover_defers_during_indexing_and_replays() {
    let harness = start_daemon();
    let mut client = Client::connect(&harness).await;
    let file = file_in(&harness, "index_me.fk");

    client.send(json!([1, {"method": "file_open", "params": {"file": file}}])).await;
    client.response(1).await;

    // The fake server starts an indexing progress cycle on didOpen; the
    // daemon echoes it to the status line.
    client.ex_containing("indexing").await;

    client
        .send(json!([3, {"method": "hover", "params": {"file": file, "line": 0, "column": 0}}]))
        .await;
    client.ex_containing("request queued").await;

    // didSave makes the fake server end the progress cycle, which flushes
    // the deferred hover.
    client.send(json!([0, {"method": "did_save", "params": {"file": file}}])).await;
    let hover = client.response(3).await;
    assert_eq!(hover["content"], "fake hover text");
}

#[tokio::test]
async fn crash_toasts_all_clients_and_respawns_on_next_use() {
    let harness = start_daemon();
    let mut first = Client::connect(&harness).await;
    let mut second = Client::connect(&harness).await;
    let file = file_in(&harness, "plain.fk");

    first.send(json!([1, {"method": "file_open", "params": {"file": file}}])).await;
    first.response(1).await;

    // didClose makes the fake server exit; both clients get the toast.
    first.send(json!([0, {"method": "did_close", "params": {"file": file}}])).await;
    let toast = first.ex_containing("LSP server crashed").await;
    assert!(toast.contains("echohl ErrorMsg"));
    second.ex_containing("LSP server crashed").await;

    // The next request spawns a fresh server and still gets an answer.
    first
        .send(json!([5, {"method": "goto_definition", "params": {"file": file, "line": 1, "column": 0}}]))
        .await;
    let result = first.response(5).await;
    assert_eq!(result["line"], 42);
}

#[tokio::test]
async fn diagnostics_fan_out_to_every_client() {
    let harness = start_daemon();
    let mut publisher = Client::connect(&harness).await;
    let mut watcher_a = Client::connect(&harness).await;
    let mut watcher_b = Client::connect(&harness).await;
    let file = file_in(&harness, "plain.fk");

    publisher.send(json!([1, {"method": "file_open", "params": {"file": file}}])).await;
    publisher.response(1).await;
    publisher.send(json!([0, {"method": "did_save", "params": {"file": file}}])).await;

    let is_diagnostics = |l: &Value| l["action"] == json!("diagnostics");
    let got_pub = publisher.wait_for(is_diagnostics).await;
    let got_a = watcher_a.wait_for(is_diagnostics).await;
    let got_b = watcher_b.wait_for(is_diagnostics).await;

    assert_eq!(got_pub, got_a);
    assert_eq!(got_a, got_b);
    assert_eq!(got_a["diagnostics"][0]["message"], "fake error");
    assert_eq!(got_a["diagnostics"][0]["severity"], "error");
    assert_eq!(got_a["diagnostics"][0]["file"], file);
}

#[tokio::test]
async fn picker_file_mode_ranks_and_caps() {
    let harness = start_daemon();
    let mut client = Client::connect(&harness).await;
    let cwd = harness.workspace.display().to_string();

    client
        .send(json!([1, {"method": "picker_open", "params": {"cwd": cwd, "recent_files": ["/p/a", "/p/b"]}}]))
        .await;
    client.response(1).await;

    // Empty query: recent files come first.
    client
        .send(json!([2, {"method": "picker_query", "params": {"query": "", "mode": "file"}}]))
        .await;
    let empty_query = client.response(2).await;
    assert_eq!(empty_query["mode"], "file");
    assert_eq!(empty_query["items"][0], "/p/a");
    assert_eq!(empty_query["items"][1], "/p/b");

    // The enumerator streams asynchronously; poll until the scan lands.
    let mut request_id = 3;
    let items = loop {
        client
            .send(json!([request_id, {"method": "picker_query", "params": {"query": "ma", "mode": "file"}}]))
            .await;
        let result = client.response(request_id).await;
        let items = result["items"].as_array().unwrap().clone();
        if items.contains(&json!("main.fk")) {
            break items;
        }
        request_id += 1;
        assert!(request_id < 100, "picker never saw main.fk");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert!(items.len() <= 50);
    // Prefix match outranks the scattered subsequence in "formula.fk".
    let main_pos = items.iter().position(|i| i == &json!("main.fk")).unwrap();
    if let Some(formula_pos) = items.iter().position(|i| i == &json!("formula.fk")) {
        assert!(main_pos < formula_pos);
    }

    client.send(json!([99, {"method": "picker_close", "params": {}}])).await;
    client.response(99).await;
}

#[tokio::test]
async fn picker_without_recent_files_asks_the_editor() {
    let harness = start_daemon();
    let mut client = Client::connect(&harness).await;
    let cwd = harness.workspace.display().to_string();

    client.send(json!([1, {"method": "picker_open", "params": {"cwd": cwd}}])).await;

    // The daemon asks for the buffer list with a negative expr id.
    let expr = client.wait_for(|l| l[0] == json!("expr")).await;
    let expr_id = expr[2].as_i64().unwrap();
    assert!(expr_id < 0);
    assert!(expr[1].as_str().unwrap().contains("getbufinfo"));
    client.response(1).await;

    client.send(json!([expr_id, ["/somewhere/recent.fk"]])).await;
    client
        .send(json!([2, {"method": "picker_query", "params": {"query": "", "mode": "file"}}]))
        .await;
    let result = client.response(2).await;
    assert_eq!(result["items"][0], "/somewhere/recent.fk");
}

#[tokio::test]
async fn status_reports_servers_and_shutdown_stops_daemon() {
    let harness = start_daemon();
    let mut client = Client::connect(&harness).await;
    let file = file_in(&harness, "plain.fk");

    client.send(json!([1, {"method": "file_open", "params": {"file": file}}])).await;
    client.response(1).await;

    client.send(json!([2, {"method": "status", "params": {}}])).await;
    let status = client.response(2).await;
    assert_eq!(status["clients"], 1);
    assert_eq!(status["servers"][0]["language"], "fake");
    assert_eq!(status["servers"][0]["initialized"], true);

    client.send(json!([3, {"method": "shutdown", "params": {}}])).await;
    assert_eq!(client.response(3).await, json!({"ok": true}));
}

#[tokio::test]
async fn unknown_method_gets_null_response() {
    let harness = start_daemon();
    let mut client = Client::connect(&harness).await;
    client.send(json!([7, {"method": "no_such_method", "params": {}}])).await;
    assert_eq!(client.response(7).await, Value::Null);
}
