//! One language-server child process.
//!
//! Spawns the server (directly, or wrapped in `ssh` for remote
//! workspaces), performs the `initialize` handshake bookkeeping, frames
//! outbound messages, and keeps a capped tail of the child's stderr for
//! crash reports. Inbound frames are decoded by a reader task and handed
//! to the daemon loop as events; routing happens there, not here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use lsp_types::{
    ClientCapabilities, CompletionClientCapabilities, CompletionItemCapability,
    DocumentSymbolClientCapabilities, GeneralClientCapabilities, HoverClientCapabilities,
    InitializeParams, MarkupKind, PositionEncodingKind, PublishDiagnosticsClientCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities,
    WindowClientCapabilities, WorkspaceClientCapabilities,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::UnboundedSender;

use crate::event::Event;
use crate::framing::{encode_frame, FrameDecoder, FrameError};
use crate::lsp::config::LanguageConfig;
use crate::{paths, rpc};

/// Lines of stderr kept for crash diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// Grace period between the `exit` notification and a hard kill.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

pub struct LspClient {
    pub key: String,
    pub language: String,
    pub workspace_root: PathBuf,
    pub ssh_host: Option<String>,
    /// Outstanding `initialize` request id; `None` once the handshake is done.
    pub init_request_id: Option<i64>,
    /// Server capabilities, saved from the `initialize` response.
    pub capabilities: Option<Value>,
    pub initialization_options: Option<Value>,
    opened: HashSet<String>,
    versions: HashMap<String, i32>,
    next_id: i64,
    stdin: ChildStdin,
    child: Child,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl LspClient {
    /// Spawn the server and send the `initialize` request. The returned
    /// client is not usable for feature requests until the daemon observes
    /// the initialize response and calls [`Self::complete_handshake`].
    pub async fn spawn(
        config: &LanguageConfig,
        key: String,
        workspace_root: PathBuf,
        ssh_host: Option<String>,
        events: UnboundedSender<Event>,
    ) -> Result<Self> {
        let mut cmd = build_command(config, &workspace_root, ssh_host.as_deref())?;
        let mut child = cmd
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {} server ({})", config.language_id, config.command))?;

        let stdin = child.stdin.take().context("no stdin on LSP child")?;
        let stdout = child.stdout.take().context("no stdout on LSP child")?;
        let stderr = child.stderr.take().context("no stderr on LSP child")?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        tokio::spawn(tail_stderr(stderr, Arc::clone(&stderr_tail)));
        tokio::spawn(read_stdout(stdout, key.clone(), events));

        let mut client = Self {
            key,
            language: config.language_id.clone(),
            workspace_root,
            ssh_host,
            init_request_id: None,
            capabilities: None,
            initialization_options: config.initialization_options.clone(),
            opened: HashSet::new(),
            versions: HashMap::new(),
            next_id: 0,
            stdin,
            child,
            stderr_tail,
        };

        let params = client.initialize_params()?;
        let id = client.send_request("initialize", params).await?;
        client.init_request_id = Some(id);
        tracing::info!(key = %client.key, "spawned LSP server, initialize id {id}");
        Ok(client)
    }

    fn initialize_params(&self) -> Result<Value> {
        let root_uri = paths::file_uri(&self.workspace_root.to_string_lossy())?;
        #[allow(deprecated)] // root_uri is deprecated in LSP but widely required
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(root_uri.parse().map_err(|e| {
                anyhow::anyhow!("invalid workspace root URI {root_uri}: {e}")
            })?),
            capabilities: client_capabilities(),
            initialization_options: self.initialization_options.clone(),
            ..InitializeParams::default()
        };
        Ok(serde_json::to_value(params)?)
    }

    /// Record the `initialize` response: save capabilities and send the
    /// `initialized` notification. Deferred-request replay is the caller's
    /// concern.
    pub async fn complete_handshake(&mut self, capabilities: Value) -> Result<()> {
        self.capabilities = Some(capabilities);
        self.init_request_id = None;
        self.send_notification("initialized", serde_json::json!({})).await?;
        tracing::info!(key = %self.key, "LSP handshake complete");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.capabilities.is_some()
    }

    /// First `didOpen` for a file in this server session?
    pub fn note_open(&mut self, file: &str) -> bool {
        let first = self.opened.insert(file.to_string());
        if first {
            self.versions.insert(file.to_string(), 0);
        }
        first
    }

    pub fn note_close(&mut self, file: &str) {
        self.opened.remove(file);
        self.versions.remove(file);
    }

    pub fn bump_version(&mut self, file: &str) -> i32 {
        let version = self.versions.entry(file.to_string()).or_insert(0);
        *version += 1;
        *version
    }

    /// Allocate the next request id and write a framed request.
    pub async fn send_request(&mut self, method: &str, params: Value) -> Result<i64> {
        self.next_id += 1;
        let id = self.next_id;
        self.write_frame(&rpc::request(id, method, params)).await?;
        Ok(id)
    }

    pub async fn send_notification(&mut self, method: &str, params: Value) -> Result<()> {
        self.write_frame(&rpc::notification(method, params)).await
    }

    /// Reply to a server-originated request.
    pub async fn send_response(&mut self, id: Value, result: Value) -> Result<()> {
        self.write_frame(&rpc::response(id, result)).await
    }

    pub async fn send_error_response(&mut self, id: Value, code: i64, message: &str) -> Result<()> {
        self.write_frame(&rpc::error_response(id, code, message)).await
    }

    async fn write_frame(&mut self, msg: &Value) -> Result<()> {
        let body = serde_json::to_vec(msg)?;
        self.stdin
            .write_all(&encode_frame(&body))
            .await
            .context("failed to write to LSP stdin")?;
        self.stdin.flush().await.context("failed to flush LSP stdin")?;
        Ok(())
    }

    /// Snapshot of the child's recent stderr output.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    /// Graceful teardown: `shutdown` request, `exit` notification, SIGTERM,
    /// then a hard kill after the grace period.
    pub async fn shutdown(mut self) {
        let _ = self.send_request("shutdown", Value::Null).await;
        let _ = self.send_notification("exit", Value::Null).await;
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(key = %self.key, "LSP child exited with {status}"),
            Ok(Err(e)) => tracing::warn!(key = %self.key, "error waiting for LSP child: {e}"),
            Err(_) => {
                tracing::warn!(key = %self.key, "LSP child ignored shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
    }

    /// Immediate teardown for a server whose stream is unusable.
    pub async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

fn build_command(
    config: &LanguageConfig,
    workspace_root: &Path,
    ssh_host: Option<&str>,
) -> Result<Command> {
    if let Some(host) = ssh_host {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg("ControlPath=~/.ssh/yac-lsp-bridge-%r@%h:%p")
            .arg("-o")
            .arg("ControlPersist=600")
            .arg(host)
            .arg(&config.command)
            .args(&config.args);
        return Ok(cmd);
    }
    let binary = which::which(&config.command).with_context(|| {
        format!(
            "{} server binary {:?} not found on PATH",
            config.language_id, config.command
        )
    })?;
    let mut cmd = Command::new(binary);
    cmd.args(&config.args).current_dir(workspace_root);
    Ok(cmd)
}

/// Client capabilities advertised at initialize: completion with snippet
/// support, markdown hover, published diagnostics, workspace
/// configuration, and work-done progress.
fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            apply_edit: Some(true),
            ..WorkspaceClientCapabilities::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                did_save: Some(true),
                will_save: Some(true),
                will_save_wait_until: Some(true),
                ..TextDocumentSyncClientCapabilities::default()
            }),
            completion: Some(CompletionClientCapabilities {
                completion_item: Some(CompletionItemCapability {
                    snippet_support: Some(true),
                    documentation_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                    ..CompletionItemCapability::default()
                }),
                ..CompletionClientCapabilities::default()
            }),
            hover: Some(HoverClientCapabilities {
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                ..HoverClientCapabilities::default()
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
            document_symbol: Some(DocumentSymbolClientCapabilities {
                hierarchical_document_symbol_support: Some(true),
                ..DocumentSymbolClientCapabilities::default()
            }),
            ..TextDocumentClientCapabilities::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..WindowClientCapabilities::default()
        }),
        general: Some(GeneralClientCapabilities {
            position_encodings: Some(vec![PositionEncodingKind::UTF16]),
            ..GeneralClientCapabilities::default()
        }),
        ..ClientCapabilities::default()
    }
}

/// Drain the child's stdout: decode frames, parse JSON, forward to the
/// loop. Malformed headers are logged and skipped; an oversized frame
/// tears the stream down.
async fn read_stdout(
    stdout: tokio::process::ChildStdout,
    key: String,
    events: UnboundedSender<Event>,
) {
    let mut stdout = stdout;
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => {
                let _ = events.send(Event::LspClosed { key });
                return;
            }
            Ok(n) => decoder.extend(&chunk[..n]),
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(body)) => match serde_json::from_slice::<Value>(&body) {
                    Ok(payload) => {
                        if events.send(Event::LspMessage { key: key.clone(), payload }).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(key = %key, "discarding invalid JSON frame: {e}"),
                },
                Ok(None) => break,
                Err(FrameError::Malformed(detail)) => {
                    tracing::warn!(key = %key, "resyncing LSP stream: {detail}");
                }
                Err(e @ FrameError::Oversized(_)) => {
                    let _ = events.send(Event::LspUnrecoverable {
                        key,
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }
    }
}

async fn tail_stderr(
    stderr: tokio::process::ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}
