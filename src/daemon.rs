//! The daemon: all long-lived state and the event loop.
//!
//! One task owns every map below and is the only mutator. Reader tasks
//! (editor sockets, LSP stdouts, the picker's enumerator) decode their
//! streams and forward events over one channel; the loop dispatches them
//! in arrival order. There are no locks because there is no sharing.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::net::UnixListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

use crate::editor::{self, Connections};
use crate::event::{ClientId, Event};
use crate::lsp::config::Languages;
use crate::lsp::registry::Registry;
use crate::picker::Picker;
use crate::rpc::{self, Incoming};
use crate::transform;

/// With zero clients for this long, the daemon exits.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Bookkeeping for one outbound LSP request: where the response goes and
/// how it is transformed. Keyed by `(server key, lsp request id)`.
#[derive(Debug, Clone)]
pub struct PendingLspRequest {
    pub vim_request_id: Option<i64>,
    /// The editor command that produced the request (or an internal phase
    /// tag like `call_hierarchy_prepare_incoming`); drives the transform.
    pub method: String,
    pub client: ClientId,
    pub file: Option<String>,
    pub ssh_host: Option<String>,
}

/// What a daemon-initiated expr request was asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprTag {
    /// The editor's listed-buffer names, for the picker's recent files.
    BufferList,
}

#[derive(Debug, Clone)]
pub struct PendingExprRequest {
    pub client: ClientId,
    pub vim_request_id: Option<i64>,
    pub tag: ExprTag,
}

/// A raw editor line held back until LSP indexing completes.
#[derive(Debug, Clone)]
pub struct DeferredRequest {
    pub client: ClientId,
    pub raw_line: String,
}

pub struct Daemon {
    listener: UnixListener,
    pub(crate) events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    pub(crate) connections: Connections,
    pub(crate) registry: Registry,
    pub(crate) pending_lsp: HashMap<(String, i64), PendingLspRequest>,
    pub(crate) pending_expr: HashMap<i64, PendingExprRequest>,
    next_expr_id: i64,
    pub(crate) deferred: VecDeque<DeferredRequest>,
    pub(crate) picker: Option<Picker>,
    pub(crate) picker_generation: u64,
    idle_deadline: Option<Instant>,
    pub(crate) log_file: PathBuf,
    pub(crate) shutdown_requested: bool,
}

impl Daemon {
    pub fn new(listener: UnixListener, languages: Languages, log_file: PathBuf) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            listener,
            events_tx,
            events_rx,
            connections: Connections::new(),
            registry: Registry::new(languages),
            pending_lsp: HashMap::new(),
            pending_expr: HashMap::new(),
            next_expr_id: 0,
            deferred: VecDeque::new(),
            picker: None,
            picker_generation: 0,
            // Armed from the start: a daemon nobody connects to goes away.
            idle_deadline: Some(Instant::now() + IDLE_TIMEOUT),
            log_file,
            shutdown_requested: false,
        }
    }

    /// Run until idle timeout, a graceful signal, or an explicit shutdown,
    /// then tear down.
    pub async fn run(mut self) -> Result<()> {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        loop {
            let deadline = self.idle_deadline;
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        self.connections.accept(stream, self.events_tx.clone());
                        self.idle_deadline = None;
                    }
                    Err(e) => tracing::warn!("accept error: {e}"),
                },
                event = self.events_rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
                () = sleep_until_or_forever(deadline), if deadline.is_some() => {
                    if self.connections.is_empty() {
                        tracing::info!("idle for {}s with no clients, exiting", IDLE_TIMEOUT.as_secs());
                        break;
                    }
                    self.idle_deadline = None;
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("SIGINT, shutting down");
                    break;
                }
            }
            if self.shutdown_requested {
                tracing::info!("shutdown requested by client");
                break;
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::ClientLine { client, line } => self.handle_editor_line(client, &line).await,
            Event::ClientClosed { client } => self.remove_client(client),
            Event::LspMessage { key, payload } => self.handle_lsp_message(&key, payload).await,
            Event::LspClosed { key } => self.handle_lsp_crash(&key, None).await,
            Event::LspUnrecoverable { key, reason } => {
                self.handle_lsp_crash(&key, Some(reason)).await;
            }
            Event::PickerLines { generation, lines } => {
                if let Some(picker) = &mut self.picker {
                    picker.absorb(generation, lines);
                }
            }
            Event::PickerDone { generation } => {
                if let Some(picker) = &mut self.picker {
                    picker.finish_scan(generation);
                }
            }
        }
    }

    /// Disconnect cleanup: drop the socket, every pending entry owned by
    /// the client, and its deferred lines. Arms the idle deadline when the
    /// last client leaves.
    pub(crate) fn remove_client(&mut self, client: ClientId) {
        if !self.connections.remove(client) {
            return;
        }
        self.pending_lsp.retain(|_, pending| pending.client != client);
        self.pending_expr.retain(|_, pending| pending.client != client);
        self.deferred.retain(|deferred| deferred.client != client);
        if self.connections.is_empty() {
            self.idle_deadline = Some(Instant::now() + IDLE_TIMEOUT);
        }
    }

    /// Write `[id, result]` back to a client. A failed write schedules the
    /// client's removal.
    pub(crate) async fn respond(&mut self, client: ClientId, vim_id: Option<i64>, result: Value) {
        let Some(id) = vim_id else { return };
        if !self.connections.write(client, &editor::response_line(id, &result)).await {
            self.remove_client(client);
        }
    }

    pub(crate) async fn broadcast(&mut self, message: &Value) {
        let dead = self.connections.broadcast(message).await;
        for client in dead {
            self.remove_client(client);
        }
    }

    /// Issue a daemon→editor expr request with a fresh negative id.
    pub(crate) async fn send_expr(
        &mut self,
        client: ClientId,
        expression: &str,
        tag: ExprTag,
        vim_request_id: Option<i64>,
    ) {
        self.next_expr_id -= 1;
        let id = self.next_expr_id;
        self.pending_expr.insert(id, PendingExprRequest { client, vim_request_id, tag });
        if !self.connections.write(client, &editor::expr_line(expression, id)).await {
            self.pending_expr.remove(&id);
            self.remove_client(client);
        }
    }

    async fn handle_lsp_message(&mut self, key: &str, payload: Value) {
        let incoming = match rpc::classify(payload) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!(key = %key, "discarding unclassifiable message: {e}");
                return;
            }
        };
        match incoming {
            Incoming::Response { id, result, error } => {
                self.route_response(key, id, result, error).await;
            }
            Incoming::Notification { method, params } => {
                self.handle_lsp_notification(key, &method, params).await;
            }
            Incoming::Request { id, method, params } => {
                self.handle_server_request(key, id, &method, params).await;
            }
        }
    }

    /// Match a response against the initialize handshake or the pending
    /// table, transform it, and deliver it to the originating client.
    async fn route_response(
        &mut self,
        key: &str,
        id: i64,
        result: Option<Value>,
        error: Option<Value>,
    ) {
        // The initialize response is recognized by its stored id.
        if self.registry.get(key).is_some_and(|c| c.init_request_id == Some(id)) {
            self.finish_handshake(key, result, error).await;
            return;
        }

        let Some(pending) = self.pending_lsp.remove(&(key.to_string(), id)) else {
            tracing::debug!(key = %key, id, "dropping unmatched response");
            return;
        };
        if !self.connections.contains(pending.client) {
            return;
        }
        if let Some(error) = error {
            tracing::warn!(key = %key, method = %pending.method, "LSP error response: {error}");
            self.respond(pending.client, pending.vim_request_id, Value::Null).await;
            return;
        }
        let result = result.unwrap_or(Value::Null);
        metrics::counter!("yac_responses_routed").increment(1);

        let method = pending.method.clone();
        let ssh = pending.ssh_host.clone();
        let ssh = ssh.as_deref();
        let transformed = match method.as_str() {
            "goto_definition" | "goto_declaration" | "goto_type_definition"
            | "goto_implementation" => transform::goto_response(&result, ssh),
            "references" => transform::references_response(&result, ssh),
            "hover" => transform::hover_response(&result),
            "completion" => transform::completion_response(&result),
            "inlay_hints" => transform::inlay_hints_response(&result),
            "rename" => transform::rename_response(&result, ssh),
            "will_save_wait_until" => transform::text_edits_response(&result),
            "document_symbols" => transform::document_symbols_response(&result, ssh),
            "folding_range" => transform::folding_response(&result),
            "code_action" => transform::code_actions_response(&result, ssh),
            "execute_command" => result,
            "workspace_symbol" => transform::workspace_symbols_response(&result, ssh),
            "call_hierarchy_incoming" => transform::call_hierarchy_response(&result, true, ssh),
            "call_hierarchy_outgoing" => transform::call_hierarchy_response(&result, false, ssh),
            "call_hierarchy_prepare_incoming" | "call_hierarchy_prepare_outgoing" => {
                self.continue_call_hierarchy(key, pending, result).await;
                return;
            }
            "picker_workspace_symbol" | "picker_document_symbol" => {
                self.finish_picker_symbols(key, id, &pending, &result).await;
                return;
            }
            other => {
                tracing::warn!("no transform for pending method {other:?}");
                Value::Null
            }
        };
        self.respond(pending.client, pending.vim_request_id, transformed).await;
    }

    async fn finish_handshake(&mut self, key: &str, result: Option<Value>, error: Option<Value>) {
        if let Some(error) = error {
            tracing::error!(key = %key, "initialize failed: {error}");
            self.handle_lsp_crash(key, Some("initialize failed".to_string())).await;
            return;
        }
        let capabilities = result
            .as_ref()
            .and_then(|r| r.get("capabilities"))
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(client) = self.registry.get_mut(key) {
            if let Err(e) = client.complete_handshake(capabilities).await {
                tracing::error!(key = %key, "failed to finish handshake: {e:#}");
                return;
            }
        }
        self.replay_deferred().await;
    }

    /// Second hop of the call-hierarchy flow: prepare produced items, now
    /// ask for the actual calls on the first one.
    async fn continue_call_hierarchy(
        &mut self,
        key: &str,
        pending: PendingLspRequest,
        result: Value,
    ) {
        let items = transform::call_hierarchy_items(&result);
        let Some(item) = items.first() else {
            self.respond(pending.client, pending.vim_request_id, json!({ "items": [] })).await;
            return;
        };
        let incoming = pending.method == "call_hierarchy_prepare_incoming";
        let lsp_method = if incoming {
            "callHierarchy/incomingCalls"
        } else {
            "callHierarchy/outgoingCalls"
        };
        let params = match serde_json::to_value(item) {
            Ok(item) => json!({ "item": item }),
            Err(_) => {
                self.respond(pending.client, pending.vim_request_id, Value::Null).await;
                return;
            }
        };
        let follow_up = PendingLspRequest {
            method: if incoming { "call_hierarchy_incoming" } else { "call_hierarchy_outgoing" }
                .to_string(),
            ..pending
        };
        let Some(server) = self.registry.get_mut(key) else {
            self.respond(follow_up.client, follow_up.vim_request_id, Value::Null).await;
            return;
        };
        match server.send_request(lsp_method, params).await {
            Ok(new_id) => {
                self.pending_lsp.insert((key.to_string(), new_id), follow_up);
            }
            Err(e) => {
                tracing::warn!(key = %key, "call hierarchy follow-up failed: {e:#}");
                self.respond(follow_up.client, follow_up.vim_request_id, Value::Null).await;
            }
        }
    }

    /// Deliver a picker symbol response, unless a newer query superseded it.
    async fn finish_picker_symbols(
        &mut self,
        key: &str,
        id: i64,
        pending: &PendingLspRequest,
        result: &Value,
    ) {
        let current = self
            .picker
            .as_ref()
            .and_then(|p| p.inflight_symbol.as_ref())
            .is_some_and(|(k, i)| k == key && *i == id);
        if !current {
            tracing::debug!("dropping superseded picker symbol response");
            return;
        }
        let (items, mode) = if pending.method == "picker_workspace_symbol" {
            let out = transform::workspace_symbols_response(result, pending.ssh_host.as_deref());
            let items = out["items"].as_array().cloned().unwrap_or_default();
            (items, "workspace_symbol")
        } else {
            let all = transform::document_symbol_items(result);
            let query = self.picker.as_ref().map(|p| p.query.clone()).unwrap_or_default();
            let names: Vec<String> = all
                .iter()
                .map(|item| item["name"].as_str().unwrap_or_default().to_string())
                .collect();
            let items = crate::fuzzy::rank(&query, &names)
                .into_iter()
                .map(|idx| all[idx].clone())
                .collect();
            (items, "document_symbol")
        };
        let items: Vec<Value> = items.into_iter().take(crate::fuzzy::MAX_RESULTS).collect();
        if let Some(picker) = &mut self.picker {
            picker.inflight_symbol = None;
        }
        self.respond(pending.client, pending.vim_request_id, json!({ "items": items, "mode": mode }))
            .await;
    }

    async fn handle_lsp_notification(&mut self, key: &str, method: &str, params: Value) {
        let ssh_host = self.registry.get(key).and_then(|c| c.ssh_host.clone());
        match method {
            "textDocument/publishDiagnostics" => {
                if let Some(action) = transform::diagnostics_action(&params, ssh_host.as_deref()) {
                    metrics::counter!("yac_diagnostics_broadcast").increment(1);
                    self.broadcast(&action).await;
                }
            }
            "$/progress" => {
                let update = self.registry.observe_progress(key, &params);
                if let Some(display) = update.display {
                    self.broadcast(&editor::ex_echo(&format!("yac: {display}"))).await;
                }
                if update.all_idle {
                    self.replay_deferred().await;
                }
            }
            "window/showMessage" => {
                let text = params.get("message").and_then(Value::as_str).unwrap_or_default();
                let is_error = params.get("type").and_then(Value::as_i64) == Some(1);
                let line = if is_error {
                    editor::ex_error(&format!("yac: {text}"))
                } else {
                    editor::ex_echo(&format!("yac: {text}"))
                };
                self.broadcast(&line).await;
            }
            "window/logMessage" => {
                let text = params.get("message").and_then(Value::as_str).unwrap_or_default();
                tracing::info!(key = %key, "server log: {text}");
            }
            other => tracing::debug!(key = %key, "ignoring notification {other}"),
        }
    }

    /// Server→client requests. `workspace/applyEdit` is answered before the
    /// edit is broadcast, honoring the request/response contract.
    async fn handle_server_request(&mut self, key: &str, id: Value, method: &str, params: Value) {
        let ssh_host = self.registry.get(key).and_then(|c| c.ssh_host.clone());
        match method {
            "workspace/applyEdit" => {
                self.answer_server(key, id, json!({ "applied": true })).await;
                if let Some(action) = transform::apply_edit_action(&params, ssh_host.as_deref()) {
                    self.broadcast(&action).await;
                }
            }
            "workspace/configuration" => {
                let options = self
                    .registry
                    .get(key)
                    .and_then(|c| c.initialization_options.clone())
                    .unwrap_or(Value::Null);
                let items = params.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
                let result: Vec<Value> = items
                    .iter()
                    .map(|item| {
                        item.get("section")
                            .and_then(Value::as_str)
                            .and_then(|section| options.get(section))
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                self.answer_server(key, id, json!(result)).await;
            }
            "workspace/workspaceFolders" => {
                let folders = self.registry.get(key).map_or(Value::Null, |client| {
                    let root = client.workspace_root.to_string_lossy();
                    crate::paths::file_uri(&root).map_or(Value::Null, |uri| {
                        json!([{ "uri": uri, "name": client.workspace_root
                            .file_name()
                            .map_or_else(|| "workspace".to_string(), |n| n.to_string_lossy().into_owned()) }])
                    })
                });
                self.answer_server(key, id, folders).await;
            }
            "window/workDoneProgress/create"
            | "client/registerCapability"
            | "client/unregisterCapability" => {
                self.answer_server(key, id, Value::Null).await;
            }
            other => {
                tracing::debug!(key = %key, "rejecting server request {other}");
                if let Some(server) = self.registry.get_mut(key) {
                    let _ = server
                        .send_error_response(id, rpc::METHOD_NOT_FOUND, "unsupported")
                        .await;
                }
            }
        }
    }

    async fn answer_server(&mut self, key: &str, id: Value, result: Value) {
        if let Some(server) = self.registry.get_mut(key) {
            if let Err(e) = server.send_response(id, result).await {
                tracing::warn!(key = %key, "failed to answer server request: {e:#}");
            }
        }
    }

    /// Crash handling: toast every client with a stderr excerpt, fail the
    /// server's in-flight requests back as `null`, forget the server. The
    /// next request for its language spawns a fresh one.
    async fn handle_lsp_crash(&mut self, key: &str, reason: Option<String>) {
        let Some(client) = self.registry.remove(key) else {
            return;
        };
        metrics::counter!("yac_lsp_crashes").increment(1);
        let tail = client.stderr_tail();
        let excerpt: String = tail.chars().rev().take(200).collect::<Vec<_>>().into_iter().rev().collect();
        let excerpt = excerpt.replace('\n', " ");
        let language = client.language.clone();
        client.kill().await;

        let detail = reason.unwrap_or_else(|| {
            if excerpt.is_empty() { "no stderr output".to_string() } else { excerpt }
        });
        tracing::error!(key = %key, "LSP server crashed: {detail}");
        self.broadcast(&editor::ex_error(&format!(
            "yac: LSP server crashed ({language}): {detail}"
        )))
        .await;

        // Requests that will never get a response resolve to null now.
        let stranded: Vec<(String, i64)> = self
            .pending_lsp
            .keys()
            .filter(|(k, _)| k == key)
            .cloned()
            .collect();
        for entry in stranded {
            if let Some(pending) = self.pending_lsp.remove(&entry) {
                self.respond(pending.client, pending.vim_request_id, Value::Null).await;
            }
        }
        if let Some(picker) = &mut self.picker {
            if picker.inflight_symbol.as_ref().is_some_and(|(k, _)| k == key) {
                picker.inflight_symbol = None;
            }
        }
        self.fail_deferred_for_key(key).await;
    }

    /// Deferred lines that were waiting on the crashed server get a `null`
    /// response instead of waiting forever; lines for other servers stay.
    async fn fail_deferred_for_key(&mut self, key: &str) {
        let mut kept = VecDeque::new();
        let mut failed = Vec::new();
        while let Some(deferred) = self.deferred.pop_front() {
            let targets_key = editor::parse_line(&deferred.raw_line)
                .ok()
                .and_then(|line| {
                    let (_, params) = line.call().map(|(m, p)| (m.to_string(), p.clone()))?;
                    let file = params.get("file")?.as_str()?.to_string();
                    let target = self.registry.target_for(&file).ok()?;
                    Some((target.key, line.id))
                });
            match targets_key {
                Some((target_key, id)) if target_key == key => {
                    failed.push((deferred.client, id));
                }
                _ => kept.push_back(deferred),
            }
        }
        self.deferred = kept;
        for (client, id) in failed {
            let vim_id = (id > 0).then_some(id);
            self.respond(client, vim_id, Value::Null).await;
        }
    }

    /// Replay deferred lines in FIFO order. A line that still hits a gate
    /// re-defers behind any lines deferred during the replay, preserving
    /// relative order.
    pub(crate) async fn replay_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let batch: Vec<DeferredRequest> = self.deferred.drain(..).collect();
        tracing::info!("replaying {} deferred request(s)", batch.len());
        for deferred in batch {
            if self.connections.contains(deferred.client) {
                self.handle_editor_line(deferred.client, &deferred.raw_line).await;
            }
        }
    }

    /// Handle an expr response from the editor.
    pub(crate) async fn handle_expr_response(&mut self, pending: PendingExprRequest, value: Value) {
        match pending.tag {
            ExprTag::BufferList => {
                let buffers: Vec<String> = value
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str())
                            .filter(|s| !s.is_empty())
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if let Some(picker) = &mut self.picker {
                    if picker.recent.is_empty() {
                        picker.recent = buffers;
                    }
                }
            }
        }
    }

    /// Graceful teardown: close the picker, shut every server down.
    async fn shutdown(&mut self) {
        if let Some(picker) = self.picker.take() {
            picker.close().await;
        }
        self.registry.shutdown_all().await;
        tracing::info!("daemon exited cleanly");
    }
}

fn sleep_until_or_forever(deadline: Option<Instant>) -> tokio::time::Sleep {
    // The branch is guarded on `deadline.is_some()`; the fallback value is
    // never awaited.
    tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now))
}
