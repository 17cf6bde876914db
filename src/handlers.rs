//! Editor command dispatch.
//!
//! Each inbound line resolves to one of four outcomes: an immediate data
//! response, an acknowledgement, a deferred replay (while a server is
//! initializing or indexing), or one or more pending LSP requests whose
//! responses the loop routes back later. Handler failures never unwind:
//! they become a `null` response, a toast, or a log line.

use serde_json::{json, Value};

use crate::daemon::{Daemon, DeferredRequest, ExprTag, PendingLspRequest};
use crate::editor;
use crate::event::ClientId;
use crate::lsp::registry::Target;
use crate::paths;
use crate::picker::{Picker, PickerMode};

/// Feature queries: deferred while any language server is indexing.
fn is_query_method(method: &str) -> bool {
    matches!(
        method,
        "hover"
            | "goto_definition"
            | "goto_declaration"
            | "goto_type_definition"
            | "goto_implementation"
            | "references"
            | "completion"
            | "inlay_hints"
            | "rename"
            | "document_symbols"
            | "folding_range"
            | "code_action"
            | "execute_command"
            | "call_hierarchy_incoming"
            | "call_hierarchy_outgoing"
            | "workspace_symbol"
            | "will_save_wait_until"
    )
}

/// The Vim expression asking for the editor's listed buffer names.
const BUFFER_LIST_EXPR: &str = "map(getbufinfo({'buflisted': 1}), 'v:val.name')";

fn require_str<'a>(params: &'a Value, field: &str) -> Option<&'a str> {
    params.get(field).and_then(Value::as_str)
}

fn require_u32(params: &Value, field: &str) -> Option<u32> {
    params.get(field).and_then(Value::as_u64).and_then(|n| u32::try_from(n).ok())
}

fn text_document_json(target: &Target) -> Option<Value> {
    let uri = paths::file_uri(&target.server_path).ok()?;
    Some(json!({ "uri": uri }))
}

fn position_json(target: &Target, params: &Value) -> Option<Value> {
    let text_document = text_document_json(target)?;
    let line = require_u32(params, "line")?;
    let column = require_u32(params, "column")?;
    Some(json!({
        "textDocument": text_document,
        "position": { "line": line, "character": column },
    }))
}

/// Last line of a local file, for whole-document ranges. Remote and
/// unreadable files get a large fallback the servers clamp.
fn end_line_of(path: &str) -> u32 {
    std::fs::read_to_string(path)
        .map_or(100_000, |text| u32::try_from(text.lines().count()).unwrap_or(u32::MAX))
}

impl Daemon {
    /// Entry point for one editor line: parse, settle expr responses, then
    /// dispatch the command.
    pub(crate) async fn handle_editor_line(&mut self, client: ClientId, raw: &str) {
        if raw.trim().is_empty() {
            return;
        }
        let line = match editor::parse_line(raw) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(%client, "discarding malformed line: {e}");
                return;
            }
        };
        // An outstanding expr id wins before JSON-RPC interpretation.
        if let Some(pending) = self.pending_expr.remove(&line.id) {
            self.handle_expr_response(pending, line.payload).await;
            return;
        }
        let Some((method, params)) = line.call() else {
            tracing::warn!(%client, id = line.id, "line carries no method");
            if line.id > 0 {
                self.respond(client, Some(line.id), Value::Null).await;
            }
            return;
        };
        let method = method.to_string();
        let params = params.clone();
        let vim_id = (line.id > 0).then_some(line.id);
        self.handle_command(client, vim_id, &method, &params, raw).await;
    }

    async fn handle_command(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        method: &str,
        params: &Value,
        raw: &str,
    ) {
        metrics::counter!("yac_commands", "method" => method.to_string()).increment(1);
        if is_query_method(method) && self.registry.is_any_indexing() {
            self.defer(client, vim_id, raw).await;
            return;
        }
        match method {
            "file_open" => self.cmd_file_open(client, vim_id, params, raw).await,
            "did_change" => self.cmd_did_change(client, vim_id, params, raw).await,
            "did_save" => self.cmd_did_save(client, vim_id, params, raw).await,
            "will_save" => self.cmd_will_save(client, vim_id, params, raw).await,
            "will_save_wait_until" => {
                self.cmd_will_save_wait_until(client, vim_id, params, raw).await;
            }
            "did_close" => self.cmd_did_close(client, vim_id, params, raw).await,
            "hover" | "completion" | "references" | "goto_definition" | "goto_declaration"
            | "goto_type_definition" | "goto_implementation" => {
                self.cmd_position_query(client, vim_id, method, params, raw).await;
            }
            "inlay_hints" => self.cmd_inlay_hints(client, vim_id, params, raw).await,
            "rename" => self.cmd_rename(client, vim_id, params, raw).await,
            "document_symbols" => {
                self.cmd_document_request(
                    client, vim_id, params, raw,
                    "textDocument/documentSymbol", "document_symbols",
                ).await;
            }
            "folding_range" => {
                self.cmd_document_request(
                    client, vim_id, params, raw,
                    "textDocument/foldingRange", "folding_range",
                ).await;
            }
            "code_action" => self.cmd_code_action(client, vim_id, params, raw).await,
            "execute_command" => self.cmd_execute_command(client, vim_id, params).await,
            "call_hierarchy_incoming" | "call_hierarchy_outgoing" => {
                self.cmd_call_hierarchy(client, vim_id, method, params, raw).await;
            }
            "workspace_symbol" => self.cmd_workspace_symbol(client, vim_id, params).await,
            "picker_open" => self.cmd_picker_open(client, vim_id, params).await,
            "picker_query" => self.cmd_picker_query(client, vim_id, params).await,
            "picker_close" => self.cmd_picker_close(client, vim_id).await,
            "status" => self.cmd_status(client, vim_id).await,
            "shutdown" => {
                self.shutdown_requested = true;
                self.respond(client, vim_id, json!({ "ok": true })).await;
            }
            other => {
                tracing::warn!(%client, "unknown method {other:?}");
                self.respond(client, vim_id, Value::Null).await;
            }
        }
    }

    /// Hold the raw line for replay and tell the user why, if they asked a
    /// question that now has to wait.
    async fn defer(&mut self, client: ClientId, vim_id: Option<i64>, raw: &str) {
        self.deferred.push_back(DeferredRequest { client, raw_line: raw.to_string() });
        if vim_id.is_some()
            && !self
                .connections
                .write(client, &editor::ex_echo("yac: LSP indexing, request queued"))
                .await
        {
            self.remove_client(client);
        }
    }

    /// Resolve and, when necessary, spawn the server for `file`. `None`
    /// means the request has already been settled (nulled, toasted, or
    /// deferred behind the initialize handshake).
    async fn ready_server(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        file: &str,
        raw: &str,
    ) -> Option<Target> {
        let target = match self.registry.target_for(file) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(%client, "{e:#}");
                self.respond(client, vim_id, Value::Null).await;
                return None;
            }
        };
        let events = self.events_tx.clone();
        match self.registry.ensure_client(&target, events).await {
            Ok((server, _)) => {
                if server.is_initialized() {
                    return Some(target);
                }
            }
            Err(e) => {
                tracing::error!(key = %target.key, "spawn failed: {e:#}");
                self.broadcast(&editor::ex_error(&format!(
                    "yac: failed to start {} server: {e:#}",
                    target.language
                )))
                .await;
                self.respond(client, vim_id, Value::Null).await;
                return None;
            }
        }
        self.defer(client, vim_id, raw).await;
        None
    }

    /// Send one feature request and remember where its response goes.
    async fn issue(
        &mut self,
        target: &Target,
        lsp_method: &str,
        params: Value,
        pending: PendingLspRequest,
    ) {
        let Some(server) = self.registry.get_mut(&target.key) else {
            self.respond(pending.client, pending.vim_request_id, Value::Null).await;
            return;
        };
        match server.send_request(lsp_method, params).await {
            Ok(id) => {
                self.pending_lsp.insert((target.key.clone(), id), pending);
            }
            Err(e) => {
                tracing::warn!(key = %target.key, "{lsp_method} failed: {e:#}");
                self.respond(pending.client, pending.vim_request_id, Value::Null).await;
            }
        }
    }

    async fn notify_server(&mut self, target: &Target, lsp_method: &str, params: Value) {
        if let Some(server) = self.registry.get_mut(&target.key) {
            if let Err(e) = server.send_notification(lsp_method, params).await {
                tracing::warn!(key = %target.key, "{lsp_method} failed: {e:#}");
            }
        }
    }

    fn pending_for(
        &self,
        client: ClientId,
        vim_id: Option<i64>,
        method: &str,
        file: Option<&str>,
        target: &Target,
    ) -> PendingLspRequest {
        PendingLspRequest {
            vim_request_id: vim_id,
            method: method.to_string(),
            client,
            file: file.map(ToString::to_string),
            ssh_host: target.ssh_host.clone(),
        }
    }

    async fn cmd_file_open(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
    ) {
        let Some(file) = require_str(params, "file") else {
            tracing::warn!(%client, "file_open without file");
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(text_document) = text_document_json(&target) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let first_open = self
            .registry
            .get_mut(&target.key)
            .is_some_and(|server| server.note_open(&file));
        if first_open {
            let text = params
                .get("text")
                .and_then(Value::as_str)
                .map_or_else(|| read_local_text(&target), ToString::to_string);
            let did_open = json!({
                "textDocument": {
                    "uri": text_document["uri"],
                    "languageId": target.language,
                    "version": 0,
                    "text": text,
                }
            });
            self.notify_server(&target, "textDocument/didOpen", did_open).await;
        }
        let log_file = self.log_file.display().to_string();
        self.respond(client, vim_id, json!({ "log_file": log_file })).await;
    }

    async fn cmd_did_change(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
    ) {
        let (Some(file), Some(text)) = (require_str(params, "file"), require_str(params, "text"))
        else {
            tracing::warn!(%client, "did_change missing file or text");
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let (file, text) = (file.to_string(), text.to_string());
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(text_document) = text_document_json(&target) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let uri = text_document["uri"].clone();
        let Some(server) = self.registry.get_mut(&target.key) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        // An edit before file_open still opens the document.
        let payload = if server.note_open(&file) {
            (
                "textDocument/didOpen",
                json!({
                    "textDocument": {
                        "uri": uri,
                        "languageId": target.language,
                        "version": 0,
                        "text": text,
                    }
                }),
            )
        } else {
            let version = server.bump_version(&file);
            (
                "textDocument/didChange",
                json!({
                    "textDocument": { "uri": uri, "version": version },
                    "contentChanges": [{ "text": text }],
                }),
            )
        };
        self.notify_server(&target, payload.0, payload.1).await;
        self.respond(client, vim_id, Value::Null).await;
    }

    async fn cmd_did_save(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
    ) {
        let Some(file) = require_str(params, "file") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(text_document) = text_document_json(&target) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let mut payload = json!({ "textDocument": text_document });
        if let Some(text) = require_str(params, "text") {
            payload["text"] = json!(text);
        }
        self.notify_server(&target, "textDocument/didSave", payload).await;
        self.respond(client, vim_id, Value::Null).await;
    }

    async fn cmd_will_save(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
    ) {
        let Some(file) = require_str(params, "file") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(text_document) = text_document_json(&target) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let reason = params.get("save_reason").and_then(Value::as_i64).unwrap_or(1);
        let payload = json!({ "textDocument": text_document, "reason": reason });
        self.notify_server(&target, "textDocument/willSave", payload).await;
        self.respond(client, vim_id, Value::Null).await;
    }

    async fn cmd_will_save_wait_until(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
    ) {
        let Some(file) = require_str(params, "file") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(text_document) = text_document_json(&target) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let reason = params.get("save_reason").and_then(Value::as_i64).unwrap_or(1);
        let payload = json!({ "textDocument": text_document, "reason": reason });
        let pending = self.pending_for(client, vim_id, "will_save_wait_until", Some(&file), &target);
        self.issue(&target, "textDocument/willSaveWaitUntil", payload, pending).await;
    }

    async fn cmd_did_close(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
    ) {
        let Some(file) = require_str(params, "file") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(text_document) = text_document_json(&target) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        if let Some(server) = self.registry.get_mut(&target.key) {
            server.note_close(&file);
        }
        self.notify_server(&target, "textDocument/didClose", json!({ "textDocument": text_document }))
            .await;
        self.respond(client, vim_id, Value::Null).await;
    }

    /// The position-based feature queries share one shape.
    async fn cmd_position_query(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        method: &str,
        params: &Value,
        raw: &str,
    ) {
        let lsp_method = match method {
            "hover" => "textDocument/hover",
            "completion" => "textDocument/completion",
            "references" => "textDocument/references",
            "goto_definition" => "textDocument/definition",
            "goto_declaration" => "textDocument/declaration",
            "goto_type_definition" => "textDocument/typeDefinition",
            "goto_implementation" => "textDocument/implementation",
            _ => unreachable!("routed by handle_command"),
        };
        let Some(file) = require_str(params, "file") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(mut payload) = position_json(&target, params) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        if method == "references" {
            payload["context"] = json!({ "includeDeclaration": true });
        }
        let pending = self.pending_for(client, vim_id, method, Some(&file), &target);
        self.issue(&target, lsp_method, payload, pending).await;
    }

    async fn cmd_inlay_hints(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
    ) {
        let Some(file) = require_str(params, "file") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(text_document) = text_document_json(&target) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let end_line = if target.ssh_host.is_some() {
            100_000
        } else {
            end_line_of(&target.server_path)
        };
        let payload = json!({
            "textDocument": text_document,
            "range": {
                "start": { "line": 0, "character": 0 },
                "end": { "line": end_line, "character": 0 },
            },
        });
        let pending = self.pending_for(client, vim_id, "inlay_hints", Some(&file), &target);
        self.issue(&target, "textDocument/inlayHint", payload, pending).await;
    }

    async fn cmd_rename(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
    ) {
        let (Some(file), Some(new_name)) =
            (require_str(params, "file"), require_str(params, "new_name"))
        else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let (file, new_name) = (file.to_string(), new_name.to_string());
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(mut payload) = position_json(&target, params) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        payload["newName"] = json!(new_name);
        let pending = self.pending_for(client, vim_id, "rename", Some(&file), &target);
        self.issue(&target, "textDocument/rename", payload, pending).await;
    }

    /// Requests that only carry a text document: symbols, folding.
    async fn cmd_document_request(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
        lsp_method: &str,
        method: &str,
    ) {
        let Some(file) = require_str(params, "file") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(text_document) = text_document_json(&target) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let pending = self.pending_for(client, vim_id, method, Some(&file), &target);
        self.issue(&target, lsp_method, json!({ "textDocument": text_document }), pending)
            .await;
    }

    async fn cmd_code_action(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
        raw: &str,
    ) {
        let Some(file) = require_str(params, "file") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let (Some(text_document), Some(line), Some(column)) = (
            text_document_json(&target),
            require_u32(params, "line"),
            require_u32(params, "column"),
        ) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let point = json!({ "line": line, "character": column });
        let payload = json!({
            "textDocument": text_document,
            "range": { "start": point, "end": point },
            "context": { "diagnostics": [] },
        });
        let pending = self.pending_for(client, vim_id, "code_action", Some(&file), &target);
        self.issue(&target, "textDocument/codeAction", payload, pending).await;
    }

    async fn cmd_execute_command(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
    ) {
        let Some(command) = require_str(params, "command_name") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!([]));
        let payload = json!({ "command": command, "arguments": arguments });
        let Some(target) = self.any_initialized_target(params) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let pending = self.pending_for(client, vim_id, "execute_command", None, &target);
        self.issue(&target, "workspace/executeCommand", payload, pending).await;
    }

    async fn cmd_call_hierarchy(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        method: &str,
        params: &Value,
        raw: &str,
    ) {
        let Some(file) = require_str(params, "file") else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let file = file.to_string();
        let Some(target) = self.ready_server(client, vim_id, &file, raw).await else {
            return;
        };
        let Some(payload) = position_json(&target, params) else {
            self.respond(client, vim_id, Value::Null).await;
            return;
        };
        let phase = if method == "call_hierarchy_incoming" {
            "call_hierarchy_prepare_incoming"
        } else {
            "call_hierarchy_prepare_outgoing"
        };
        let pending = self.pending_for(client, vim_id, phase, Some(&file), &target);
        self.issue(&target, "textDocument/prepareCallHierarchy", payload, pending).await;
    }

    async fn cmd_workspace_symbol(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        params: &Value,
    ) {
        let query = require_str(params, "query").unwrap_or_default().to_string();
        let Some(target) = self.any_initialized_target(params) else {
            self.respond(client, vim_id, json!({ "items": [] })).await;
            return;
        };
        let pending = self.pending_for(client, vim_id, "workspace_symbol", None, &target);
        self.issue(&target, "workspace/symbol", json!({ "query": query }), pending).await;
    }

    /// Pick the server for workspace-scoped commands: the file's server if
    /// a file is given, otherwise the first initialized one.
    fn any_initialized_target(&self, params: &Value) -> Option<Target> {
        if let Some(file) = require_str(params, "file") {
            if let Ok(target) = self.registry.target_for(file) {
                if self.registry.get(&target.key).is_some_and(crate::lsp::client::LspClient::is_initialized) {
                    return Some(target);
                }
            }
        }
        self.registry
            .iter()
            .find(|(_, server)| server.is_initialized())
            .map(|(key, server)| Target {
                key: key.clone(),
                language: server.language.clone(),
                workspace_root: server.workspace_root.clone(),
                ssh_host: server.ssh_host.clone(),
                server_path: server.workspace_root.to_string_lossy().into_owned(),
            })
    }

    async fn cmd_picker_open(&mut self, client: ClientId, vim_id: Option<i64>, params: &Value) {
        let cwd = require_str(params, "cwd").unwrap_or(".").to_string();
        let recent: Vec<String> = params
            .get("recent_files")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let ask_buffers = recent.is_empty();

        if let Some(old) = self.picker.take() {
            old.close().await;
        }
        self.picker_generation += 1;
        match Picker::open(&cwd, recent, self.picker_generation, self.events_tx.clone()) {
            Ok(picker) => self.picker = Some(picker),
            Err(e) => {
                tracing::error!("picker open failed: {e:#}");
                self.broadcast(&editor::ex_error(&format!("yac: picker failed: {e:#}"))).await;
                self.respond(client, vim_id, Value::Null).await;
                return;
            }
        }
        if ask_buffers {
            self.send_expr(client, BUFFER_LIST_EXPR, ExprTag::BufferList, None).await;
        }
        self.respond(client, vim_id, Value::Null).await;
    }

    async fn cmd_picker_query(&mut self, client: ClientId, vim_id: Option<i64>, params: &Value) {
        let query = require_str(params, "query").unwrap_or_default().to_string();
        let mode = PickerMode::parse(require_str(params, "mode").unwrap_or("file"))
            .unwrap_or(PickerMode::File);
        if self.picker.is_none() {
            self.respond(client, vim_id, json!({ "items": [], "mode": mode.as_str() })).await;
            return;
        }
        if let Some(picker) = &mut self.picker {
            picker.query = query.clone();
        }
        match mode {
            PickerMode::File => {
                let items = self
                    .picker
                    .as_ref()
                    .map(|p| p.file_items(&query))
                    .unwrap_or_default();
                self.respond(client, vim_id, json!({ "items": items, "mode": "file" })).await;
            }
            PickerMode::WorkspaceSymbol | PickerMode::DocumentSymbol => {
                self.picker_symbol_query(client, vim_id, mode, &query, params).await;
            }
        }
    }

    /// `#`/`@` picker modes: route to the LSP side, superseding whatever
    /// symbol request is still in flight.
    async fn picker_symbol_query(
        &mut self,
        client: ClientId,
        vim_id: Option<i64>,
        mode: PickerMode,
        query: &str,
        params: &Value,
    ) {
        let empty = json!({ "items": [], "mode": mode.as_str() });
        let Some(target) = self.any_initialized_target(params) else {
            self.respond(client, vim_id, empty).await;
            return;
        };
        // Drop the superseded request's pending entry; its late response
        // will arrive unmatched and be discarded.
        if let Some((old_key, old_id)) =
            self.picker.as_mut().and_then(|p| p.inflight_symbol.take())
        {
            self.pending_lsp.remove(&(old_key, old_id));
        }
        let (lsp_method, payload, pending_method) = match mode {
            PickerMode::WorkspaceSymbol => (
                "workspace/symbol",
                json!({ "query": query }),
                "picker_workspace_symbol",
            ),
            PickerMode::DocumentSymbol => {
                let Some(text_document) =
                    require_str(params, "file").and_then(|file| {
                        self.registry
                            .target_for(file)
                            .ok()
                            .and_then(|t| text_document_json(&t))
                    })
                else {
                    self.respond(client, vim_id, empty).await;
                    return;
                };
                (
                    "textDocument/documentSymbol",
                    json!({ "textDocument": text_document }),
                    "picker_document_symbol",
                )
            }
            PickerMode::File => unreachable!("file mode handled in-process"),
        };
        let Some(server) = self.registry.get_mut(&target.key) else {
            self.respond(client, vim_id, empty).await;
            return;
        };
        match server.send_request(lsp_method, payload).await {
            Ok(id) => {
                let pending = PendingLspRequest {
                    vim_request_id: vim_id,
                    method: pending_method.to_string(),
                    client,
                    file: require_str(params, "file").map(ToString::to_string),
                    ssh_host: target.ssh_host.clone(),
                };
                self.pending_lsp.insert((target.key.clone(), id), pending);
                if let Some(picker) = &mut self.picker {
                    picker.inflight_symbol = Some((target.key.clone(), id));
                }
            }
            Err(e) => {
                tracing::warn!(key = %target.key, "picker symbol query failed: {e:#}");
                self.respond(client, vim_id, empty).await;
            }
        }
    }

    async fn cmd_picker_close(&mut self, client: ClientId, vim_id: Option<i64>) {
        if let Some(picker) = self.picker.take() {
            picker.close().await;
        }
        self.respond(client, vim_id, Value::Null).await;
    }

    async fn cmd_status(&mut self, client: ClientId, vim_id: Option<i64>) {
        let servers: Vec<Value> = self
            .registry
            .iter()
            .map(|(key, server)| {
                json!({
                    "key": key,
                    "language": server.language,
                    "workspace_root": server.workspace_root.display().to_string(),
                    "ssh_host": server.ssh_host,
                    "initialized": server.is_initialized(),
                    "indexing": self.registry.is_language_indexing(&server.language),
                })
            })
            .collect();
        let status = json!({
            "clients": self.connections.len(),
            "deferred": self.deferred.len(),
            "picker_open": self.picker.is_some(),
            "servers": servers,
            "log_file": self.log_file.display().to_string(),
        });
        self.respond(client, vim_id, status).await;
    }
}

/// Document text for the first `didOpen`: local files are read from disk;
/// remote files start empty and the editor's first `did_change` fills
/// them in.
fn read_local_text(target: &Target) -> String {
    if target.ssh_host.is_some() {
        return String::new();
    }
    std::fs::read_to_string(&target.server_path).unwrap_or_default()
}
