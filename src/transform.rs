//! LSP results → presentation-ready editor actions.
//!
//! Every transform takes the raw `result` value of an LSP response and
//! produces the compact JSON shape the editor renders directly. Paths
//! cross the URI boundary here: `file://` URIs become plain paths, or
//! `scp://host/...` paths when the originating request carried an SSH
//! host.

use lsp_types::{
    CallHierarchyIncomingCall, CallHierarchyItem, CallHierarchyOutgoingCall, CodeActionOrCommand,
    CompletionItem, CompletionItemKind, CompletionResponse, Diagnostic, DiagnosticSeverity,
    DocumentChangeOperation, DocumentChanges, DocumentSymbol, DocumentSymbolResponse,
    FoldingRange, GotoDefinitionResponse, Hover, HoverContents, InlayHint, InlayHintKind,
    InlayHintLabel, Location, MarkedString, NumberOrString, PublishDiagnosticsParams, Range,
    SymbolInformation, SymbolKind, TextEdit, WorkspaceEdit, WorkspaceSymbolResponse,
};
use serde_json::{json, Value};

use crate::paths::uri_to_editor_path;

fn editor_path(uri: &lsp_types::Uri, ssh_host: Option<&str>) -> String {
    uri_to_editor_path(uri.as_str(), ssh_host)
}

fn position_fields(range: &Range) -> (u32, u32) {
    (range.start.line, range.start.character)
}

/// Flatten the three shapes a goto response can take into a location list.
fn flatten_goto(result: &Value) -> Vec<Location> {
    match serde_json::from_value::<Option<GotoDefinitionResponse>>(result.clone()) {
        Ok(Some(GotoDefinitionResponse::Scalar(loc))) => vec![loc],
        Ok(Some(GotoDefinitionResponse::Array(locs))) => locs,
        Ok(Some(GotoDefinitionResponse::Link(links))) => links
            .into_iter()
            .map(|link| Location {
                uri: link.target_uri,
                range: link.target_selection_range,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::debug!("unparseable goto response: {e}");
            Vec::new()
        }
    }
}

/// Goto families: first location or `null`.
pub fn goto_response(result: &Value, ssh_host: Option<&str>) -> Value {
    flatten_goto(result).first().map_or(Value::Null, |loc| {
        let (line, column) = position_fields(&loc.range);
        json!({
            "file": editor_path(&loc.uri, ssh_host),
            "line": line,
            "column": column,
        })
    })
}

/// References: the full location list.
pub fn references_response(result: &Value, ssh_host: Option<&str>) -> Value {
    let locations: Vec<Location> =
        serde_json::from_value(result.clone()).unwrap_or_default();
    let locations: Vec<Value> = locations
        .iter()
        .map(|loc| {
            let (line, column) = position_fields(&loc.range);
            json!({
                "file": editor_path(&loc.uri, ssh_host),
                "line": line,
                "column": column,
            })
        })
        .collect();
    json!({ "locations": locations })
}

fn marked_string_text(marked: MarkedString) -> String {
    match marked {
        MarkedString::String(s) => s,
        MarkedString::LanguageString(ls) => format!("```{}\n{}\n```", ls.language, ls.value),
    }
}

/// Hover: markdown/plaintext pieces joined into one string, or `null`.
pub fn hover_response(result: &Value) -> Value {
    let Ok(Some(hover)) = serde_json::from_value::<Option<Hover>>(result.clone()) else {
        return Value::Null;
    };
    let content = match hover.contents {
        HoverContents::Markup(markup) => markup.value,
        HoverContents::Scalar(marked) => marked_string_text(marked),
        HoverContents::Array(items) => items
            .into_iter()
            .map(marked_string_text)
            .collect::<Vec<_>>()
            .join("\n\n"),
    };
    if content.is_empty() {
        Value::Null
    } else {
        json!({ "content": content })
    }
}

/// Symbolic names for LSP completion-item kind codes.
pub fn completion_kind_name(kind: CompletionItemKind) -> &'static str {
    match kind {
        CompletionItemKind::TEXT => "text",
        CompletionItemKind::METHOD => "method",
        CompletionItemKind::FUNCTION => "function",
        CompletionItemKind::CONSTRUCTOR => "constructor",
        CompletionItemKind::FIELD => "field",
        CompletionItemKind::VARIABLE => "variable",
        CompletionItemKind::CLASS => "class",
        CompletionItemKind::INTERFACE => "interface",
        CompletionItemKind::MODULE => "module",
        CompletionItemKind::PROPERTY => "property",
        CompletionItemKind::UNIT => "unit",
        CompletionItemKind::VALUE => "value",
        CompletionItemKind::ENUM => "enum",
        CompletionItemKind::KEYWORD => "keyword",
        CompletionItemKind::SNIPPET => "snippet",
        CompletionItemKind::COLOR => "color",
        CompletionItemKind::FILE => "file",
        CompletionItemKind::REFERENCE => "reference",
        CompletionItemKind::FOLDER => "folder",
        CompletionItemKind::ENUM_MEMBER => "enum_member",
        CompletionItemKind::CONSTANT => "constant",
        CompletionItemKind::STRUCT => "struct",
        CompletionItemKind::EVENT => "event",
        CompletionItemKind::OPERATOR => "operator",
        CompletionItemKind::TYPE_PARAMETER => "type_parameter",
        _ => "text",
    }
}

fn completion_item(item: CompletionItem) -> Value {
    let documentation = item.documentation.map(|doc| match doc {
        lsp_types::Documentation::String(s) => s,
        lsp_types::Documentation::MarkupContent(mc) => mc.value,
    });
    let insert_text = item.insert_text.unwrap_or_else(|| item.label.clone());
    json!({
        "label": item.label,
        "kind": item.kind.map(completion_kind_name),
        "detail": item.detail,
        "documentation": documentation,
        "insertText": insert_text,
    })
}

/// Completion list or item array → `{items: [...]}` or `null`.
pub fn completion_response(result: &Value) -> Value {
    let Ok(Some(response)) = serde_json::from_value::<Option<CompletionResponse>>(result.clone())
    else {
        return Value::Null;
    };
    let items = match response {
        CompletionResponse::Array(items) => items,
        CompletionResponse::List(list) => list.items,
    };
    let items: Vec<Value> = items.into_iter().map(completion_item).collect();
    json!({ "items": items })
}

fn inlay_hint_label(label: InlayHintLabel) -> String {
    match label {
        InlayHintLabel::String(s) => s,
        InlayHintLabel::LabelParts(parts) => {
            parts.into_iter().map(|p| p.value).collect::<String>()
        }
    }
}

pub fn inlay_hints_response(result: &Value) -> Value {
    let hints: Vec<InlayHint> = match serde_json::from_value(result.clone()) {
        Ok(Some(hints)) => hints,
        _ => Vec::new(),
    };
    let hints: Vec<Value> = hints
        .into_iter()
        .map(|hint| {
            let kind = hint.kind.map(|k| match k {
                InlayHintKind::TYPE => "type",
                InlayHintKind::PARAMETER => "parameter",
                _ => "other",
            });
            json!({
                "line": hint.position.line,
                "column": hint.position.character,
                "label": inlay_hint_label(hint.label),
                "kind": kind,
            })
        })
        .collect();
    json!({ "hints": hints })
}

fn text_edit_value(edit: &TextEdit) -> Value {
    json!({
        "start_line": edit.range.start.line,
        "start_column": edit.range.start.character,
        "end_line": edit.range.end.line,
        "end_column": edit.range.end.character,
        "new_text": edit.new_text,
    })
}

/// A bare `TextEdit[]` (e.g. `willSaveWaitUntil`) → `{edits: [...]}`.
pub fn text_edits_response(result: &Value) -> Value {
    let edits: Vec<TextEdit> = match serde_json::from_value(result.clone()) {
        Ok(Some(edits)) => edits,
        _ => Vec::new(),
    };
    json!({ "edits": edits.iter().map(text_edit_value).collect::<Vec<_>>() })
}

/// WorkspaceEdit → per-file edit lists.
pub fn workspace_edit_value(edit: &WorkspaceEdit, ssh_host: Option<&str>) -> Value {
    let mut files: Vec<Value> = Vec::new();
    if let Some(changes) = &edit.changes {
        for (uri, edits) in changes {
            files.push(json!({
                "file": editor_path(uri, ssh_host),
                "edits": edits.iter().map(text_edit_value).collect::<Vec<_>>(),
            }));
        }
    }
    if let Some(document_changes) = &edit.document_changes {
        let doc_edits: Vec<&lsp_types::TextDocumentEdit> = match document_changes {
            DocumentChanges::Edits(edits) => edits.iter().collect(),
            DocumentChanges::Operations(ops) => ops
                .iter()
                .filter_map(|op| match op {
                    DocumentChangeOperation::Edit(edit) => Some(edit),
                    DocumentChangeOperation::Op(_) => None,
                })
                .collect(),
        };
        for doc_edit in doc_edits {
            let edits: Vec<Value> = doc_edit
                .edits
                .iter()
                .map(|edit| match edit {
                    lsp_types::OneOf::Left(plain) => text_edit_value(plain),
                    lsp_types::OneOf::Right(annotated) => text_edit_value(&annotated.text_edit),
                })
                .collect();
            files.push(json!({
                "file": editor_path(&doc_edit.text_document.uri, ssh_host),
                "edits": edits,
            }));
        }
    }
    json!({ "edits": files })
}

/// Rename result → workspace-edit shape or `null`.
pub fn rename_response(result: &Value, ssh_host: Option<&str>) -> Value {
    match serde_json::from_value::<Option<WorkspaceEdit>>(result.clone()) {
        Ok(Some(edit)) => workspace_edit_value(&edit, ssh_host),
        _ => Value::Null,
    }
}

/// Symbolic names for LSP symbol-kind codes.
pub fn symbol_kind_name(kind: SymbolKind) -> &'static str {
    match kind {
        SymbolKind::FILE => "file",
        SymbolKind::MODULE => "module",
        SymbolKind::NAMESPACE => "namespace",
        SymbolKind::PACKAGE => "package",
        SymbolKind::CLASS => "class",
        SymbolKind::METHOD => "method",
        SymbolKind::PROPERTY => "property",
        SymbolKind::FIELD => "field",
        SymbolKind::CONSTRUCTOR => "constructor",
        SymbolKind::ENUM => "enum",
        SymbolKind::INTERFACE => "interface",
        SymbolKind::FUNCTION => "function",
        SymbolKind::VARIABLE => "variable",
        SymbolKind::CONSTANT => "constant",
        SymbolKind::STRING => "string",
        SymbolKind::NUMBER => "number",
        SymbolKind::BOOLEAN => "boolean",
        SymbolKind::ARRAY => "array",
        SymbolKind::OBJECT => "object",
        SymbolKind::KEY => "key",
        SymbolKind::NULL => "null",
        SymbolKind::ENUM_MEMBER => "enum_member",
        SymbolKind::STRUCT => "struct",
        SymbolKind::EVENT => "event",
        SymbolKind::OPERATOR => "operator",
        SymbolKind::TYPE_PARAMETER => "type_parameter",
        _ => "object",
    }
}

fn nested_symbol(symbol: DocumentSymbol) -> Value {
    let (line, column) = position_fields(&symbol.selection_range);
    let children: Vec<Value> = symbol
        .children
        .unwrap_or_default()
        .into_iter()
        .map(nested_symbol)
        .collect();
    json!({
        "name": symbol.name,
        "kind": symbol_kind_name(symbol.kind),
        "detail": symbol.detail,
        "line": line,
        "column": column,
        "children": children,
    })
}

fn flat_symbol(symbol: SymbolInformation, ssh_host: Option<&str>) -> Value {
    let (line, column) = position_fields(&symbol.location.range);
    json!({
        "name": symbol.name,
        "kind": symbol_kind_name(symbol.kind),
        "file": editor_path(&symbol.location.uri, ssh_host),
        "line": line,
        "column": column,
        "container": symbol.container_name,
    })
}

/// Document symbols, preserving nesting when the server provides it.
pub fn document_symbols_response(result: &Value, ssh_host: Option<&str>) -> Value {
    let Ok(Some(response)) =
        serde_json::from_value::<Option<DocumentSymbolResponse>>(result.clone())
    else {
        return json!({ "symbols": [] });
    };
    let symbols: Vec<Value> = match response {
        DocumentSymbolResponse::Nested(symbols) => {
            symbols.into_iter().map(nested_symbol).collect()
        }
        DocumentSymbolResponse::Flat(symbols) => symbols
            .into_iter()
            .map(|s| flat_symbol(s, ssh_host))
            .collect(),
    };
    json!({ "symbols": symbols })
}

/// Flatten a document-symbol tree into pickable items, depth first, with
/// the parent symbol as `container`.
pub fn document_symbol_items(result: &Value) -> Vec<Value> {
    fn walk(mut symbol: DocumentSymbol, container: Option<&str>, out: &mut Vec<Value>) {
        let children = symbol.children.take().unwrap_or_default();
        let name = symbol.name;
        let (line, column) = position_fields(&symbol.selection_range);
        out.push(json!({
            "name": &name,
            "kind": symbol_kind_name(symbol.kind),
            "line": line,
            "column": column,
            "container": container,
        }));
        for child in children {
            walk(child, Some(&name), out);
        }
    }

    let Ok(Some(response)) =
        serde_json::from_value::<Option<DocumentSymbolResponse>>(result.clone())
    else {
        return Vec::new();
    };
    match response {
        DocumentSymbolResponse::Nested(symbols) => {
            let mut out = Vec::new();
            for symbol in symbols {
                walk(symbol, None, &mut out);
            }
            out
        }
        DocumentSymbolResponse::Flat(symbols) => symbols
            .into_iter()
            .map(|s| {
                let (line, column) = position_fields(&s.location.range);
                json!({
                    "name": s.name,
                    "kind": symbol_kind_name(s.kind),
                    "line": line,
                    "column": column,
                    "container": s.container_name,
                })
            })
            .collect(),
    }
}

/// Workspace symbols → flat `{items: [...]}` list for the picker and the
/// direct `workspace_symbol` command.
pub fn workspace_symbols_response(result: &Value, ssh_host: Option<&str>) -> Value {
    let Ok(Some(response)) =
        serde_json::from_value::<Option<WorkspaceSymbolResponse>>(result.clone())
    else {
        return json!({ "items": [] });
    };
    let items: Vec<Value> = match response {
        WorkspaceSymbolResponse::Flat(symbols) => symbols
            .into_iter()
            .map(|s| flat_symbol(s, ssh_host))
            .collect(),
        WorkspaceSymbolResponse::Nested(symbols) => symbols
            .into_iter()
            .filter_map(|s| {
                let location = match s.location {
                    lsp_types::OneOf::Left(loc) => loc,
                    // Location-less symbols can't be jumped to; skip them.
                    lsp_types::OneOf::Right(_) => return None,
                };
                let (line, column) = position_fields(&location.range);
                Some(json!({
                    "name": s.name,
                    "kind": symbol_kind_name(s.kind),
                    "file": editor_path(&location.uri, ssh_host),
                    "line": line,
                    "column": column,
                    "container": s.container_name,
                }))
            })
            .collect(),
    };
    json!({ "items": items })
}

pub fn folding_response(result: &Value) -> Value {
    let ranges: Vec<FoldingRange> = match serde_json::from_value(result.clone()) {
        Ok(Some(ranges)) => ranges,
        _ => Vec::new(),
    };
    let ranges: Vec<Value> = ranges
        .iter()
        .map(|r| json!({ "start_line": r.start_line, "end_line": r.end_line }))
        .collect();
    json!({ "ranges": ranges })
}

pub fn code_actions_response(result: &Value, ssh_host: Option<&str>) -> Value {
    let actions: Vec<CodeActionOrCommand> = match serde_json::from_value(result.clone()) {
        Ok(Some(actions)) => actions,
        _ => Vec::new(),
    };
    let actions: Vec<Value> = actions
        .into_iter()
        .map(|action| match action {
            CodeActionOrCommand::Command(cmd) => json!({
                "title": cmd.title,
                "kind": Value::Null,
                "command": { "command": cmd.command, "arguments": cmd.arguments },
            }),
            CodeActionOrCommand::CodeAction(act) => json!({
                "title": act.title,
                "kind": act.kind.map(|k| k.as_str().to_string()),
                "command": act.command.map(|c| json!({
                    "command": c.command,
                    "arguments": c.arguments,
                })),
                "edit": act.edit.map(|e| workspace_edit_value(&e, ssh_host)),
            }),
        })
        .collect();
    json!({ "actions": actions })
}

fn hierarchy_item_value(item: &CallHierarchyItem, ssh_host: Option<&str>) -> Value {
    let (line, column) = position_fields(&item.selection_range);
    json!({
        "name": item.name,
        "kind": symbol_kind_name(item.kind),
        "file": editor_path(&item.uri, ssh_host),
        "line": line,
        "column": column,
    })
}

/// Items from `textDocument/prepareCallHierarchy`.
pub fn call_hierarchy_items(result: &Value) -> Vec<CallHierarchyItem> {
    serde_json::from_value::<Option<Vec<CallHierarchyItem>>>(result.clone())
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Incoming or outgoing call lists → `{items: [...]}`.
pub fn call_hierarchy_response(result: &Value, incoming: bool, ssh_host: Option<&str>) -> Value {
    let items: Vec<Value> = if incoming {
        let calls: Vec<CallHierarchyIncomingCall> =
            match serde_json::from_value(result.clone()) {
                Ok(Some(calls)) => calls,
                _ => Vec::new(),
            };
        calls
            .iter()
            .map(|call| hierarchy_item_value(&call.from, ssh_host))
            .collect()
    } else {
        let calls: Vec<CallHierarchyOutgoingCall> =
            match serde_json::from_value(result.clone()) {
                Ok(Some(calls)) => calls,
                _ => Vec::new(),
            };
        calls
            .iter()
            .map(|call| hierarchy_item_value(&call.to, ssh_host))
            .collect()
    };
    json!({ "items": items })
}

fn severity_name(severity: Option<DiagnosticSeverity>) -> &'static str {
    match severity {
        Some(DiagnosticSeverity::ERROR) => "error",
        Some(DiagnosticSeverity::WARNING) => "warning",
        Some(DiagnosticSeverity::HINT) => "hint",
        _ => "info",
    }
}

fn diagnostic_value(diag: &Diagnostic, file: &str) -> Value {
    let code = diag.code.as_ref().map(|code| match code {
        NumberOrString::Number(n) => json!(n),
        NumberOrString::String(s) => json!(s),
    });
    json!({
        "file": file,
        "line": diag.range.start.line,
        "column": diag.range.start.character,
        "severity": severity_name(diag.severity),
        "message": diag.message,
        "source": diag.source,
        "code": code,
    })
}

/// `textDocument/publishDiagnostics` → broadcast action.
pub fn diagnostics_action(params: &Value, ssh_host: Option<&str>) -> Option<Value> {
    let parsed: PublishDiagnosticsParams = serde_json::from_value(params.clone()).ok()?;
    let file = editor_path(&parsed.uri, ssh_host);
    let diagnostics: Vec<Value> = parsed
        .diagnostics
        .iter()
        .map(|d| diagnostic_value(d, &file))
        .collect();
    Some(json!({ "action": "diagnostics", "file": file, "diagnostics": diagnostics }))
}

/// `workspace/applyEdit` params → broadcast action.
pub fn apply_edit_action(params: &Value, ssh_host: Option<&str>) -> Option<Value> {
    let parsed: lsp_types::ApplyWorkspaceEditParams =
        serde_json::from_value(params.clone()).ok()?;
    let mut action = workspace_edit_value(&parsed.edit, ssh_host);
    action["action"] = json!("applyEdit");
    action["label"] = parsed.label.map_or(Value::Null, Value::String);
    Some(action)
}
