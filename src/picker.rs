//! The file/symbol picker.
//!
//! `picker_open` spawns an external file enumerator (`fd`, falling back
//! to `find`) and streams its output into an in-memory file list; queries
//! fuzzy-match against that list. Symbol modes (`#` workspace, `@`
//! document) route through the LSP side instead; the picker only
//! remembers which request is current so a superseded response can be
//! dropped on arrival.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;

use crate::event::Event;
use crate::fuzzy;

/// Lines batched per event while streaming the enumerator's output.
const LINE_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickerMode {
    File,
    WorkspaceSymbol,
    DocumentSymbol,
}

impl PickerMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "file" => Some(Self::File),
            "workspace_symbol" => Some(Self::WorkspaceSymbol),
            "document_symbol" => Some(Self::DocumentSymbol),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::WorkspaceSymbol => "workspace_symbol",
            Self::DocumentSymbol => "document_symbol",
        }
    }
}

/// Singleton picker state: `scanning` until the enumerator finishes,
/// `ready` afterwards. Closed state is the daemon holding `None`.
pub struct Picker {
    pub generation: u64,
    child: Option<Child>,
    pub files: Vec<String>,
    pub recent: Vec<String>,
    pub query: String,
    pub scanning: bool,
    /// In-flight symbol request: `(server key, lsp request id)`. A newer
    /// query replaces this, and the stale response is dropped on arrival.
    pub inflight_symbol: Option<(String, i64)>,
}

impl Picker {
    /// Spawn the enumerator in `cwd` and start streaming its output.
    pub fn open(
        cwd: &str,
        recent: Vec<String>,
        generation: u64,
        events: UnboundedSender<Event>,
    ) -> Result<Self> {
        let mut cmd = enumerator_command(cwd)?;
        let mut child = cmd
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn file enumerator")?;
        let stdout = child.stdout.take().context("no stdout on enumerator")?;
        tokio::spawn(read_file_list(stdout, generation, events));
        Ok(Self {
            generation,
            child: Some(child),
            files: Vec::new(),
            recent,
            query: String::new(),
            scanning: true,
            inflight_symbol: None,
        })
    }

    /// Absorb one batch of enumerator output, ignoring batches from a
    /// previous picker incarnation.
    pub fn absorb(&mut self, generation: u64, lines: Vec<String>) {
        if generation == self.generation {
            self.files.extend(lines);
        }
    }

    pub fn finish_scan(&mut self, generation: u64) {
        if generation == self.generation {
            self.scanning = false;
            tracing::debug!("picker scan complete: {} files", self.files.len());
        }
    }

    /// File-mode query: recent files first on an empty query, fuzzy-ranked
    /// matches otherwise. Never more than [`fuzzy::MAX_RESULTS`] items.
    pub fn file_items(&self, query: &str) -> Vec<Value> {
        if query.is_empty() {
            return self
                .recent
                .iter()
                .chain(self.files.iter())
                .take(fuzzy::MAX_RESULTS)
                .map(|f| json!(f))
                .collect();
        }
        fuzzy::rank(query, &self.files)
            .into_iter()
            .map(|idx| json!(self.files[idx]))
            .collect()
    }

    /// Reap the enumerator and release buffers.
    pub async fn close(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}

/// `fd --type f --color never`, or `find . -type f -not -path '*/.git/*'`
/// when `fd` is not installed.
fn enumerator_command(cwd: &str) -> Result<Command> {
    if let Ok(fd) = which::which("fd") {
        let mut cmd = Command::new(fd);
        cmd.args(["--type", "f", "--color", "never"]).current_dir(cwd);
        return Ok(cmd);
    }
    let find = which::which("find").context("neither fd nor find is installed")?;
    let mut cmd = Command::new(find);
    cmd.args([".", "-type", "f", "-not", "-path", "*/.git/*"])
        .current_dir(cwd);
    Ok(cmd)
}

async fn read_file_list(
    stdout: tokio::process::ChildStdout,
    generation: u64,
    events: UnboundedSender<Event>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut batch = Vec::with_capacity(LINE_BATCH);
    while let Ok(Some(line)) = lines.next_line().await {
        // find's relative output keeps a "./" prefix; normalize it away.
        let line = line.strip_prefix("./").unwrap_or(&line).to_string();
        batch.push(line);
        if batch.len() == LINE_BATCH {
            if events
                .send(Event::PickerLines { generation, lines: std::mem::take(&mut batch) })
                .is_err()
            {
                return;
            }
            batch.reserve(LINE_BATCH);
        }
    }
    if !batch.is_empty() {
        let _ = events.send(Event::PickerLines { generation, lines: batch });
    }
    let _ = events.send(Event::PickerDone { generation });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picker_with_files(files: &[&str], recent: &[&str]) -> Picker {
        Picker {
            generation: 1,
            child: None,
            files: files.iter().map(ToString::to_string).collect(),
            recent: recent.iter().map(ToString::to_string).collect(),
            query: String::new(),
            scanning: false,
            inflight_symbol: None,
        }
    }

    #[test]
    fn mode_parse_round_trip() {
        for mode in ["file", "workspace_symbol", "document_symbol"] {
            assert_eq!(PickerMode::parse(mode).unwrap().as_str(), mode);
        }
        assert!(PickerMode::parse("buffers").is_none());
    }

    #[test]
    fn empty_query_returns_recent_first() {
        let picker = picker_with_files(&["src/main.rs", "src/lib.rs"], &["/p/a", "/p/b"]);
        let items = picker.file_items("");
        assert_eq!(items[0], "/p/a");
        assert_eq!(items[1], "/p/b");
        assert_eq!(items[2], "src/main.rs");
    }

    #[test]
    fn query_ranks_and_filters() {
        let picker = picker_with_files(&["src/main.rs", "Makefile", "docs/notes.txt"], &[]);
        let items = picker.file_items("ma");
        assert!(items.contains(&json!("src/main.rs")));
        assert!(items.contains(&json!("Makefile")));
        assert!(!items.contains(&json!("docs/notes.txt")));
    }

    #[test]
    fn results_never_exceed_cap() {
        let files: Vec<String> = (0..500).map(|i| format!("src/file_{i:04}.rs")).collect();
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();
        let picker = picker_with_files(&refs, &[]);
        assert!(picker.file_items("file").len() <= fuzzy::MAX_RESULTS);
        assert!(picker.file_items("").len() <= fuzzy::MAX_RESULTS);
    }

    #[test]
    fn stale_generation_batches_are_ignored() {
        let mut picker = picker_with_files(&[], &[]);
        picker.scanning = true;
        picker.absorb(0, vec!["old.rs".into()]);
        assert!(picker.files.is_empty());
        picker.absorb(1, vec!["new.rs".into()]);
        assert_eq!(picker.files, vec!["new.rs"]);
        picker.finish_scan(0);
        assert!(picker.scanning);
        picker.finish_scan(1);
        assert!(!picker.scanning);
    }
}
