//! The LSP server pool.
//!
//! One [`LspClient`] per `(language, workspace_root[, ssh_host])` key,
//! spawned the first time a file needs it. The registry also interprets
//! `$/progress`: it correlates begin/report/end by token, keeps the title
//! for status-line display, and maintains per-language indexing counters
//! so overlapping tokens cannot mis-clear the indexing flag.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use lsp_types::{ProgressParams, ProgressParamsValue, WorkDoneProgress};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::event::Event;
use crate::lsp::client::LspClient;
use crate::lsp::config::{workspace_root, Languages};
use crate::paths;

/// Where a file's requests should go: the resolved server identity.
#[derive(Debug, Clone)]
pub struct Target {
    pub key: String,
    pub language: String,
    pub workspace_root: PathBuf,
    pub ssh_host: Option<String>,
    /// The file's path as the server sees it (remote path for SSH keys).
    pub server_path: String,
}

/// Outcome of interpreting one `$/progress` notification.
#[derive(Debug, Default)]
pub struct ProgressUpdate {
    /// Human-readable status line, when there is something to show.
    pub display: Option<String>,
    /// True when this notification ended the last active token anywhere.
    pub all_idle: bool,
}

pub struct Registry {
    languages: Languages,
    clients: HashMap<String, LspClient>,
    /// language → count of active progress tokens.
    indexing: HashMap<String, usize>,
    /// progress token (stringified) → title from the `begin` report.
    progress_titles: HashMap<String, String>,
}

impl Registry {
    pub fn new(languages: Languages) -> Self {
        Self {
            languages,
            clients: HashMap::new(),
            indexing: HashMap::new(),
            progress_titles: HashMap::new(),
        }
    }

    /// Resolve which server a file belongs to, without spawning.
    pub fn target_for(&self, file: &str) -> Result<Target> {
        let (ssh_host, path) = paths::split_remote(file);
        let Some(config) = self.languages.language_for_path(&path) else {
            bail!("no language server configured for {file}");
        };
        let root = if ssh_host.is_some() {
            // Remote filesystems cannot be walked for markers.
            PathBuf::from(&path)
                .parent()
                .map_or_else(|| PathBuf::from("/"), std::path::Path::to_path_buf)
        } else {
            workspace_root(std::path::Path::new(&path), &config.root_markers)
        };
        let key = match &ssh_host {
            Some(host) => format!("{}:{}@{host}", config.language_id, root.display()),
            None => format!("{}:{}", config.language_id, root.display()),
        };
        Ok(Target {
            key,
            language: config.language_id.clone(),
            workspace_root: root,
            ssh_host,
            server_path: path,
        })
    }

    /// Return the client for `target`, spawning it on first use. The bool
    /// is true when a fresh server was spawned.
    pub async fn ensure_client(
        &mut self,
        target: &Target,
        events: UnboundedSender<Event>,
    ) -> Result<(&mut LspClient, bool)> {
        if self.clients.contains_key(&target.key) {
            return Ok((self.clients.get_mut(&target.key).unwrap(), false));
        }
        let config = self
            .languages
            .get(&target.language)
            .unwrap_or_else(|| unreachable!("target resolved from this table"));
        let client = LspClient::spawn(
            config,
            target.key.clone(),
            target.workspace_root.clone(),
            target.ssh_host.clone(),
            events,
        )
        .await?;
        metrics::counter!("yac_lsp_servers_spawned").increment(1);
        self.clients.insert(target.key.clone(), client);
        Ok((self.clients.get_mut(&target.key).unwrap(), true))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut LspClient> {
        self.clients.get_mut(key)
    }

    pub fn get(&self, key: &str) -> Option<&LspClient> {
        self.clients.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<LspClient> {
        self.clients.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LspClient)> {
        self.clients.iter()
    }

    pub fn is_language_indexing(&self, language: &str) -> bool {
        self.indexing.get(language).copied().unwrap_or(0) > 0
    }

    pub fn is_any_indexing(&self) -> bool {
        self.indexing.values().any(|&count| count > 0)
    }

    /// Interpret a `$/progress` notification from the server at `key`.
    /// The key's `language:` prefix scopes the indexing counter.
    pub fn observe_progress(&mut self, key: &str, params: &Value) -> ProgressUpdate {
        let language = key.split(':').next().unwrap_or(key).to_string();
        let Ok(progress) = serde_json::from_value::<ProgressParams>(params.clone()) else {
            tracing::debug!(key = %key, "unparseable $/progress payload");
            return ProgressUpdate::default();
        };
        let token = match &progress.token {
            lsp_types::NumberOrString::Number(n) => n.to_string(),
            lsp_types::NumberOrString::String(s) => s.clone(),
        };
        let ProgressParamsValue::WorkDone(work) = progress.value;

        match work {
            WorkDoneProgress::Begin(begin) => {
                self.progress_titles.insert(token, begin.title.clone());
                *self.indexing.entry(language).or_insert(0) += 1;
                ProgressUpdate {
                    display: Some(format_progress(
                        &begin.title,
                        begin.message.as_deref(),
                        begin.percentage,
                    )),
                    all_idle: false,
                }
            }
            WorkDoneProgress::Report(report) => {
                let title = self.progress_titles.get(&token).cloned().unwrap_or_default();
                ProgressUpdate {
                    display: Some(format_progress(
                        &title,
                        report.message.as_deref(),
                        report.percentage,
                    )),
                    all_idle: false,
                }
            }
            WorkDoneProgress::End(end) => {
                let title = self.progress_titles.remove(&token).unwrap_or_default();
                let counter = self.indexing.entry(language).or_insert(0);
                *counter = counter.saturating_sub(1);
                let display = match (title.is_empty(), end.message) {
                    (false, Some(msg)) => Some(format!("{title}: {msg}")),
                    (false, None) => Some(format!("{title}: done")),
                    (true, Some(msg)) => Some(msg),
                    // End for a token this daemon never saw begin.
                    (true, None) => None,
                };
                ProgressUpdate {
                    display,
                    all_idle: !self.is_any_indexing(),
                }
            }
        }
    }

    /// Gracefully shut every server down.
    pub async fn shutdown_all(&mut self) {
        for (_, client) in self.clients.drain() {
            client.shutdown().await;
        }
        self.indexing.clear();
        self.progress_titles.clear();
    }
}

fn format_progress(title: &str, message: Option<&str>, percentage: Option<u32>) -> String {
    let mut out = title.to_string();
    if let Some(msg) = message {
        out.push_str(": ");
        out.push_str(msg);
    }
    if let Some(pct) = percentage {
        out.push_str(&format!(" ({pct}%)"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn begin(token: &str, title: &str) -> Value {
        json!({"token": token, "value": {"kind": "begin", "title": title}})
    }

    fn report(token: &str, message: &str, pct: u32) -> Value {
        json!({"token": token, "value": {"kind": "report", "message": message, "percentage": pct}})
    }

    fn end(token: &str) -> Value {
        json!({"token": token, "value": {"kind": "end"}})
    }

    #[test]
    fn target_key_includes_language_and_root() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Cargo.toml"), "[package]").unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        let file = tmp.path().join("src/main.rs");
        std::fs::write(&file, "fn main() {}").unwrap();

        let registry = Registry::new(Languages::builtin());
        let target = registry.target_for(file.to_str().unwrap()).unwrap();
        assert_eq!(target.language, "rust");
        assert_eq!(target.workspace_root, tmp.path());
        assert!(target.ssh_host.is_none());
        assert_eq!(target.key, format!("rust:{}", tmp.path().display()));
    }

    #[test]
    fn target_for_ssh_path_carries_host() {
        let registry = Registry::new(Languages::builtin());
        let target = registry.target_for("scp://dev@box//work/proj/main.go").unwrap();
        assert_eq!(target.language, "go");
        assert_eq!(target.ssh_host.as_deref(), Some("dev@box"));
        assert_eq!(target.server_path, "/work/proj/main.go");
        assert_eq!(target.workspace_root, PathBuf::from("/work/proj"));
        assert!(target.key.ends_with("@dev@box"));
    }

    #[test]
    fn target_for_unknown_extension_is_error() {
        let registry = Registry::new(Languages::builtin());
        assert!(registry.target_for("/tmp/file.xyz").is_err());
    }

    #[test]
    fn overlapping_progress_tokens_keep_indexing_set() {
        let mut registry = Registry::new(Languages::builtin());
        let key = "rust:/tmp/ws";

        let up = registry.observe_progress(key, &begin("t1", "indexing"));
        assert_eq!(up.display.as_deref(), Some("indexing"));
        registry.observe_progress(key, &begin("t2", "fetching"));
        assert!(registry.is_language_indexing("rust"));
        assert!(registry.is_any_indexing());

        let up = registry.observe_progress(key, &end("t1"));
        assert!(!up.all_idle, "t2 is still active");
        assert!(registry.is_language_indexing("rust"));

        let up = registry.observe_progress(key, &end("t2"));
        assert!(up.all_idle);
        assert!(!registry.is_language_indexing("rust"));
        assert!(!registry.is_any_indexing());
    }

    #[test]
    fn report_reuses_title_from_begin() {
        let mut registry = Registry::new(Languages::builtin());
        let key = "rust:/tmp/ws";
        registry.observe_progress(key, &begin("t", "indexing"));
        let up = registry.observe_progress(key, &report("t", "3/10 crates", 30));
        assert_eq!(up.display.as_deref(), Some("indexing: 3/10 crates (30%)"));
    }

    #[test]
    fn end_without_message_says_done() {
        let mut registry = Registry::new(Languages::builtin());
        let key = "go:/tmp/ws";
        registry.observe_progress(key, &begin("t", "loading packages"));
        let up = registry.observe_progress(key, &end("t"));
        assert_eq!(up.display.as_deref(), Some("loading packages: done"));
    }

    #[test]
    fn indexing_counters_are_per_language() {
        let mut registry = Registry::new(Languages::builtin());
        registry.observe_progress("rust:/a", &begin("t1", "indexing"));
        assert!(registry.is_language_indexing("rust"));
        assert!(!registry.is_language_indexing("go"));
        registry.observe_progress("rust:/a", &end("t1"));
        assert!(!registry.is_any_indexing());
    }

    #[test]
    fn format_progress_variants() {
        assert_eq!(format_progress("indexing", None, None), "indexing");
        assert_eq!(
            format_progress("indexing", Some("3/10 crates"), Some(30)),
            "indexing: 3/10 crates (30%)"
        );
    }
}
