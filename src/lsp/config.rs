//! Language-server configuration.
//!
//! A built-in table maps file extensions to languages and languages to
//! server command lines, workspace-root markers, and initialization
//! options. Users may override or extend the table from
//! `$XDG_CONFIG_HOME/yac-lsp-bridge/languages.toml`:
//!
//! ```toml
//! [languages.rust]
//! command = "rust-analyzer"
//! root-markers = ["Cargo.toml"]
//!
//! [languages.rust.initialization-options]
//! cargo = { features = "all" }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// One language's server configuration.
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    pub language_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub extensions: Vec<String>,
    pub root_markers: Vec<String>,
    pub initialization_options: Option<Value>,
}

impl LanguageConfig {
    fn new(
        language_id: &str,
        command: &str,
        args: &[&str],
        extensions: &[&str],
        root_markers: &[&str],
    ) -> Self {
        Self {
            language_id: language_id.to_string(),
            command: command.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            extensions: extensions.iter().map(ToString::to_string).collect(),
            root_markers: root_markers.iter().map(ToString::to_string).collect(),
            initialization_options: None,
        }
    }
}

/// User override entry, deserialized from `languages.toml`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct LanguageOverride {
    command: Option<String>,
    args: Option<Vec<String>>,
    extensions: Option<Vec<String>>,
    root_markers: Option<Vec<String>>,
    initialization_options: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
struct OverrideFile {
    #[serde(default)]
    languages: HashMap<String, LanguageOverride>,
}

/// The full language table with an extension index.
#[derive(Debug)]
pub struct Languages {
    by_id: HashMap<String, LanguageConfig>,
    by_extension: HashMap<String, String>,
}

impl Languages {
    /// Built-in defaults for common languages.
    pub fn builtin() -> Self {
        let configs = vec![
            LanguageConfig::new("rust", "rust-analyzer", &[], &["rs"], &["Cargo.toml"]),
            LanguageConfig::new("go", "gopls", &[], &["go"], &["go.mod"]),
            LanguageConfig::new(
                "typescript",
                "typescript-language-server",
                &["--stdio"],
                &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
                &["package.json", "tsconfig.json"],
            ),
            LanguageConfig::new(
                "python",
                "pyright-langserver",
                &["--stdio"],
                &["py", "pyi"],
                &["pyproject.toml", "setup.py", "requirements.txt"],
            ),
            LanguageConfig::new(
                "c",
                "clangd",
                &[],
                &["c", "h", "cpp", "cc", "cxx", "hpp"],
                &["compile_commands.json", "Makefile"],
            ),
            LanguageConfig::new("zig", "zls", &[], &["zig"], &["build.zig"]),
            LanguageConfig::new(
                "lua",
                "lua-language-server",
                &[],
                &["lua"],
                &[".luarc.json"],
            ),
            LanguageConfig::new("toml", "taplo", &["lsp", "stdio"], &["toml"], &[]),
            LanguageConfig::new(
                "json",
                "vscode-json-language-server",
                &["--stdio"],
                &["json", "jsonc"],
                &[],
            ),
            LanguageConfig::new(
                "markdown",
                "marksman",
                &["server"],
                &["md", "markdown"],
                &[],
            ),
            LanguageConfig::new(
                "bash",
                "bash-language-server",
                &["start"],
                &["sh", "bash"],
                &[],
            ),
        ];

        let mut table = Self {
            by_id: HashMap::new(),
            by_extension: HashMap::new(),
        };
        for config in configs {
            table.insert(config);
        }
        table
    }

    /// Built-in table plus the user override file, if present.
    pub fn load() -> Self {
        let mut table = Self::builtin();
        if let Some(path) = override_path() {
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    if let Err(e) = table.apply_overrides(&text) {
                        tracing::warn!("ignoring {}: {e:#}", path.display());
                    } else {
                        tracing::info!("applied language overrides from {}", path.display());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("failed to read {}: {e}", path.display()),
            }
        }
        table
    }

    fn insert(&mut self, config: LanguageConfig) {
        for ext in &config.extensions {
            self.by_extension
                .insert(ext.clone(), config.language_id.clone());
        }
        self.by_id.insert(config.language_id.clone(), config);
    }

    /// Merge a TOML override document into the table.
    pub fn apply_overrides(&mut self, text: &str) -> Result<()> {
        let parsed: OverrideFile = toml::from_str(text).context("invalid languages.toml")?;
        for (language_id, over) in parsed.languages {
            let mut config = self.by_id.remove(&language_id).unwrap_or_else(|| {
                LanguageConfig::new(&language_id, &language_id, &[], &[], &[])
            });
            if let Some(command) = over.command {
                config.command = command;
            }
            if let Some(args) = over.args {
                config.args = args;
            }
            if let Some(extensions) = over.extensions {
                config.extensions = extensions;
            }
            if let Some(markers) = over.root_markers {
                config.root_markers = markers;
            }
            if let Some(options) = over.initialization_options {
                let json = serde_json::to_value(options)
                    .context("initialization-options is not valid JSON")?;
                config.initialization_options = Some(json);
            }
            self.insert(config);
        }
        Ok(())
    }

    pub fn language_for_path(&self, path: &str) -> Option<&LanguageConfig> {
        let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        let id = self.by_extension.get(&ext)?;
        self.by_id.get(id)
    }

    pub fn get(&self, language_id: &str) -> Option<&LanguageConfig> {
        self.by_id.get(language_id)
    }
}

fn override_path() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "yac-lsp-bridge")?;
    Some(dirs.config_dir().join("languages.toml"))
}

/// Find the workspace root for `file`: the nearest ancestor containing one
/// of the language's markers or `.git`, falling back to the file's
/// directory.
pub fn workspace_root(file: &Path, markers: &[String]) -> PathBuf {
    let start = file.parent().unwrap_or(file);
    for dir in start.ancestors() {
        for marker in markers {
            if dir.join(marker).exists() {
                return dir.to_path_buf();
            }
        }
        if dir.join(".git").exists() {
            return dir.to_path_buf();
        }
    }
    start.to_path_buf()
}
