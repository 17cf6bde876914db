//! Socket, log-file, and URI path handling.
//!
//! The daemon's filesystem surface is small: one Unix socket, one log file
//! per daemon process. Everything else here is the `file://` boundary
//! where local paths become URIs for LSP servers and come back out again,
//! including the `scp://host/path` rewriting for SSH-reachable workspaces.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::net::UnixListener;

/// Bytes escaped when a filesystem path is embedded in a `file://` URI.
/// `/` stays literal so the path structure survives.
const URI_PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Resolve the daemon's socket path.
///
/// `$XDG_RUNTIME_DIR/yac-lsp-bridge.sock`, falling back to
/// `/tmp/yac-lsp-bridge-$USER.sock`, then `/tmp/yac-lsp-bridge.sock`.
pub fn socket_path() -> PathBuf {
    if let Some(dir) = directories::BaseDirs::new().and_then(|d| d.runtime_dir().map(Path::to_path_buf)) {
        return dir.join("yac-lsp-bridge.sock");
    }
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return PathBuf::from(format!("/tmp/yac-lsp-bridge-{user}.sock"));
        }
    }
    PathBuf::from("/tmp/yac-lsp-bridge.sock")
}

/// Per-daemon log file path, derived from the PID.
pub fn log_path() -> PathBuf {
    std::env::temp_dir().join(format!("yac-lsp-bridge-{}.log", std::process::id()))
}

/// Bind the daemon socket, refusing to start when a previous daemon is
/// already listening and removing a stale socket file when it is not.
pub fn claim_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => bail!("another daemon is already listening on {}", path.display()),
            Err(_) => {
                tracing::info!("removing stale socket {}", path.display());
                std::fs::remove_file(path)
                    .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
            }
        }
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).context("failed to set socket permissions")?;
    }
    Ok(listener)
}

/// Split an editor-facing path into its optional SSH host and the plain
/// filesystem path. `scp://user@host//tmp/a.rs` → `(Some("user@host"), "/tmp/a.rs")`.
pub fn split_remote(file: &str) -> (Option<String>, String) {
    let Some(rest) = file.strip_prefix("scp://") else {
        return (None, file.to_string());
    };
    match rest.find('/') {
        Some(idx) => {
            let host = &rest[..idx];
            // netrw writes absolute remote paths with a double slash;
            // collapse the separator so the server sees one `/abs` path.
            let path = format!("/{}", rest[idx..].trim_start_matches('/'));
            (Some(host.to_string()), path)
        }
        None => (Some(rest.to_string()), String::from("/")),
    }
}

/// Create a `file://` URI from an absolute filesystem path.
pub fn file_uri(path: &str) -> Result<String> {
    if !Path::new(path).is_absolute() {
        bail!("invalid absolute file path for URI: {path}");
    }
    Ok(format!("file://{}", utf8_percent_encode(path, URI_PATH_ESCAPE)))
}

/// URI for an editor-facing file path, rewriting `scp://` paths to plain
/// `file://` URIs toward the (remote) server. Returns the URI and the SSH
/// host the path carried, if any.
pub fn uri_for_editor_path(file: &str) -> Result<(String, Option<String>)> {
    let (host, path) = split_remote(file);
    let uri = file_uri(&path)?;
    Ok((uri, host))
}

/// Extract a filesystem path from a `file://` URI string.
pub fn uri_to_path(uri: &str) -> String {
    let stripped = uri.strip_prefix("file://").unwrap_or(uri);
    percent_decode_str(stripped)
        .decode_utf8()
        .map_or_else(|_| stripped.to_string(), |s| s.into_owned())
}

/// Map a server-side URI back to the editor's view of the file: plain path
/// for local workspaces, `scp://host//path` (netrw's absolute-path double
/// slash) when the request came from an SSH-reachable one.
pub fn uri_to_editor_path(uri: &str, ssh_host: Option<&str>) -> String {
    let path = uri_to_path(uri);
    match ssh_host {
        Some(host) => format!("scp://{host}/{path}"),
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_uri_absolute_path() {
        assert_eq!(file_uri("/tmp/test.rs").unwrap(), "file:///tmp/test.rs");
    }

    #[test]
    fn file_uri_percent_encodes_spaces() {
        assert_eq!(
            file_uri("/tmp/space file.rs").unwrap(),
            "file:///tmp/space%20file.rs"
        );
    }

    #[test]
    fn file_uri_rejects_relative() {
        assert!(file_uri("relative/path.rs").is_err());
    }

    #[test]
    fn uri_to_path_round_trip() {
        let uri = file_uri("/tmp/test.rs").unwrap();
        assert_eq!(uri_to_path(&uri), "/tmp/test.rs");
    }

    #[test]
    fn uri_to_path_decodes_percent_encoding() {
        assert_eq!(uri_to_path("file:///tmp/space%20file.rs"), "/tmp/space file.rs");
    }

    #[test]
    fn split_remote_plain_path() {
        assert_eq!(split_remote("/tmp/a.rs"), (None, "/tmp/a.rs".to_string()));
    }

    #[test]
    fn split_remote_scp_path() {
        let (host, path) = split_remote("scp://user@box//home/u/src/a.rs");
        assert_eq!(host.as_deref(), Some("user@box"));
        assert_eq!(path, "/home/u/src/a.rs");
    }

    #[test]
    fn editor_path_round_trip_over_ssh() {
        let (uri, host) = uri_for_editor_path("scp://box//tmp/a.rs").unwrap();
        assert_eq!(uri, "file:///tmp/a.rs");
        assert_eq!(
            uri_to_editor_path(&uri, host.as_deref()),
            "scp://box//tmp/a.rs"
        );
    }

    #[test]
    fn socket_path_has_expected_name() {
        let path = socket_path();
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("yac-lsp-bridge"));
        assert!(name.ends_with(".sock"));
    }
}
