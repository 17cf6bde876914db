//! yac-lsp-bridge: a user-level daemon that mediates between editors and
//! language servers.
//!
//! Architecture:
//! ```text
//! editor(s) <-newline JSON (unix socket)-> yac-lsp-bridge <-LSP (child stdio)-> language server(s)
//! ```
//!
//! Editors speak a compact command protocol; the daemon owns the LSP
//! server lifecycles, multiplexes requests and responses between any
//! client and any server, and broadcasts server-pushed notifications to
//! every connected client. A file/symbol picker with in-process fuzzy
//! matching rides along.

pub mod daemon;
pub mod editor;
pub mod event;
pub mod framing;
pub mod fuzzy;
pub mod handlers;
pub mod lsp;
pub mod paths;
pub mod picker;
pub mod rpc;
pub mod transform;
