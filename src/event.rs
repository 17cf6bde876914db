//! Events flowing into the daemon loop.
//!
//! Every file descriptor the daemon watches is drained by a small reader
//! task that forwards decoded units over one mpsc channel. The loop task
//! owns all daemon state and is the only mutator, so per-source ordering
//! is the channel's FIFO ordering.

use serde_json::Value;

/// Monotonic id for a connected editor, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

#[derive(Debug)]
pub enum Event {
    /// One newline-terminated line from an editor client.
    ClientLine { client: ClientId, line: String },
    /// Editor socket hit EOF or a read error.
    ClientClosed { client: ClientId },
    /// One decoded frame from a language server's stdout.
    LspMessage { key: String, payload: Value },
    /// Language server stdout closed (crash or exit).
    LspClosed { key: String },
    /// Language server stream cannot be resynced (e.g. oversized frame).
    LspUnrecoverable { key: String, reason: String },
    /// A batch of file paths from the picker's enumerator.
    PickerLines { generation: u64, lines: Vec<String> },
    /// The picker's enumerator finished.
    PickerDone { generation: u64 },
}
