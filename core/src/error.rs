use std::io;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, SableErr>;

#[derive(Error, Debug)]
pub enum SableErr {
    /// A second turn was issued while one was already running on the session.
    #[error("session is busy with another turn")]
    SessionBusy,

    /// The router needed consent but no approver was attached to the context.
    #[error("approval required for `{command}` but no approver is available")]
    ApprovalRequired { command: String },

    /// The user denied, cancelled, or EOF'd an approval prompt.
    #[error("approval aborted: {reason}")]
    ApprovalAborted { reason: String },

    /// An explicitly requested sandbox type cannot exist on this platform.
    #[error("sandbox type `{requested}` is not supported on {platform}")]
    SandboxUnsupported {
        requested: String,
        platform: &'static str,
    },

    /// No sandbox candidate probed healthy; the router degrades to host.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// Sandboxed command exceeded its wall-clock budget.
    #[error("sandbox command timed out after {0:?}")]
    SandboxCommandTimeout(Duration),

    /// Sandboxed command produced no output for longer than the idle budget.
    #[error("sandbox command idle for {0:?}, killed")]
    SandboxIdleTimeout(Duration),

    #[error("host command timed out after {0:?}")]
    HostCommandTimeout(Duration),

    #[error("host command idle for {0:?}, killed")]
    HostIdleTimeout(Duration),

    /// Provider returned an HTTP status >= 300 after retries were exhausted.
    #[error("provider returned status {0}: {1}")]
    ProviderHttp(StatusCode, String),

    /// A streamed or non-streamed provider payload failed to decode.
    #[error("provider payload could not be decoded: {0}")]
    ProviderDecode(String),

    /// The SSE stream disconnected after the handshake but before the final
    /// chunk. Retryable; optionally carries a provider-requested delay.
    #[error("stream disconnected before completion: {0}")]
    Stream(String, Option<Duration>),

    /// Retry limit exceeded while talking to the provider.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    /// Event store failed to persist an append.
    #[error("event store write failed: {0}")]
    StoreWrite(String),

    /// The submission loop died unexpectedly.
    #[error("internal error; run loop died unexpectedly")]
    InternalRunLoopDied,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl SableErr {
    /// Stable machine-readable code surfaced in lifecycle events and tool
    /// error results.
    pub fn code(&self) -> &'static str {
        match self {
            SableErr::SessionBusy => "SessionBusy",
            SableErr::ApprovalRequired { .. } => "ApprovalRequired",
            SableErr::ApprovalAborted { .. } => "ApprovalAborted",
            SableErr::SandboxUnsupported { .. } => "SandboxUnsupported",
            SableErr::SandboxUnavailable(_) => "SandboxUnavailable",
            SableErr::SandboxCommandTimeout(_) => "SandboxCommandTimeout",
            SableErr::SandboxIdleTimeout(_) => "SandboxIdleTimeout",
            SableErr::HostCommandTimeout(_) => "HostCommandTimeout",
            SableErr::HostIdleTimeout(_) => "HostIdleTimeout",
            SableErr::ProviderHttp(..) | SableErr::RetryLimit(_) => "ProviderHTTP",
            SableErr::ProviderDecode(_) | SableErr::Stream(..) => "ProviderDecode",
            SableErr::StoreWrite(_) => "StoreWrite",
            SableErr::InternalRunLoopDied => "Internal",
            SableErr::Io(_) => "Io",
            SableErr::Reqwest(_) => "ProviderHTTP",
            SableErr::Json(_) => "Json",
            SableErr::TokioJoin(_) => "Internal",
        }
    }

    /// Tool-level errors are folded into a tool-response event so the model
    /// can react; everything else aborts the turn.
    pub fn is_tool_level(&self) -> bool {
        matches!(
            self,
            SableErr::SandboxCommandTimeout(_)
                | SableErr::SandboxIdleTimeout(_)
                | SableErr::HostCommandTimeout(_)
                | SableErr::HostIdleTimeout(_)
        )
    }
}
