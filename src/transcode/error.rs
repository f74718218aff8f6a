use std::fmt;

use thiserror::Error;

/// Failure of one transcode attempt. Every variant is reported to the queue
/// as an attempt failure; the retry policy decides what happens next.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("encoder toolchain unavailable: {0}")]
    ToolchainUnavailable(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder failed (exit code {}): {}", display_code(.exit_code), .stderr.trim())]
    EncodingFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("incomplete output: {0}")]
    IncompleteOutput(String),

    #[error("corrupt key file: {0}")]
    CorruptKey(String),

    #[error("lesson {0} not found")]
    NotFound(i64),

    #[error("record store error: {0:#}")]
    Store(anyhow::Error),
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl TranscodeError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::ToolchainUnavailable(_) => ErrorKind::ToolchainUnavailable,
            Self::Io { .. } => ErrorKind::Io,
            Self::EncodingFailed { .. } => ErrorKind::EncodingFailed,
            Self::IncompleteOutput(_) => ErrorKind::IncompleteOutput,
            Self::CorruptKey(_) => ErrorKind::CorruptKey,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::Store,
        }
    }
}

/// Tag used in structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    ToolchainUnavailable,
    Io,
    EncodingFailed,
    IncompleteOutput,
    CorruptKey,
    NotFound,
    Store,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ToolchainUnavailable => "toolchain_unavailable",
            ErrorKind::Io => "io",
            ErrorKind::EncodingFailed => "encoding_failed",
            ErrorKind::IncompleteOutput => "incomplete_output",
            ErrorKind::CorruptKey => "corrupt_key",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Store => "store",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
