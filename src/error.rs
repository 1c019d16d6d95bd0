use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

pub type MediaResult<T> = Result<T, MediaError>;

/// Failures from the external tools and the files they leave behind.
///
/// Handlers never expose the variant to clients; it only feeds the logs.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to start {tool}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{tool} exited with error (status={status}): {stderr_tail}")]
    Exit {
        tool: &'static str,
        status: ExitStatus,
        stderr_tail: String,
    },
    #[error("{tool} did not finish within {}s", .limit.as_secs())]
    Timeout { tool: &'static str, limit: Duration },
    #[error("i/o failure during {operation}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {tool} output")]
    Json {
        tool: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{tool} output is missing {field}")]
    MissingField { tool: &'static str, field: &'static str },
    #[error("downloaded file is unusable: {}", .path.display())]
    BadOutput { path: PathBuf },
}

impl MediaError {
    pub fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }
}
