use crate::QueryClass;

/// Errors that can occur while discovering the sockets of the node.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to parse {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("no cpu socket found under {path}")]
    NotFound { path: String },
}

/// Failure of a hardware operation, reported by a [`crate::Backend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend does not implement this query on this platform.
    #[error("{query} is not supported by the {backend} backend")]
    Unsupported { backend: &'static str, query: QueryClass },

    /// The file or device that this query relies on does not exist.
    #[error("not available: {path}")]
    NotAvailable { path: String },

    #[error("failed to access {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("failed to parse value from {path}: {detail}")]
    Parse { path: String, detail: String },

    /// The hardware (or the kernel) refused the request.
    #[error("request rejected with status {code}: {reason}")]
    Rejected { code: i32, reason: String },
}

impl BackendError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> BackendError {
        BackendError::Io {
            path: path.into(),
            source,
        }
    }

    /// The non-zero status code forwarded to the callers of the dispatch layer.
    pub fn status(&self) -> i32 {
        match self {
            BackendError::Io { source, .. } => source.raw_os_error().map(|e| -e).unwrap_or(-1),
            BackendError::NotAvailable { .. } => -2,
            BackendError::Unsupported { .. } => -3,
            BackendError::Parse { .. } => -4,
            BackendError::Rejected { code, .. } => *code,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The socket id is outside of `0..count`. No backend call has been made.
    #[error("invalid socket id {id}: this node has {count} socket(s)")]
    InvalidSocket { id: i32, count: usize },

    #[error("socket {socket}: {source}")]
    Backend { socket: u32, source: BackendError },

    #[error("failed to write the query output: {0}")]
    Output(#[from] std::io::Error),
}

/// `-EINVAL`
pub const INVALID_ARGUMENT: i32 = -22;

impl DispatchError {
    pub fn status(&self) -> i32 {
        match self {
            DispatchError::InvalidSocket { .. } => INVALID_ARGUMENT,
            DispatchError::Backend { source, .. } => source.status(),
            DispatchError::Output(e) => e.raw_os_error().map(|e| -e).unwrap_or(-1),
        }
    }
}
