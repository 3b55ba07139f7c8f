use std::io;

/// Failure of the shared memory primitives behind the leader election.
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("cannot create the shared segment {key:#x}: {source}")]
    Create { key: i32, source: io::Error },

    #[error("cannot attach the shared segment {key:#x}: {source}")]
    Attach { key: i32, source: io::Error },

    #[error("cannot remove the shared segment {key:#x}: {source}")]
    Remove { key: i32, source: io::Error },
}
