use thiserror::Error;

/// Failures raised by the persistent store.
///
/// Every variant aborts the enclosing transaction; callers may retry it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite reported an I/O, locking or constraint failure.
    #[error("store failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The environment directory could not be created or accessed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A thread panicked while holding the writer connection.
    #[error("store writer lock poisoned")]
    Poisoned,

    /// A stored value could not be interpreted.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Library error type for polaroid operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// YAML/serde configuration error.
    #[error(transparent)]
    Config(#[from] serde_yaml::Error),

    /// A directory handed to the core is missing or not a directory.
    #[error("invalid photo directory: {0}")]
    BadDir(String),

    /// The selection actor has been closed or went away mid-request.
    #[error("photo selector is closed")]
    SelectorClosed,

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
