/// Errors raised while validating problems, configuring engines or running trials.
#[derive(Debug, thiserror::Error)]
pub enum HyperError {
    #[error("index '{label}' has no entry in the size dict")]
    MissingSize { label: String },

    #[error("index '{label}' has invalid dimension size {size}")]
    InvalidSize { label: String, size: u64 },

    #[error("output index '{label}' does not appear on any input")]
    OrphanOutputIndex { label: String },

    #[error("contraction has no inputs")]
    EmptyProblem,

    #[error("unknown path finding method '{0}'")]
    UnknownMethod(String),

    #[error("invalid value for parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("invalid contraction path: {0}")]
    InvalidPath(String),

    #[error("optimizer was already used for a different contraction")]
    ProblemMismatch,

    #[error("no trials have been run yet")]
    NoTrials,

    #[error("trial failed on worker: {0}")]
    WorkerFailed(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Convenience alias for `Result<T, HyperError>`.
pub type Result<T> = std::result::Result<T, HyperError>;
