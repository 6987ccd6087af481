use crate::phase::Phase;

/// Errors surfaced by the store, the change feed and the coder registry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not_found: {collection}/{name}")]
    NotFound { collection: String, name: String },
    #[error("already_exists: {collection}/{name}")]
    AlreadyExists { collection: String, name: String },
    #[error("kind not registered: {0}")]
    Unregistered(String),
    #[error("kind mismatch: document is {stored}, decoder expects {requested}")]
    KindMismatch { stored: String, requested: String },
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("invalid phase transition for {kind}: {from} -> {to}")]
    InvalidTransition { kind: String, from: Phase, to: Phase },
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("backend: {0}")]
    Backend(String),
    #[error("change feed lagged: position {position} was compacted away")]
    FeedLagged { position: u64 },
    #[error("closed")]
    Closed,
}

impl Error {
    pub fn not_found(collection: &str, name: &str) -> Self {
        Error::NotFound { collection: collection.to_string(), name: name.to_string() }
    }

    /// True for the "absent object" sentinel, as opposed to backend failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
