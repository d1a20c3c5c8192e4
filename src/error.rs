use thiserror::Error;

pub type Result<T> = std::result::Result<T, ParityError>;

#[derive(Debug, Error)]
pub enum ParityError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Two graph items canonicalized to the same synthetic key even after
    /// disambiguation. Treated as a data-integrity violation in the source
    /// schema, aborts the run.
    #[error("schema key collision on '{0}' after disambiguation")]
    SchemaCollision(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ParityError {
    pub fn config(msg: impl Into<String>) -> Self {
        ParityError::Config(msg.into())
    }
}
