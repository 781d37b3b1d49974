use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoraError {
    #[error("myLeviton rejected the credentials")]
    InvalidAuth,

    #[error("not logged in to myLeviton")]
    NotAuthenticated,

    #[error("myLeviton returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DecoraError {
    /// Whether a fresh login might fix the failure
    pub fn is_auth_error(&self) -> bool {
        match self {
            DecoraError::InvalidAuth | DecoraError::NotAuthenticated => true,
            DecoraError::Status { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }
}

pub type DecoraResult<T> = Result<T, DecoraError>;
