use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("campaign has no eligible contacts")]
    InsufficientContacts,

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("malformed webhook payload: {0}")]
    MalformedWebhook(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
