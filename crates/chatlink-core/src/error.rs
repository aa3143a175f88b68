//! Crate-wide error for the end-to-end chat workflow.

use thiserror::Error;

use crate::auth::AuthError;
use crate::backend::TokenError;
use crate::config::ConfigError;
use crate::credential::StoreError;
use crate::resolver::ResolveError;
use crate::session::{ConnectError, SendError};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),
}

impl Error {
    /// Whether retrying the same user action may succeed without changing
    /// credentials or configuration.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Config(_) | Error::Store(_) => false,
            Error::Auth(e) => matches!(e, AuthError::Network(_) | AuthError::Service(_)),
            Error::Token(e) => matches!(e, TokenError::Network(_)),
            Error::Resolve(e) => resolve_is_retryable(e),
            Error::Connect(e) => match e {
                ConnectError::Timeout { .. }
                | ConnectError::Disconnected
                | ConnectError::History(_) => true,
                ConnectError::Conversation(e) => resolve_is_retryable(e),
                ConnectError::MissingToken | ConnectError::Client(_) | ConnectError::Denied => {
                    false
                }
            },
            Error::Send(e) => matches!(e, SendError::Failed(_)),
        }
    }
}

fn resolve_is_retryable(error: &ResolveError) -> bool {
    matches!(
        error,
        ResolveError::ConversationNotFound { .. }
            | ResolveError::NoConversationAvailable
            | ResolveError::Listing(_)
    )
}

pub type Result<T> = std::result::Result<T, Error>;
