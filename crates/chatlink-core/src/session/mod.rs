//! Live Session: one connected platform client bound to one conversation.

mod live;
mod state;

pub use live::LiveSession;
pub use state::SessionState;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::backend::TokenSource;
use crate::logging::{self, LogHandle};
use crate::message::Message;
use crate::platform::{ConnectionState, PlatformError};
use crate::resolver::ResolveError;
use crate::retry::RetryPolicy;
use crate::types::Identity;

/// What subscribers of a live session observe.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionState(ConnectionState),
    MessageAdded { message: Message, is_mine: bool },
    MessageUpdated { message: Message, is_mine: bool },
    /// The session token can no longer be renewed; the user must log in again.
    ReauthRequired { reason: String },
    TokenRefreshed,
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("A session token is required to connect")]
    MissingToken,

    #[error("Failed to create messaging client: {0}")]
    Client(PlatformError),

    #[error("Connection denied. The session token was rejected; request a new token or log in again.")]
    Denied,

    #[error("Connection lost while connecting. Check your network and try again.")]
    Disconnected,

    #[error("Connection timeout: the client did not connect within {secs} seconds")]
    Timeout { secs: u64 },

    #[error(transparent)]
    Conversation(#[from] ResolveError),

    #[error("Failed to load conversation history: {0}")]
    History(PlatformError),
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Message body is empty")]
    EmptyBody,

    #[error("Not connected to a conversation")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    Failed(PlatformError),
}

/// Tunables for [`LiveSession::connect`].
#[derive(Clone)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub fetch: RetryPolicy,
    /// Identity supplied by the backend, if known.
    pub identity: Option<Identity>,
    pub token_source: Option<Arc<dyn TokenSource>>,
    pub transcript: LogHandle,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            fetch: RetryPolicy::default(),
            identity: None,
            token_source: None,
            transcript: logging::disabled(),
        }
    }
}
