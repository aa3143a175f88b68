//! Boundary to the hosted messaging platform.
//!
//! The platform SDK's callback registrations become broadcast
//! subscriptions: a receiver obtained before the first `.await` sees every
//! event emitted after that point, so no transition is missed.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::message::Message;
use crate::types::{ConversationSid, SessionToken};

/// Connection lifecycle as reported by the platform client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Denied,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Denied => "denied",
        };
        f.write_str(name)
    }
}

/// Client-level notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    TokenAboutToExpire,
    TokenExpired,
}

/// Conversation-level notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    MessageAdded(Message),
    MessageUpdated(Message),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("Conversation not found: {0}")]
    NotFound(ConversationSid),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Client has been shut down")]
    ShutDown,
}

pub type Subscription<E> = broadcast::Receiver<E>;

/// Builds platform clients from session tokens.
pub trait PlatformConnector: Send + Sync {
    /// Create a client. Connecting starts immediately; watch its events.
    fn create_client(&self, token: &SessionToken) -> Result<Arc<dyn PlatformClient>, PlatformError>;
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    fn subscribe(&self) -> Subscription<ClientEvent>;

    /// Conversations this client is already subscribed to, in platform order.
    async fn subscribed_conversations(
        &self,
    ) -> Result<Vec<Arc<dyn PlatformConversation>>, PlatformError>;

    async fn conversation_by_sid(
        &self,
        sid: &ConversationSid,
    ) -> Result<Arc<dyn PlatformConversation>, PlatformError>;

    async fn update_token(&self, token: &SessionToken) -> Result<(), PlatformError>;

    /// Release the connection. Synchronous so it can run from `Drop`.
    fn shutdown(&self);
}

#[async_trait]
pub trait PlatformConversation: Send + Sync {
    fn sid(&self) -> ConversationSid;

    fn subscribe(&self) -> Subscription<ConversationEvent>;

    async fn attributes(&self) -> Result<Value, PlatformError>;

    /// History in arrival order.
    async fn messages(&self) -> Result<Vec<Message>, PlatformError>;

    async fn send_message(&self, body: &str, attributes: Value) -> Result<(), PlatformError>;
}
