//! # chatlink-core
//!
//! Session-establishment logic for a chat client that talks to a REST
//! auth API, a token/conversation backend and a hosted messaging platform.
//!
//! This crate is framework-agnostic and can be used by:
//! - The `chatlink` terminal client
//! - Any UI that renders messages and connection state
//!
//! ## Key Concepts
//!
//! - **Credential**: bearer string issued at login, persisted by the credential store
//! - **SessionToken**: short-lived token for the messaging platform client
//! - **Identity**: the participant name that counts as "me"
//! - **LiveSession**: a connected client bound to one conversation

pub mod auth;
pub mod backend;
pub mod config;
pub mod credential;
pub mod error;
pub mod event_bus;
pub mod identity;
pub mod logging;
pub mod message;
pub mod paths;
pub mod platform;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod types;
pub mod workflow;

mod http;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use auth::{AuthClient, AuthError};
pub use backend::{SessionTokenExchange, TokenError, TokenGrant};
pub use config::ChatConfig;
pub use credential::{Credential, CredentialStore};
pub use error::{Error, Result};
pub use identity::{IdentityReconciler, MessageView};
pub use message::{Message, MessageMetadata, Origin};
pub use platform::ConnectionState;
pub use resolver::{ConversationResolver, ConversationTarget, ResolveError};
pub use session::{ConnectError, LiveSession, SendError, SessionEvent};
pub use types::{ConversationSid, Identity, SessionToken, UserId};
pub use workflow::ChatWorkflow;
