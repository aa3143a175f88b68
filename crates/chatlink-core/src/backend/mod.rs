//! Clients for the chat backend: session tokens and conversation management.

mod conversation;
mod token;

pub use conversation::{
    ConversationApi, ConversationApiError, ConversationBackend, ParticipantOutcome,
};
pub use token::{SessionTokenExchange, StoredCredentialTokens, TokenError, TokenGrant, TokenSource};
