//! Session Token Exchange: stored credential in, messaging-session token out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::credential::{Credential, CredentialStore};
use crate::http::{self, HttpReply};
use crate::types::{Identity, SessionToken, UserId};

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Please login first - authentication token not found")]
    Unauthenticated,

    /// Non-2xx from the backend, composed from its `error`, `details` and `hint`.
    #[error("{0}")]
    IssuanceFailed(String),

    #[error("Backend did not return identity")]
    IdentityMissing,

    #[error("Network error while requesting session token: {0}")]
    Network(String),
}

/// What the backend hands back for a credential.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub token: SessionToken,
    pub identity: Identity,
    pub user_id: Option<UserId>,
}

impl TokenGrant {
    /// The user reference for conversation creation, falling back to the identity.
    pub fn owner(&self) -> UserId {
        self.user_id
            .clone()
            .unwrap_or_else(|| UserId::new(self.identity.as_str()))
    }
}

pub struct SessionTokenExchange {
    base_url: String,
    agent: ureq::Agent,
}

impl SessionTokenExchange {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            agent: http::agent(timeout),
        }
    }

    /// `GET {backend}/api/twilio/token[?identity=]`.
    ///
    /// An absent credential fails before any request is made. `identity` is
    /// optional; the backend resolves it from the credential otherwise.
    pub async fn request_session_token(
        &self,
        credential: Option<&Credential>,
        identity: Option<&Identity>,
    ) -> Result<TokenGrant, TokenError> {
        let credential = credential.ok_or(TokenError::Unauthenticated)?;

        let url = format!("{}/api/twilio/token", self.base_url);
        let agent = self.agent.clone();
        let bearer = credential.access_token().to_string();
        let identity = identity.filter(|id| !id.is_empty()).cloned();

        log::info!("[Token] Requesting session token from {}", url);
        let reply = http::run_blocking(move || {
            let mut request = agent
                .get(&url)
                .set("Auth-Token", &bearer)
                .set("X-Auth-Token", &bearer);
            if let Some(identity) = &identity {
                request = request.query("identity", identity.as_str());
            }
            http::into_reply(request.call())
        })
        .await
        .map_err(TokenError::Network)?;

        grant_from_reply(&reply)
    }
}

fn grant_from_reply(reply: &HttpReply) -> Result<TokenGrant, TokenError> {
    if !reply.is_success() {
        let message = issuance_failure_message(reply);
        log::error!("[Token] Backend refused session token (HTTP {})", reply.status);
        return Err(TokenError::IssuanceFailed(message));
    }

    if let Some(warnings) = reply.body.get("warnings").filter(|w| !w.is_null()) {
        log::warn!("[Token] Token generated with warnings: {}", warnings);
    }

    let token = reply
        .text_field("token")
        .ok_or_else(|| TokenError::IssuanceFailed("Backend did not return a token".to_string()))?;
    let identity = reply.text_field("identity").ok_or(TokenError::IdentityMissing)?;
    let user_id = reply.body.get("userId").and_then(id_text).map(UserId::new);

    log::info!("[Token] Session token received for identity {}", identity);
    Ok(TokenGrant {
        token: SessionToken::new(token),
        identity: Identity::new(identity),
        user_id,
    })
}

/// Backends return numeric or string user ids.
fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn issuance_failure_message(reply: &HttpReply) -> String {
    let mut message = reply
        .text_field("error")
        .unwrap_or_else(|| format!("Server error: {}", reply.status_text));

    if let Some(details) = reply.text_field("details") {
        message.push_str(&format!("\n\nDetails: {details}"));
    }
    if let Some(hint) = reply.text_field("hint") {
        message.push_str(&format!("\n\nHint: {hint}"));
    }

    match reply.status {
        401 => message.push_str("\n\nPlease make sure you are logged in with a valid account."),
        500 => message.push_str(
            "\n\nServer error. Please try again or contact support if the issue persists.",
        ),
        _ => {}
    }
    message
}

/// Supplies replacement session tokens to a live session.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fresh_token(&self) -> Result<SessionToken, TokenError>;
}

/// Re-runs the exchange with whatever credential is currently stored.
pub struct StoredCredentialTokens {
    exchange: Arc<SessionTokenExchange>,
    store: CredentialStore,
    identity: Option<Identity>,
}

impl StoredCredentialTokens {
    pub fn new(
        exchange: Arc<SessionTokenExchange>,
        store: CredentialStore,
        identity: Option<Identity>,
    ) -> Self {
        Self {
            exchange,
            store,
            identity,
        }
    }
}

#[async_trait]
impl TokenSource for StoredCredentialTokens {
    async fn fresh_token(&self) -> Result<SessionToken, TokenError> {
        let credential = self.store.read().unwrap_or_else(|e| {
            log::warn!("[Token] Failed to read credential store: {}", e);
            None
        });
        let grant = self
            .exchange
            .request_session_token(credential.as_ref(), self.identity.as_ref())
            .await?;
        Ok(grant.token)
    }
}
