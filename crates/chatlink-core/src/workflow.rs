//! End-to-end session establishment.
//!
//! login → store credential → session token → resolve conversation →
//! connect. Each step can also be driven on its own.

use std::path::Path;
use std::sync::Arc;

use crate::auth::AuthClient;
use crate::backend::{
    ConversationApi, ConversationBackend, SessionTokenExchange, StoredCredentialTokens, TokenGrant,
    TokenSource,
};
use crate::config::ChatConfig;
use crate::credential::{Credential, CredentialStore};
use crate::error::Result;
use crate::logging::{self, LogHandle};
use crate::message::MessageMetadata;
use crate::platform::PlatformConnector;
use crate::resolver::{ConversationResolver, ConversationTarget};
use crate::session::{ConnectOptions, LiveSession};
use crate::types::{ConversationSid, Identity, SessionToken};

pub struct ChatWorkflow {
    config: ChatConfig,
    store: CredentialStore,
    auth: AuthClient,
    tokens: Arc<SessionTokenExchange>,
    resolver: ConversationResolver,
    connector: Arc<dyn PlatformConnector>,
}

impl ChatWorkflow {
    /// Workflow with a file-backed credential store in `config.config_dir`.
    pub fn from_config(config: ChatConfig, connector: Arc<dyn PlatformConnector>) -> Self {
        let store = CredentialStore::file_backed(&config.config_dir);
        Self::new(config, store, connector)
    }

    pub fn new(
        config: ChatConfig,
        store: CredentialStore,
        connector: Arc<dyn PlatformConnector>,
    ) -> Self {
        let backend = Arc::new(ConversationApi::new(
            config.backend_url.clone(),
            config.timings.request_timeout,
        ));
        Self::with_backend(config, store, backend, connector)
    }

    /// Workflow with a custom conversation backend.
    pub fn with_backend(
        config: ChatConfig,
        store: CredentialStore,
        backend: Arc<dyn ConversationBackend>,
        connector: Arc<dyn PlatformConnector>,
    ) -> Self {
        let auth = AuthClient::from_config(&config);
        let tokens = Arc::new(SessionTokenExchange::new(
            config.backend_url.clone(),
            config.timings.request_timeout,
        ));
        let resolver = ConversationResolver::new(backend, config.timings.settle_delay);
        Self {
            config,
            store,
            auth,
            tokens,
            resolver,
            connector,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Log in and persist the credential. Nothing is stored on failure.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential> {
        let credential = self.auth.login(email, password).await?;
        self.store.store(&credential)?;
        Ok(credential)
    }

    pub fn logout(&self) -> Result<()> {
        self.store.clear()?;
        log::info!("[Auth] Logged out");
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    /// Exchange the stored credential for a session token.
    pub async fn request_session_token(&self, identity: Option<&Identity>) -> Result<TokenGrant> {
        let credential = self.store.read()?;
        Ok(self
            .tokens
            .request_session_token(credential.as_ref(), identity)
            .await?)
    }

    /// Get a session token and make sure a conversation is ready for it.
    ///
    /// `conversation` falls back to the configured default; with neither, a
    /// new conversation is created.
    pub async fn join(
        &self,
        conversation: Option<&ConversationSid>,
    ) -> Result<(TokenGrant, ConversationTarget)> {
        let credential = self.store.read()?;
        let grant = self
            .tokens
            .request_session_token(credential.as_ref(), None)
            .await?;
        let requested = conversation.or(self.config.conversation_sid.as_ref());
        let target = self
            .resolver
            .resolve(credential.as_ref(), &grant, requested)
            .await?;
        Ok((grant, target))
    }

    /// Run the whole establishment workflow and return a live session.
    ///
    /// The session renews its token through the stored credential.
    pub async fn establish(
        &self,
        conversation: Option<&ConversationSid>,
        transcript_dir: Option<&Path>,
    ) -> Result<(LiveSession, TokenGrant)> {
        let (grant, target) = self.join(conversation).await?;
        let token_source: Arc<dyn TokenSource> = Arc::new(StoredCredentialTokens::new(
            Arc::clone(&self.tokens),
            self.store.clone(),
            None,
        ));
        let options = ConnectOptions {
            identity: Some(grant.identity.clone()),
            token_source: Some(token_source),
            transcript: transcript_for(transcript_dir, target.sid.as_ref()),
            ..self.connect_options()
        };
        let session =
            LiveSession::connect(self.connector.as_ref(), &grant.token, &target, options).await?;
        Ok((session, grant))
    }

    /// Connect with a pre-issued session token, skipping the backend.
    ///
    /// Opens `conversation` (or the configured default), else the first
    /// subscribed conversation.
    pub async fn establish_with_token(
        &self,
        token: &SessionToken,
        conversation: Option<&ConversationSid>,
        transcript_dir: Option<&Path>,
    ) -> Result<LiveSession> {
        let requested = conversation
            .or(self.config.conversation_sid.as_ref())
            .cloned();
        let options = ConnectOptions {
            transcript: transcript_for(transcript_dir, requested.as_ref()),
            ..self.connect_options()
        };
        let target = ConversationTarget::manual(requested);
        Ok(LiveSession::connect(self.connector.as_ref(), token, &target, options).await?)
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            timeout: self.config.timings.connect_timeout,
            fetch: self.config.timings.conversation_fetch,
            ..ConnectOptions::default()
        }
    }
}

/// Metadata attached to messages sent on behalf of `grant`'s user.
pub fn metadata_for(grant: &TokenGrant) -> MessageMetadata {
    MessageMetadata {
        user_id: grant.user_id.as_ref().map(|id| id.to_string()),
        ..MessageMetadata::default()
    }
}

fn transcript_for(dir: Option<&Path>, sid: Option<&ConversationSid>) -> LogHandle {
    logging::open_log_file(dir, sid.map(ConversationSid::as_str).unwrap_or("chat"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::error::Error;
    use crate::platform::memory::MemoryPlatform;
    use crate::test_support::serve;
    use crate::types::UserId;
    use axum::http::StatusCode;
    use axum::{routing::post, Json, Router};
    use std::time::Duration;

    fn config(api_route: &str) -> ChatConfig {
        ChatConfig {
            app_token: "app".to_string(),
            backend_url: "http://127.0.0.1:1".to_string(),
            api_route: api_route.to_string(),
            conversation_sid: None,
            config_dir: std::env::temp_dir(),
            timings: Timings {
                request_timeout: Duration::from_secs(5),
                ..Timings::default()
            },
        }
    }

    fn workflow(api_route: &str) -> ChatWorkflow {
        ChatWorkflow::new(
            config(api_route),
            CredentialStore::in_memory(),
            Arc::new(MemoryPlatform::new()),
        )
    }

    #[tokio::test]
    async fn rejected_login_stores_nothing() {
        let app = Router::new().route(
            "/sessions",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    Json(serde_json::json!({"error": "Invalid password"})),
                )
            }),
        );
        let server = serve(app);
        let workflow = workflow(&server.base_url);

        let err = workflow.login("a@b.com", "wrong").await.unwrap_err();

        assert_eq!(err.to_string(), "Invalid password");
        assert!(!workflow.is_authenticated());
    }

    #[tokio::test]
    async fn successful_login_is_stored_until_logout() {
        let app = Router::new().route(
            "/sessions",
            post(|| async { Json(serde_json::json!({"access_token": "bearer"})) }),
        );
        let server = serve(app);
        let workflow = workflow(&server.base_url);

        workflow.login("a@b.com", "right").await.unwrap();
        assert!(workflow.is_authenticated());

        workflow.logout().unwrap();
        assert!(!workflow.is_authenticated());
    }

    #[tokio::test]
    async fn token_request_without_login_is_unauthenticated() {
        let workflow = workflow("http://127.0.0.1:1");

        let err = workflow.request_session_token(None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Token(crate::backend::TokenError::Unauthenticated)
        ));
    }

    #[test]
    fn metadata_carries_user_id() {
        let grant = TokenGrant {
            token: SessionToken::new("t"),
            identity: Identity::from("alice"),
            user_id: Some(UserId::from("u1")),
        };
        assert_eq!(metadata_for(&grant).user_id.as_deref(), Some("u1"));
    }
}
