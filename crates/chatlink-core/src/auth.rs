//! Auth Client: exchanges email/password for a bearer credential.
//!
//! `POST {api_route}/sessions` with `{user: {email, password}}` and the
//! `X-App-Token-2` header. One attempt per call, no retries, no side
//! effects: persisting the returned credential is the caller's job.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::ChatConfig;
use crate::credential::Credential;
use crate::http::{self, HttpReply};

const APP_TOKEN_HEADER: &str = "X-App-Token-2";
const DEFAULT_REJECTION: &str = "Invalid email or password";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Please enter both email and password")]
    MissingFields,

    /// The auth API rejected the credentials (403).
    #[error("{0}")]
    InvalidCredentials(String),

    /// Any other non-success status.
    #[error("Login failed: {0}")]
    Service(String),

    #[error("Network error. Please check your connection and try again. ({0})")]
    Network(String),
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    access_token: String,
    #[serde(default)]
    token_expiration_time: Option<String>,
}

pub struct AuthClient {
    api_route: String,
    app_token: String,
    agent: ureq::Agent,
}

impl AuthClient {
    pub fn new(api_route: impl Into<String>, app_token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_route: api_route.into(),
            app_token: app_token.into(),
            agent: http::agent(timeout),
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(
            config.api_route.clone(),
            config.app_token.clone(),
            config.timings.request_timeout,
        )
    }

    /// Log in and return the issued credential.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        let email = email.trim();
        if email.is_empty() || password.trim().is_empty() {
            return Err(AuthError::MissingFields);
        }

        let url = format!("{}/sessions", self.api_route);
        let agent = self.agent.clone();
        let app_token = self.app_token.clone();
        let body = json!({ "user": { "email": email, "password": password } });

        log::info!("[Auth] Logging in as {}", email);
        let reply = http::run_blocking(move || {
            http::into_reply(
                agent
                    .post(&url)
                    .set(APP_TOKEN_HEADER, &app_token)
                    .send_json(body),
            )
        })
        .await
        .map_err(AuthError::Network)?;

        credential_from_reply(&reply)
    }
}

fn credential_from_reply(reply: &HttpReply) -> Result<Credential, AuthError> {
    if reply.status == 403 {
        let message = reply
            .text_field("error")
            .unwrap_or_else(|| DEFAULT_REJECTION.to_string());
        log::warn!("[Auth] Login rejected: {}", message);
        return Err(AuthError::InvalidCredentials(message));
    }

    if !reply.is_success() {
        log::warn!("[Auth] Login failed with HTTP {}", reply.status);
        return Err(AuthError::Service(format!(
            "{} {}",
            reply.status, reply.status_text
        )));
    }

    let session: SessionResponse = reply.json().map_err(AuthError::Service)?;
    if session.access_token.trim().is_empty() {
        return Err(AuthError::Service("response did not include an access token".to_string()));
    }

    log::info!("[Auth] Login succeeded");
    Ok(Credential::new(
        session.access_token,
        session.token_expiration_time,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use serde_json::Value;

    fn client_for(base_url: &str) -> AuthClient {
        AuthClient::new(format!("{}/api-mobile/v2", base_url), "app-secret", Duration::from_secs(5))
    }

    fn sessions_route(status: StatusCode, body: Value) -> Router {
        Router::new().route(
            "/api-mobile/v2/sessions",
            post(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        )
    }

    #[tokio::test]
    async fn login_returns_credential() {
        let app = Router::new().route(
            "/api-mobile/v2/sessions",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers.get("X-App-Token-2").unwrap(), "app-secret");
                assert_eq!(body["user"]["email"], "a@b.com");
                assert_eq!(body["user"]["password"], "right");
                Json(serde_json::json!({
                    "access_token": "bearer-123",
                    "token_expiration_time": "2030-01-01T00:00:00Z"
                }))
            }),
        );
        let server = serve(app);

        let credential = client_for(&server.base_url)
            .login(" a@b.com ", "right")
            .await
            .unwrap();

        assert_eq!(credential.access_token(), "bearer-123");
        assert_eq!(credential.expires_at(), Some("2030-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn forbidden_uses_server_message() {
        let server = serve(sessions_route(
            StatusCode::FORBIDDEN,
            serde_json::json!({"error": "Invalid password"}),
        ));

        let err = client_for(&server.base_url)
            .login("a@b.com", "wrong")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials(ref m) if m == "Invalid password"));
        assert_eq!(err.to_string(), "Invalid password");
    }

    #[tokio::test]
    async fn forbidden_without_message_uses_generic_text() {
        let server = serve(sessions_route(StatusCode::FORBIDDEN, Value::Null));

        let err = client_for(&server.base_url)
            .login("a@b.com", "wrong")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials(ref m) if m == DEFAULT_REJECTION));
    }

    #[tokio::test]
    async fn other_status_is_service_error() {
        let server = serve(sessions_route(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({"error": "boom"}),
        ));

        let err = client_for(&server.base_url)
            .login("a@b.com", "pw")
            .await
            .unwrap_err();

        match err {
            AuthError::Service(message) => assert!(message.starts_with("500")),
            other => panic!("Expected Service error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_fields_short_circuit() {
        // No server: a network attempt would fail differently.
        let client = AuthClient::new("http://127.0.0.1:1", "app-secret", Duration::from_secs(1));

        assert!(matches!(client.login("  ", "pw").await, Err(AuthError::MissingFields)));
        assert!(matches!(client.login("a@b.com", "").await, Err(AuthError::MissingFields)));
    }

    #[tokio::test]
    async fn unreachable_api_is_network_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = AuthClient::new(format!("http://127.0.0.1:{port}"), "app-secret", Duration::from_secs(2));

        assert!(matches!(client.login("a@b.com", "pw").await, Err(AuthError::Network(_))));
    }

    #[test]
    fn success_without_token_is_service_error() {
        let reply = HttpReply {
            status: 200,
            status_text: "OK".to_string(),
            body: serde_json::json!({"access_token": ""}),
        };
        assert!(matches!(credential_from_reply(&reply), Err(AuthError::Service(_))));
    }
}
