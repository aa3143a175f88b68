//! Backend conversation API: create a conversation, add a participant.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::credential::Credential;
use crate::http::{self, HttpReply};
use crate::types::{ConversationSid, Identity, UserId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversationApiError {
    #[error("HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Result of a participant-add that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantOutcome {
    Added,
    AlreadyParticipant,
}

/// Conversation management on the backend.
///
/// Requests authenticate with the stored login credential, which is sent
/// both as the `Auth-Token` header and as `jwtToken` in the body.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// Create a conversation owned by `owner`, named after and joined by `identity`.
    async fn create_conversation(
        &self,
        credential: Option<&Credential>,
        owner: &UserId,
        identity: &Identity,
    ) -> Result<ConversationSid, ConversationApiError>;

    /// Add `identity` to `sid`. Already being a participant is not an error.
    async fn add_participant(
        &self,
        credential: Option<&Credential>,
        sid: &ConversationSid,
        identity: &Identity,
    ) -> Result<ParticipantOutcome, ConversationApiError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedConversation {
    conversation_sid: String,
}

/// HTTP implementation against `{backend}/api/twilio/conversation`.
pub struct ConversationApi {
    base_url: String,
    agent: ureq::Agent,
}

impl ConversationApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            agent: http::agent(timeout),
        }
    }

    async fn post(
        &self,
        path: String,
        credential: Option<&Credential>,
        body: serde_json::Value,
    ) -> Result<HttpReply, ConversationApiError> {
        let url = format!("{}{}", self.base_url, path);
        let agent = self.agent.clone();
        let bearer = bearer(credential).map(str::to_string);

        http::run_blocking(move || {
            let mut request = agent.post(&url);
            if let Some(bearer) = &bearer {
                request = request.set("Auth-Token", bearer);
            }
            http::into_reply(request.send_json(body))
        })
        .await
        .map_err(ConversationApiError::Network)
    }
}

fn bearer(credential: Option<&Credential>) -> Option<&str> {
    credential.map(Credential::access_token)
}

fn rejection(reply: &HttpReply) -> ConversationApiError {
    ConversationApiError::Rejected {
        status: reply.status,
        message: reply
            .text_field("error")
            .unwrap_or_else(|| reply.status_text.clone()),
    }
}

/// 409 or an error mentioning "already" means the participant exists.
fn is_already_participant(reply: &HttpReply) -> bool {
    reply.status == 409
        || reply
            .text_field("error")
            .map(|e| e.to_lowercase().contains("already"))
            .unwrap_or(false)
}

#[async_trait]
impl ConversationBackend for ConversationApi {
    async fn create_conversation(
        &self,
        credential: Option<&Credential>,
        owner: &UserId,
        identity: &Identity,
    ) -> Result<ConversationSid, ConversationApiError> {
        let body = json!({
            "userId": owner.as_str(),
            "uniqueName": identity.as_str(),
            "identity": identity.as_str(),
            "jwtToken": bearer(credential),
        });
        let reply = self
            .post("/api/twilio/conversation".to_string(), credential, body)
            .await?;

        if !reply.is_success() {
            return Err(rejection(&reply));
        }
        let created: CreatedConversation = reply.json().map_err(ConversationApiError::Malformed)?;
        if created.conversation_sid.trim().is_empty() {
            return Err(ConversationApiError::Malformed(
                "empty conversationSid".to_string(),
            ));
        }
        Ok(ConversationSid::new(created.conversation_sid))
    }

    async fn add_participant(
        &self,
        credential: Option<&Credential>,
        sid: &ConversationSid,
        identity: &Identity,
    ) -> Result<ParticipantOutcome, ConversationApiError> {
        let body = json!({
            "identity": identity.as_str(),
            "jwtToken": bearer(credential),
        });
        let reply = self
            .post(
                format!("/api/twilio/conversation/{}/participant", sid),
                credential,
                body,
            )
            .await?;

        if reply.is_success() {
            Ok(ParticipantOutcome::Added)
        } else if is_already_participant(&reply) {
            Ok(ParticipantOutcome::AlreadyParticipant)
        } else {
            Err(rejection(&reply))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::{routing::post, Json, Router};
    use serde_json::Value;

    fn api_for(base_url: &str) -> ConversationApi {
        ConversationApi::new(base_url, Duration::from_secs(5))
    }

    fn credential() -> Credential {
        Credential::new("bearer-1", None)
    }

    fn participant_route(status: StatusCode, body: Value) -> Router {
        Router::new().route(
            "/api/twilio/conversation/{sid}/participant",
            post(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        )
    }

    mod create_conversation {
        use super::*;

        #[tokio::test]
        async fn posts_owner_and_identity() {
            let app = Router::new().route(
                "/api/twilio/conversation",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(headers.get("Auth-Token").unwrap(), "bearer-1");
                    assert_eq!(body["userId"], "u1");
                    assert_eq!(body["uniqueName"], "alice");
                    assert_eq!(body["identity"], "alice");
                    assert_eq!(body["jwtToken"], "bearer-1");
                    Json(serde_json::json!({"conversationSid": "CHxyz"}))
                }),
            );
            let server = serve(app);
            let credential = credential();

            let sid = api_for(&server.base_url)
                .create_conversation(Some(&credential), &UserId::from("u1"), &Identity::from("alice"))
                .await
                .unwrap();

            assert_eq!(sid, ConversationSid::from("CHxyz"));
        }

        #[tokio::test]
        async fn failure_is_rejected_with_message() {
            let app = Router::new().route(
                "/api/twilio/conversation",
                post(|| async {
                    (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        Json(serde_json::json!({"error": "quota exceeded"})),
                    )
                }),
            );
            let server = serve(app);

            let err = api_for(&server.base_url)
                .create_conversation(None, &UserId::from("u1"), &Identity::from("alice"))
                .await
                .unwrap_err();

            assert_eq!(
                err,
                ConversationApiError::Rejected {
                    status: 422,
                    message: "quota exceeded".to_string()
                }
            );
        }

        #[tokio::test]
        async fn without_credential_sends_no_bearer() {
            let app = Router::new().route(
                "/api/twilio/conversation",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert!(headers.get("Auth-Token").is_none());
                    assert_eq!(body["jwtToken"], Value::Null);
                    Json(serde_json::json!({"conversationSid": "CHxyz"}))
                }),
            );
            let server = serve(app);

            let sid = api_for(&server.base_url)
                .create_conversation(None, &UserId::from("u1"), &Identity::from("alice"))
                .await
                .unwrap();
            assert_eq!(sid, ConversationSid::from("CHxyz"));
        }

        #[tokio::test]
        async fn missing_sid_is_malformed() {
            let app = Router::new().route(
                "/api/twilio/conversation",
                post(|| async { Json(serde_json::json!({"ok": true})) }),
            );
            let server = serve(app);

            let err = api_for(&server.base_url)
                .create_conversation(None, &UserId::from("u1"), &Identity::from("alice"))
                .await
                .unwrap_err();
            assert!(matches!(err, ConversationApiError::Malformed(_)));
        }
    }

    mod add_participant {
        use super::*;

        async fn add(server_url: &str) -> Result<ParticipantOutcome, ConversationApiError> {
            let credential = credential();
            api_for(server_url)
                .add_participant(
                    Some(&credential),
                    &ConversationSid::from("CH123"),
                    &Identity::from("alice"),
                )
                .await
        }

        #[tokio::test]
        async fn success_is_added() {
            let app = Router::new().route(
                "/api/twilio/conversation/{sid}/participant",
                post(|Path(sid): Path<String>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(sid, "CH123");
                    assert_eq!(headers.get("Auth-Token").unwrap(), "bearer-1");
                    assert_eq!(body["identity"], "alice");
                    assert_eq!(body["jwtToken"], "bearer-1");
                    Json(serde_json::json!({"ok": true}))
                }),
            );
            let server = serve(app);

            assert_eq!(add(&server.base_url).await.unwrap(), ParticipantOutcome::Added);
        }

        #[tokio::test]
        async fn conflict_is_already_participant() {
            let server = serve(participant_route(StatusCode::CONFLICT, Value::Null));

            assert_eq!(
                add(&server.base_url).await.unwrap(),
                ParticipantOutcome::AlreadyParticipant
            );
        }

        #[tokio::test]
        async fn already_message_is_already_participant() {
            let server = serve(participant_route(
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": "Participant already exists"}),
            ));

            assert_eq!(
                add(&server.base_url).await.unwrap(),
                ParticipantOutcome::AlreadyParticipant
            );
        }

        #[tokio::test]
        async fn repeated_add_never_fails_on_conflict() {
            let server = serve(participant_route(StatusCode::CONFLICT, Value::Null));

            assert!(add(&server.base_url).await.is_ok());
            assert!(add(&server.base_url).await.is_ok());
        }

        #[tokio::test]
        async fn other_failure_is_rejected() {
            let server = serve(participant_route(
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": "No such conversation"}),
            ));

            let err = add(&server.base_url).await.unwrap_err();
            assert!(matches!(err, ConversationApiError::Rejected { status: 404, .. }));
        }
    }
}
