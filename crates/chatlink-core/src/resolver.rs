//! Conversation Resolver.
//!
//! Resolution runs in two phases:
//!
//! 1. Backend: create the conversation when no sid was supplied, otherwise
//!    add the identity as a participant (already-a-participant is fine,
//!    other failures are only logged). Then wait the settle delay so the
//!    backend's change is visible to the platform.
//! 2. Platform: once a client is connected, find the conversation among the
//!    subscribed ones, falling back to a bounded fetch-by-sid retry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::backend::{ConversationApiError, ConversationBackend, ParticipantOutcome, TokenGrant};
use crate::credential::Credential;
use crate::platform::{PlatformClient, PlatformConversation, PlatformError};
use crate::retry::{retry_with_delay, RetryPolicy};
use crate::types::{ConversationSid, Identity};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Failed to create conversation: {0}")]
    ConversationCreateFailed(ConversationApiError),

    #[error("Conversation {sid} not found after {attempts} attempts: {last_error}")]
    ConversationNotFound {
        sid: ConversationSid,
        attempts: u32,
        last_error: PlatformError,
    },

    #[error("No conversation available. Enter a conversation SID or ask the backend to create one.")]
    NoConversationAvailable,

    #[error("Failed to list subscribed conversations: {0}")]
    Listing(PlatformError),
}

/// How the participant step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantStatus {
    /// The conversation was created with the identity in it.
    Created,
    Added,
    AlreadyPresent,
    /// Participant-add failed; resolution continued optimistically.
    Unconfirmed(String),
    /// No backend involvement (manual token mode).
    NotRequested,
}

/// Outcome of the backend phase: what to open on the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTarget {
    /// `None` means "first subscribed conversation".
    pub sid: Option<ConversationSid>,
    pub identity: Option<Identity>,
    pub participant: ParticipantStatus,
}

impl ConversationTarget {
    /// Open `sid` (or the first subscribed conversation) without backend calls.
    pub fn manual(sid: Option<ConversationSid>) -> Self {
        Self {
            sid,
            identity: None,
            participant: ParticipantStatus::NotRequested,
        }
    }
}

pub struct ConversationResolver {
    backend: Arc<dyn ConversationBackend>,
    settle_delay: Duration,
}

impl ConversationResolver {
    pub fn new(backend: Arc<dyn ConversationBackend>, settle_delay: Duration) -> Self {
        Self {
            backend,
            settle_delay,
        }
    }

    /// Ensure a conversation exists and `grant.identity` participates in it.
    pub async fn resolve(
        &self,
        credential: Option<&Credential>,
        grant: &TokenGrant,
        requested: Option<&ConversationSid>,
    ) -> Result<ConversationTarget, ResolveError> {
        let identity = &grant.identity;

        let (sid, participant) = match requested.filter(|sid| !sid.is_empty()) {
            None => {
                log::info!("[Resolver] Creating conversation for {}", identity);
                let sid = self
                    .backend
                    .create_conversation(credential, &grant.owner(), identity)
                    .await
                    .map_err(ResolveError::ConversationCreateFailed)?;
                log::info!("[Resolver] Created conversation {}", sid);
                (sid, ParticipantStatus::Created)
            }
            Some(sid) => {
                log::info!("[Resolver] Adding {} to conversation {}", identity, sid);
                let status = match self.backend.add_participant(credential, sid, identity).await {
                    Ok(ParticipantOutcome::Added) => ParticipantStatus::Added,
                    Ok(ParticipantOutcome::AlreadyParticipant) => {
                        log::info!("[Resolver] {} is already a participant", identity);
                        ParticipantStatus::AlreadyPresent
                    }
                    Err(e) => {
                        log::warn!(
                            "[Resolver] Failed to add participant, continuing anyway: {}",
                            e
                        );
                        ParticipantStatus::Unconfirmed(e.to_string())
                    }
                };
                (sid.clone(), status)
            }
        };

        tokio::time::sleep(self.settle_delay).await;

        Ok(ConversationTarget {
            sid: Some(sid),
            identity: Some(identity.clone()),
            participant,
        })
    }
}

/// Bind a conversation on a connected platform client.
///
/// With a sid, the subscribed list is checked first; otherwise the
/// conversation is fetched directly, re-checking the subscribed list before
/// every retry. A listing hit always wins over a fetch error. Without a sid,
/// the first subscribed conversation is used.
pub async fn open_conversation(
    client: &dyn PlatformClient,
    sid: Option<&ConversationSid>,
    policy: RetryPolicy,
) -> Result<Arc<dyn PlatformConversation>, ResolveError> {
    let Some(sid) = sid.filter(|sid| !sid.is_empty()) else {
        let subscribed = client
            .subscribed_conversations()
            .await
            .map_err(ResolveError::Listing)?;
        return subscribed
            .into_iter()
            .next()
            .ok_or(ResolveError::NoConversationAvailable);
    };

    if let Some(found) = find_subscribed(client, sid).await {
        log::info!("[Resolver] Conversation {} already subscribed", sid);
        return Ok(found);
    }

    let result = retry_with_delay(policy, |attempt| async move {
        if attempt > 1 {
            if let Some(found) = find_subscribed(client, sid).await {
                log::info!("[Resolver] Conversation {} appeared on attempt {}", sid, attempt);
                return Ok(found);
            }
        }
        client.conversation_by_sid(sid).await.map_err(|e| {
            log::warn!(
                "[Resolver] Fetch of {} failed (attempt {}/{}): {}",
                sid,
                attempt,
                policy.max_attempts.max(1),
                e
            );
            e
        })
    })
    .await;

    match result {
        Ok(conversation) => Ok(conversation),
        Err(last_error) => {
            // The backend may have finished while the last fetch was failing.
            if let Some(found) = find_subscribed(client, sid).await {
                return Ok(found);
            }
            Err(ResolveError::ConversationNotFound {
                sid: sid.clone(),
                attempts: policy.max_attempts.max(1),
                last_error,
            })
        }
    }
}

async fn find_subscribed(
    client: &dyn PlatformClient,
    sid: &ConversationSid,
) -> Option<Arc<dyn PlatformConversation>> {
    match client.subscribed_conversations().await {
        Ok(conversations) => conversations.into_iter().find(|c| &c.sid() == sid),
        Err(e) => {
            log::debug!("[Resolver] Could not list subscribed conversations: {}", e);
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
