//! In-process messaging platform.
//!
//! Holds conversations, participants and messages in memory and behaves
//! like the hosted service at the client boundary: sent messages arrive
//! first as a local echo through `MessageAdded`, then get a server index
//! through `MessageUpdated`. Used by the test suite and by the CLI's
//! loopback chat mode. Knobs let callers script connection outcomes and
//! transient fetch failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{
    ClientEvent, ConnectionState, ConversationEvent, PlatformClient, PlatformConnector,
    PlatformConversation, PlatformError, Subscription,
};
use crate::event_bus::EventBus;
use crate::message::{Message, Origin};
use crate::types::{ConversationSid, Identity, MessageSid, SessionToken};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a newly created client does after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Reach `connected` after `delay`.
    Connect { delay: Duration },
    Deny,
    Disconnect,
    /// Stay in `connecting` forever.
    Hang,
}

impl Default for ConnectBehavior {
    fn default() -> Self {
        ConnectBehavior::Connect {
            delay: Duration::ZERO,
        }
    }
}

struct ConversationRecord {
    sid: ConversationSid,
    participants: Mutex<Vec<Identity>>,
    messages: Mutex<Vec<Message>>,
    attributes: Mutex<Value>,
    events: EventBus<ConversationEvent>,
    next_index: AtomicU64,
}

impl ConversationRecord {
    fn new(sid: ConversationSid, attributes: Value) -> Self {
        Self {
            sid,
            participants: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            attributes: Mutex::new(attributes),
            events: EventBus::new(),
            next_index: AtomicU64::new(0),
        }
    }

    fn has_participant(&self, identity: &Identity) -> bool {
        lock(&self.participants).contains(identity)
    }

    /// Store a confirmed message and return it.
    fn commit(&self, sid: MessageSid, author: &str, body: &str, attributes: Value) -> Message {
        let message = Message {
            sid,
            author: Some(author.to_string()),
            body: Some(body.to_string()),
            date_created: Some(Utc::now()),
            origin: Origin::Remote {
                index: self.next_index.fetch_add(1, Ordering::SeqCst),
            },
            attributes,
        };
        lock(&self.messages).push(message.clone());
        message
    }
}

#[derive(Default)]
struct Knobs {
    behavior: ConnectBehavior,
    fetch_failures: HashMap<ConversationSid, u32>,
    hidden_listings: HashMap<ConversationSid, u32>,
    send_failures: u32,
}

#[derive(Default)]
struct Shared {
    conversations: Mutex<Vec<Arc<ConversationRecord>>>,
    identities: Mutex<HashMap<String, Identity>>,
    knobs: Mutex<Knobs>,
    /// Clients not yet shut down.
    clients: Mutex<Vec<Arc<MemoryClient>>>,
    clients_created: AtomicUsize,
    fetch_count: AtomicUsize,
}

impl Shared {
    fn find(&self, sid: &ConversationSid) -> Option<Arc<ConversationRecord>> {
        lock(&self.conversations)
            .iter()
            .find(|c| &c.sid == sid)
            .cloned()
    }
}

/// The whole platform. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryPlatform {
    shared: Arc<Shared>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens issued for `identity`. Unregistered tokens act as their own identity.
    pub fn register_token(&self, token: &SessionToken, identity: &Identity) {
        lock(&self.shared.identities).insert(token.expose().to_string(), identity.clone());
    }

    pub fn create_conversation(&self, sid: &ConversationSid, attributes: Value) {
        if self.shared.find(sid).is_some() {
            return;
        }
        lock(&self.shared.conversations)
            .push(Arc::new(ConversationRecord::new(sid.clone(), attributes)));
    }

    /// Returns false if the identity was already a participant.
    pub fn add_participant(&self, sid: &ConversationSid, identity: &Identity) -> bool {
        let Some(record) = self.shared.find(sid) else {
            return false;
        };
        let mut participants = lock(&record.participants);
        if participants.contains(identity) {
            return false;
        }
        participants.push(identity.clone());
        true
    }

    pub fn participants(&self, sid: &ConversationSid) -> Vec<Identity> {
        self.shared
            .find(sid)
            .map(|record| lock(&record.participants).clone())
            .unwrap_or_default()
    }

    /// Confirmed messages stored for a conversation.
    pub fn stored_messages(&self, sid: &ConversationSid) -> Vec<Message> {
        self.shared
            .find(sid)
            .map(|record| lock(&record.messages).clone())
            .unwrap_or_default()
    }

    /// Deliver a message from another participant.
    pub fn inject_remote_message(&self, sid: &ConversationSid, author: &str, body: &str) -> Option<Message> {
        let record = self.shared.find(sid)?;
        let message = record.commit(new_message_sid(), author, body, Value::Null);
        record.events.emit(ConversationEvent::MessageAdded(message.clone()));
        Some(message)
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        lock(&self.shared.knobs).behavior = behavior;
    }

    /// Make the next `times` fetches of `sid` fail with a transport error.
    pub fn fail_fetches(&self, sid: &ConversationSid, times: u32) {
        lock(&self.shared.knobs).fetch_failures.insert(sid.clone(), times);
    }

    /// Leave `sid` out of the next `times` subscribed-conversation listings.
    pub fn hide_from_listings(&self, sid: &ConversationSid, times: u32) {
        lock(&self.shared.knobs).hidden_listings.insert(sid.clone(), times);
    }

    pub fn fail_sends(&self, times: u32) {
        lock(&self.shared.knobs).send_failures = times;
    }

    /// Number of direct fetch-by-sid calls made so far.
    pub fn fetch_count(&self) -> usize {
        self.shared.fetch_count.load(Ordering::SeqCst)
    }

    /// Subscribers currently attached to a conversation's event feed.
    pub fn conversation_subscribers(&self, sid: &ConversationSid) -> usize {
        self.shared
            .find(sid)
            .map(|record| record.events.subscriber_count())
            .unwrap_or(0)
    }

    /// Clients that have not been shut down, oldest first.
    pub fn clients(&self) -> Vec<Arc<MemoryClient>> {
        lock(&self.shared.clients).clone()
    }

    /// Clients ever created, including ones already shut down.
    pub fn clients_created(&self) -> usize {
        self.shared.clients_created.load(Ordering::SeqCst)
    }
}

fn new_message_sid() -> MessageSid {
    MessageSid::new(format!("IM{}", uuid::Uuid::new_v4().simple()))
}

impl PlatformConnector for MemoryPlatform {
    fn create_client(&self, token: &SessionToken) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        if token.is_empty() {
            return Err(PlatformError::Forbidden("empty access token".to_string()));
        }
        let identity = lock(&self.shared.identities)
            .get(token.expose())
            .cloned()
            .unwrap_or_else(|| Identity::new(token.expose()));

        let client = Arc::new_cyclic(|me| MemoryClient {
            me: me.clone(),
            shared: Arc::clone(&self.shared),
            identity,
            state: Mutex::new(ConnectionState::Connecting),
            events: EventBus::new(),
            shut_down: AtomicBool::new(false),
            tokens: Mutex::new(vec![token.expose().to_string()]),
        });
        lock(&self.shared.clients).push(Arc::clone(&client));
        self.shared.clients_created.fetch_add(1, Ordering::SeqCst);

        let behavior = lock(&self.shared.knobs).behavior;
        let driver = Arc::clone(&client);
        tokio::spawn(async move {
            let target = match behavior {
                ConnectBehavior::Connect { delay } => {
                    tokio::time::sleep(delay).await;
                    ConnectionState::Connected
                }
                ConnectBehavior::Deny => ConnectionState::Denied,
                ConnectBehavior::Disconnect => ConnectionState::Disconnected,
                ConnectBehavior::Hang => return,
            };
            if !driver.is_shut_down() {
                driver.set_state(target);
            }
        });

        Ok(client)
    }
}

/// One client connection, authenticated as a single identity.
pub struct MemoryClient {
    me: Weak<MemoryClient>,
    shared: Arc<Shared>,
    identity: Identity,
    state: Mutex<ConnectionState>,
    events: EventBus<ClientEvent>,
    shut_down: AtomicBool,
    tokens: Mutex<Vec<String>>,
}

impl MemoryClient {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Every token this client has been given, oldest first.
    pub fn tokens(&self) -> Vec<String> {
        lock(&self.tokens).clone()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
        self.events.emit(ClientEvent::ConnectionStateChanged(state));
    }

    pub fn emit(&self, event: ClientEvent) {
        self.events.emit(event);
    }

    fn ensure_open(&self) -> Result<(), PlatformError> {
        if self.is_shut_down() {
            Err(PlatformError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn handle(&self, record: Arc<ConversationRecord>) -> Result<Arc<dyn PlatformConversation>, PlatformError> {
        let client = self.me.upgrade().ok_or(PlatformError::ShutDown)?;
        Ok(Arc::new(MemoryConversation { record, client }))
    }
}

#[async_trait]
impl PlatformClient for MemoryClient {
    fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn subscribe(&self) -> Subscription<ClientEvent> {
        self.events.subscribe()
    }

    async fn subscribed_conversations(
        &self,
    ) -> Result<Vec<Arc<dyn PlatformConversation>>, PlatformError> {
        self.ensure_open()?;
        let records = lock(&self.shared.conversations).clone();
        let mut knobs = lock(&self.shared.knobs);

        let mut visible = Vec::new();
        for record in records {
            if !record.has_participant(&self.identity) {
                continue;
            }
            if let Some(remaining) = knobs.hidden_listings.get_mut(&record.sid) {
                if *remaining > 0 {
                    *remaining -= 1;
                    continue;
                }
            }
            visible.push(self.handle(record)?);
        }
        Ok(visible)
    }

    async fn conversation_by_sid(
        &self,
        sid: &ConversationSid,
    ) -> Result<Arc<dyn PlatformConversation>, PlatformError> {
        self.ensure_open()?;
        self.shared.fetch_count.fetch_add(1, Ordering::SeqCst);

        if let Some(remaining) = lock(&self.shared.knobs).fetch_failures.get_mut(sid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PlatformError::Transport(format!("fetch of {} failed", sid)));
            }
        }

        let record = self
            .shared
            .find(sid)
            .ok_or_else(|| PlatformError::NotFound(sid.clone()))?;
        if !record.has_participant(&self.identity) {
            return Err(PlatformError::Forbidden(format!(
                "{} is not a participant of {}",
                self.identity, sid
            )));
        }
        self.handle(record)
    }

    async fn update_token(&self, token: &SessionToken) -> Result<(), PlatformError> {
        self.ensure_open()?;
        lock(&self.tokens).push(token.expose().to_string());
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.state) = ConnectionState::Disconnected;
        self.events
            .emit(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        lock(&self.shared.clients).retain(|client| !std::ptr::eq(Arc::as_ptr(client), self));
    }
}

struct MemoryConversation {
    record: Arc<ConversationRecord>,
    client: Arc<MemoryClient>,
}

#[async_trait]
impl PlatformConversation for MemoryConversation {
    fn sid(&self) -> ConversationSid {
        self.record.sid.clone()
    }

    fn subscribe(&self) -> Subscription<ConversationEvent> {
        self.record.events.subscribe()
    }

    async fn attributes(&self) -> Result<Value, PlatformError> {
        self.client.ensure_open()?;
        Ok(lock(&self.record.attributes).clone())
    }

    async fn messages(&self) -> Result<Vec<Message>, PlatformError> {
        self.client.ensure_open()?;
        Ok(lock(&self.record.messages).clone())
    }

    async fn send_message(&self, body: &str, attributes: Value) -> Result<(), PlatformError> {
        self.client.ensure_open()?;
        {
            let mut knobs = lock(&self.client.shared.knobs);
            if knobs.send_failures > 0 {
                knobs.send_failures -= 1;
                return Err(PlatformError::Transport("send failed".to_string()));
            }
        }

        let sid = new_message_sid();
        let author = self.client.identity.as_str();
        let echo = Message {
            sid: sid.clone(),
            author: Some(author.to_string()),
            body: Some(body.to_string()),
            date_created: Some(Utc::now()),
            origin: Origin::Local,
            attributes: attributes.clone(),
        };
        self.record.events.emit(ConversationEvent::MessageAdded(echo));

        let confirmed = self.record.commit(sid, author, body, attributes);
        self.record
            .events
            .emit(ConversationEvent::MessageUpdated(confirmed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sid(value: &str) -> ConversationSid {
        ConversationSid::from(value)
    }

    fn platform_with(conversation: &str, participant: &str) -> MemoryPlatform {
        let platform = MemoryPlatform::new();
        platform.create_conversation(&sid(conversation), json!({}));
        platform.add_participant(&sid(conversation), &Identity::from(participant));
        platform
    }

    mod client {
        use super::*;

        #[tokio::test]
        async fn connects_by_default() {
            let platform = MemoryPlatform::new();
            let client = platform.create_client(&SessionToken::new("alice")).unwrap();
            let mut events = client.subscribe();

            let event = events.recv().await.unwrap();
            assert_eq!(
                event,
                ClientEvent::ConnectionStateChanged(ConnectionState::Connected)
            );
            assert_eq!(client.connection_state(), ConnectionState::Connected);
        }

        #[tokio::test]
        async fn registered_token_maps_to_identity() {
            let platform = MemoryPlatform::new();
            let token = SessionToken::new("jwt-abc");
            platform.register_token(&token, &Identity::from("alice"));

            platform.create_client(&token).unwrap();
            assert_eq!(platform.clients()[0].identity(), &Identity::from("alice"));
        }

        #[tokio::test]
        async fn denied_behavior() {
            let platform = MemoryPlatform::new();
            platform.set_connect_behavior(ConnectBehavior::Deny);
            let client = platform.create_client(&SessionToken::new("alice")).unwrap();
            let mut events = client.subscribe();

            assert_eq!(
                events.recv().await.unwrap(),
                ClientEvent::ConnectionStateChanged(ConnectionState::Denied)
            );
        }

        #[tokio::test]
        async fn shut_down_client_is_released() {
            let platform = MemoryPlatform::new();
            platform.set_connect_behavior(ConnectBehavior::Deny);
            let client = platform.create_client(&SessionToken::new("alice")).unwrap();
            let mut events = client.subscribe();
            events.recv().await.unwrap();
            let weak = Arc::downgrade(&client);

            client.shutdown();
            drop(events);
            drop(client);

            assert!(platform.clients().is_empty());
            assert_eq!(platform.clients_created(), 1);
            assert!(weak.upgrade().is_none());
        }

        #[test]
        fn empty_token_is_rejected() {
            let platform = MemoryPlatform::new();
            assert!(platform.create_client(&SessionToken::new(" ")).is_err());
        }

        #[tokio::test]
        async fn shutdown_is_idempotent_and_closes_calls() {
            let platform = platform_with("CH1", "alice");
            let client = platform.create_client(&SessionToken::new("alice")).unwrap();

            client.shutdown();
            client.shutdown();

            assert!(platform.clients().is_empty());
            assert_eq!(client.connection_state(), ConnectionState::Disconnected);
            assert!(matches!(
                client.conversation_by_sid(&sid("CH1")).await,
                Err(PlatformError::ShutDown)
            ));
        }
    }

    mod conversations {
        use super::*;

        #[tokio::test]
        async fn listing_only_includes_joined_conversations() {
            let platform = platform_with("CH1", "alice");
            platform.create_conversation(&sid("CH2"), json!({}));
            let client = platform.create_client(&SessionToken::new("alice")).unwrap();

            let listed = client.subscribed_conversations().await.unwrap();
            let sids: Vec<_> = listed.iter().map(|c| c.sid()).collect();
            assert_eq!(sids, vec![sid("CH1")]);
        }

        #[tokio::test]
        async fn hidden_listing_reappears() {
            let platform = platform_with("CH1", "alice");
            platform.hide_from_listings(&sid("CH1"), 1);
            let client = platform.create_client(&SessionToken::new("alice")).unwrap();

            assert!(client.subscribed_conversations().await.unwrap().is_empty());
            assert_eq!(client.subscribed_conversations().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn scripted_fetch_failures() {
            let platform = platform_with("CH1", "alice");
            platform.fail_fetches(&sid("CH1"), 1);
            let client = platform.create_client(&SessionToken::new("alice")).unwrap();

            assert!(matches!(
                client.conversation_by_sid(&sid("CH1")).await,
                Err(PlatformError::Transport(_))
            ));
            assert!(client.conversation_by_sid(&sid("CH1")).await.is_ok());
            assert_eq!(platform.fetch_count(), 2);
        }

        #[tokio::test]
        async fn non_participant_is_forbidden() {
            let platform = platform_with("CH1", "alice");
            let client = platform.create_client(&SessionToken::new("mallory")).unwrap();

            assert!(matches!(
                client.conversation_by_sid(&sid("CH1")).await,
                Err(PlatformError::Forbidden(_))
            ));
            assert!(matches!(
                client.conversation_by_sid(&sid("CH9")).await,
                Err(PlatformError::NotFound(_))
            ));
        }

        #[test]
        fn add_participant_reports_duplicates() {
            let platform = platform_with("CH1", "alice");
            assert!(!platform.add_participant(&sid("CH1"), &Identity::from("alice")));
            assert!(platform.add_participant(&sid("CH1"), &Identity::from("bob")));
            assert!(!platform.add_participant(&sid("CH9"), &Identity::from("bob")));
            assert_eq!(platform.participants(&sid("CH1")).len(), 2);
        }
    }

    mod send_message {
        use super::*;

        #[tokio::test]
        async fn echo_then_confirmation() {
            let platform = platform_with("CH1", "alice");
            let client = platform.create_client(&SessionToken::new("alice")).unwrap();
            let conversation = client.conversation_by_sid(&sid("CH1")).await.unwrap();
            let mut events = conversation.subscribe();

            conversation
                .send_message("hello", json!({"timestamp": "t"}))
                .await
                .unwrap();

            let ConversationEvent::MessageAdded(echo) = events.recv().await.unwrap() else {
                panic!("expected MessageAdded first");
            };
            let ConversationEvent::MessageUpdated(confirmed) = events.recv().await.unwrap() else {
                panic!("expected MessageUpdated second");
            };
            assert_eq!(echo.origin, Origin::Local);
            assert_eq!(echo.sid, confirmed.sid);
            assert_eq!(confirmed.origin, Origin::Remote { index: 0 });
            assert_eq!(confirmed.body.as_deref(), Some("hello"));
            assert_eq!(platform.stored_messages(&sid("CH1")).len(), 1);
        }

        #[tokio::test]
        async fn scripted_send_failure() {
            let platform = platform_with("CH1", "alice");
            platform.fail_sends(1);
            let client = platform.create_client(&SessionToken::new("alice")).unwrap();
            let conversation = client.conversation_by_sid(&sid("CH1")).await.unwrap();

            assert!(conversation.send_message("x", Value::Null).await.is_err());
            assert!(conversation.send_message("x", Value::Null).await.is_ok());
        }

        #[tokio::test]
        async fn injected_messages_are_remote() {
            let platform = platform_with("CH1", "alice");
            let message = platform
                .inject_remote_message(&sid("CH1"), "bob", "hey")
                .unwrap();

            assert_eq!(message.origin, Origin::Remote { index: 0 });
            assert!(platform.inject_remote_message(&sid("CH9"), "bob", "hey").is_none());
        }
    }
}
