//! Connection lifecycle and the event pump of a live session.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::{ConnectError, ConnectOptions, SendError, SessionEvent, SessionState};
use crate::backend::TokenSource;
use crate::event_bus::EventBus;
use crate::identity::{IdentityReconciler, MessageView};
use crate::logging::{self, LogHandle};
use crate::message::{build_attributes, Message, MessageMetadata};
use crate::platform::{
    ClientEvent, ConnectionState, ConversationEvent, PlatformClient, PlatformConnector,
    PlatformConversation, Subscription,
};
use crate::resolver::{open_conversation, ConversationTarget};
use crate::types::{ConversationSid, Identity, SessionToken};

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shuts the client down unless connect got far enough to hand it over.
struct ClientGuard {
    client: Option<Arc<dyn PlatformClient>>,
}

impl ClientGuard {
    fn disarm(mut self) {
        self.client = None;
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            log::info!("[Session] Releasing client after failed connect");
            client.shutdown();
        }
    }
}

/// A connected client bound to one conversation.
///
/// Dropping the session tears it down.
pub struct LiveSession {
    client: Arc<dyn PlatformClient>,
    conversation: Arc<dyn PlatformConversation>,
    state: Arc<Mutex<SessionState>>,
    events: Arc<EventBus<SessionEvent>>,
    connection: Arc<watch::Sender<ConnectionState>>,
    transcript: LogHandle,
    pump: JoinHandle<()>,
    torn_down: AtomicBool,
}

impl LiveSession {
    /// Connect with `token` and open the conversation named by `target`.
    ///
    /// Every failure shuts the client down before returning, so calling
    /// `connect` again is safe.
    pub async fn connect(
        connector: &dyn PlatformConnector,
        token: &SessionToken,
        target: &ConversationTarget,
        options: ConnectOptions,
    ) -> Result<Self, ConnectError> {
        if token.is_empty() {
            return Err(ConnectError::MissingToken);
        }

        log::info!("[Session] Creating messaging client");
        let client = connector.create_client(token).map_err(ConnectError::Client)?;
        let guard = ClientGuard {
            client: Some(Arc::clone(&client)),
        };
        // Subscribe before the first await so no transition is missed.
        let mut client_events = client.subscribe();

        wait_for_connected(client.as_ref(), &mut client_events, options.timeout).await?;
        log::info!("[Session] Client connected");

        let conversation =
            open_conversation(client.as_ref(), target.sid.as_ref(), options.fetch).await?;
        let sid = conversation.sid();
        log::info!("[Session] Opened conversation {}", sid);

        // Live events from here on; history overlap is deduplicated by sid.
        let conversation_events = conversation.subscribe();
        let history = conversation
            .messages()
            .await
            .map_err(ConnectError::History)?;

        let known = options.identity.clone().or_else(|| target.identity.clone());
        let mut identity = IdentityReconciler::new(known);
        match conversation.attributes().await {
            Ok(attributes) => {
                identity.observe_attributes(&attributes);
            }
            Err(e) => log::warn!("[Session] Could not read conversation attributes: {}", e),
        }

        let mut state = SessionState::new(identity);
        log::info!("[Session] Loaded {} messages", history.len());
        state.load_history(history);
        state.set_connection(ConnectionState::Connected);

        let state = Arc::new(Mutex::new(state));
        let events = Arc::new(EventBus::new());
        let (connection, _) = watch::channel(ConnectionState::Connected);
        let connection = Arc::new(connection);
        logging::log_line(&options.transcript, "STATE", "connected");

        let pump = Pump {
            client: Arc::clone(&client),
            state: Arc::clone(&state),
            events: Arc::clone(&events),
            connection: Arc::clone(&connection),
            transcript: options.transcript.clone(),
            token_source: options.token_source.clone(),
        };
        let pump = tokio::spawn(pump.run(client_events, conversation_events));

        guard.disarm();
        Ok(Self {
            client,
            conversation,
            state,
            events,
            connection,
            transcript: options.transcript,
            pump,
            torn_down: AtomicBool::new(false),
        })
    }

    /// Events applied after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn conversation_sid(&self) -> ConversationSid {
        self.conversation.sid()
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.state).messages.messages().to_vec()
    }

    pub fn message_views(&self) -> Vec<MessageView> {
        lock(&self.state).views()
    }

    /// The identity currently considered "me".
    pub fn identity(&self) -> Option<Identity> {
        lock(&self.state).identity.known().cloned()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Send `body` with a `timestamp` attribute plus caller metadata.
    ///
    /// A failed send leaves the session usable.
    pub async fn send(
        &self,
        body: &str,
        metadata: Option<&MessageMetadata>,
    ) -> Result<(), SendError> {
        if body.trim().is_empty() {
            return Err(SendError::EmptyBody);
        }
        if self.is_torn_down() {
            return Err(SendError::NotConnected);
        }

        let attributes = build_attributes(metadata, Utc::now());
        match self.conversation.send_message(body, attributes).await {
            Ok(()) => {
                logging::log_line(&self.transcript, "SEND", body);
                Ok(())
            }
            Err(e) => {
                log::warn!("[Session] Send failed: {}", e);
                logging::log_line(&self.transcript, "ERROR", &format!("send failed: {e}"));
                Err(SendError::Failed(e))
            }
        }
    }

    /// Stop the event pump and release the client. Idempotent.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[Session] Tearing down session for {}", self.conversation.sid());
        self.pump.abort();
        self.client.shutdown();

        if lock(&self.state).set_connection(ConnectionState::Disconnected) {
            self.connection.send_replace(ConnectionState::Disconnected);
            self.events
                .emit(SessionEvent::ConnectionState(ConnectionState::Disconnected));
        }
        logging::log_line(&self.transcript, "STATE", "disconnected");
    }
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession")
            .field("conversation", &self.conversation.sid())
            .field("connection", &self.connection_state())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Wait until the client reports `connected`, failing fast on `denied` or
/// `disconnected`.
async fn wait_for_connected(
    client: &dyn PlatformClient,
    events: &mut Subscription<ClientEvent>,
    timeout: Duration,
) -> Result<(), ConnectError> {
    let wait = async {
        let mut state = client.connection_state();
        loop {
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Denied => return Err(ConnectError::Denied),
                ConnectionState::Disconnected => return Err(ConnectError::Disconnected),
                ConnectionState::Connecting => {}
            }
            state = match events.recv().await {
                Ok(ClientEvent::ConnectionStateChanged(next)) => {
                    log::info!("[Session] Connection state: {}", next);
                    next
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => client.connection_state(),
                Err(RecvError::Closed) => return Err(ConnectError::Disconnected),
            };
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("[Session] Client did not connect within {:?}", timeout);
            Err(ConnectError::Timeout {
                secs: timeout.as_secs(),
            })
        }
    }
}

/// Applies platform events to the shared session state in delivery order.
struct Pump {
    client: Arc<dyn PlatformClient>,
    state: Arc<Mutex<SessionState>>,
    events: Arc<EventBus<SessionEvent>>,
    connection: Arc<watch::Sender<ConnectionState>>,
    transcript: LogHandle,
    token_source: Option<Arc<dyn TokenSource>>,
}

impl Pump {
    async fn run(
        self,
        mut client_events: Subscription<ClientEvent>,
        mut conversation_events: Subscription<ConversationEvent>,
    ) {
        let pump = Arc::new(self);
        // Dropped with the pump, which aborts a refresh still in flight.
        let mut refreshes = JoinSet::new();
        loop {
            tokio::select! {
                event = client_events.recv() => match event {
                    Ok(ClientEvent::TokenAboutToExpire) => {
                        if refreshes.is_empty() {
                            let pump = Arc::clone(&pump);
                            refreshes.spawn(async move { pump.refresh_token().await });
                        } else {
                            log::debug!("[Session] Token refresh already in progress");
                        }
                    }
                    Ok(event) => pump.on_client_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("[Session] Missed {} client events", skipped);
                        pump.on_connection_state(pump.client.connection_state());
                    }
                    Err(RecvError::Closed) => break,
                },
                event = conversation_events.recv() => match event {
                    Ok(event) => pump.on_conversation_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("[Session] Missed {} conversation events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(_) = refreshes.join_next(), if !refreshes.is_empty() => {}
            }
        }
        log::debug!("[Session] Event pump stopped");
    }

    fn on_client_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::ConnectionStateChanged(state) => self.on_connection_state(state),
            // Refreshed off the event loop by `run`.
            ClientEvent::TokenAboutToExpire => {}
            ClientEvent::TokenExpired => self.reauth("Session token expired"),
        }
    }

    fn on_connection_state(&self, state: ConnectionState) {
        if !lock(&self.state).set_connection(state) {
            return;
        }
        log::info!("[Session] Connection state: {}", state);
        self.connection.send_replace(state);
        logging::log_line(&self.transcript, "STATE", &state.to_string());
        self.events.emit(SessionEvent::ConnectionState(state));
    }

    fn on_conversation_event(&self, event: ConversationEvent) {
        let applied = lock(&self.state).apply(event);
        let Some(applied) = applied else {
            return;
        };
        let (direction, message) = match &applied {
            SessionEvent::MessageAdded { message, .. } => ("RECV", message),
            SessionEvent::MessageUpdated { message, .. } => ("UPDATE", message),
            _ => return,
        };
        logging::log_line(
            &self.transcript,
            direction,
            &format!(
                "{}: {}",
                message.author().unwrap_or("Unknown"),
                message.body.as_deref().unwrap_or_default()
            ),
        );
        self.events.emit(applied);
    }

    async fn refresh_token(&self) {
        let Some(source) = &self.token_source else {
            self.reauth("Session token is about to expire");
            return;
        };

        log::info!("[Session] Session token about to expire, requesting a new one");
        let token = match source.fresh_token().await {
            Ok(token) => token,
            Err(e) => {
                self.reauth(&format!("Could not refresh session token: {e}"));
                return;
            }
        };
        match self.client.update_token(&token).await {
            Ok(()) => {
                log::info!("[Session] Session token refreshed");
                self.events.emit(SessionEvent::TokenRefreshed);
            }
            Err(e) => self.reauth(&format!("Messaging client rejected the new token: {e}")),
        }
    }

    fn reauth(&self, reason: &str) {
        log::warn!("[Session] Re-authentication required: {}", reason);
        self.events.emit(SessionEvent::ReauthRequired {
            reason: reason.to_string(),
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
