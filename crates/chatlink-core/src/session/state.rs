//! Per-session state shared between the session handle and its event pump.

use crate::identity::{IdentityReconciler, MessageView};
use crate::message::{Message, MessageLog};
use crate::platform::{ConnectionState, ConversationEvent};

use super::SessionEvent;

/// Messages, identity and connection state of one live session.
///
/// Events are applied strictly in the order the platform delivered them.
pub struct SessionState {
    pub messages: MessageLog,
    pub identity: IdentityReconciler,
    pub connection: ConnectionState,
}

impl SessionState {
    pub fn new(identity: IdentityReconciler) -> Self {
        Self {
            messages: MessageLog::new(),
            identity,
            connection: ConnectionState::Connecting,
        }
    }

    /// Seed the log with conversation history.
    pub fn load_history(&mut self, history: Vec<Message>) {
        for message in history {
            self.identity.resolve_is_mine(&message);
            self.messages.apply_added(message);
        }
    }

    /// Apply one conversation event and describe it for subscribers.
    ///
    /// Updates for messages the log has never seen produce no event.
    pub fn apply(&mut self, event: ConversationEvent) -> Option<SessionEvent> {
        match event {
            ConversationEvent::MessageAdded(message) => {
                let is_mine = self.identity.resolve_is_mine(&message);
                if self.messages.apply_added(message.clone()) {
                    Some(SessionEvent::MessageAdded { message, is_mine })
                } else {
                    // Already loaded with history: surface as a replacement.
                    Some(SessionEvent::MessageUpdated { message, is_mine })
                }
            }
            ConversationEvent::MessageUpdated(message) => {
                let is_mine = self.identity.resolve_is_mine(&message);
                if self.messages.apply_updated(message.clone()) {
                    Some(SessionEvent::MessageUpdated { message, is_mine })
                } else {
                    None
                }
            }
        }
    }

    /// Record a connection transition. Returns false if nothing changed.
    pub fn set_connection(&mut self, state: ConnectionState) -> bool {
        if self.connection == state {
            return false;
        }
        self.connection = state;
        true
    }

    pub fn views(&mut self) -> Vec<MessageView> {
        let Self {
            messages, identity, ..
        } = self;
        messages
            .messages()
            .iter()
            .map(|message| identity.view(message))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{test_message, Origin};
    use crate::types::Identity;

    fn state(identity: Option<&str>) -> SessionState {
        SessionState::new(IdentityReconciler::new(identity.map(Identity::from)))
    }

    #[test]
    fn new_state_is_connecting() {
        assert_eq!(state(None).connection, ConnectionState::Connecting);
    }

    #[test]
    fn echo_then_confirmation_appears_once() {
        let mut state = state(None);
        let echo = test_message("IM1", "alice", "hello", Origin::Local);
        let confirmed = test_message("IM1", "alice", "hello", Origin::Remote { index: 4 });

        let added = state.apply(ConversationEvent::MessageAdded(echo));
        let updated = state.apply(ConversationEvent::MessageUpdated(confirmed));

        assert!(matches!(added, Some(SessionEvent::MessageAdded { is_mine: true, .. })));
        assert!(matches!(updated, Some(SessionEvent::MessageUpdated { is_mine: true, .. })));
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages.messages()[0].body.as_deref(), Some("hello"));
        assert_eq!(state.identity.known(), Some(&Identity::from("alice")));
    }

    #[test]
    fn update_for_unknown_message_is_dropped() {
        let mut state = state(Some("alice"));
        let update = test_message("IM9", "bob", "x", Origin::Remote { index: 1 });

        assert_eq!(state.apply(ConversationEvent::MessageUpdated(update)), None);
        assert!(state.messages.is_empty());
    }

    #[test]
    fn history_then_live_event_for_same_sid_dedupes() {
        let mut state = state(Some("alice"));
        let message = test_message("IM1", "bob", "hi", Origin::Remote { index: 0 });

        state.load_history(vec![message.clone()]);
        let event = state.apply(ConversationEvent::MessageAdded(message));

        assert!(matches!(event, Some(SessionEvent::MessageUpdated { .. })));
        assert_eq!(state.messages.len(), 1);
    }

    #[test]
    fn set_connection_reports_changes() {
        let mut state = state(None);
        assert!(state.set_connection(ConnectionState::Connected));
        assert!(!state.set_connection(ConnectionState::Connected));
    }

    #[test]
    fn views_classify_messages() {
        let mut state = state(Some("alice"));
        state.load_history(vec![
            test_message("IM1", "bob", "hi", Origin::Remote { index: 0 }),
            test_message("IM2", "alice", "hey", Origin::Remote { index: 1 }),
        ]);

        let mine: Vec<bool> = state.views().iter().map(|v| v.is_mine).collect();
        assert_eq!(mine, vec![false, true]);
    }
}
