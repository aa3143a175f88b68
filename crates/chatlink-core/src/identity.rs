//! Identity Reconciler: decides which messages are "mine".
//!
//! Three signals feed the current identity: the backend's token grant,
//! an `identity` hint in conversation attributes, and the author of a local
//! echo. The reconciler is the only place the known identity changes.

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::message::Message;
use crate::types::Identity;

const UNKNOWN_AUTHOR: &str = "Unknown";

#[derive(Debug, Clone, Default)]
pub struct IdentityReconciler {
    known: Option<Identity>,
}

impl IdentityReconciler {
    /// Start from the backend-supplied identity, if any.
    pub fn new(known: Option<Identity>) -> Self {
        Self {
            known: known.filter(|id| !id.is_empty()),
        }
    }

    pub fn known(&self) -> Option<&Identity> {
        self.known.as_ref()
    }

    /// Classify a message, learning the identity from a local echo if unknown.
    ///
    /// A local echo is always mine. Otherwise the author must equal the
    /// known identity; with no known identity nothing else is mine.
    pub fn resolve_is_mine(&mut self, message: &Message) -> bool {
        if message.is_local_echo() {
            if self.known.is_none() {
                if let Some(author) = message.author() {
                    log::info!("[Session] Learned identity {} from local echo", author);
                    self.known = Some(Identity::new(author));
                }
            }
            return true;
        }

        match (&self.known, message.author()) {
            (Some(known), Some(author)) => known.as_str() == author,
            _ => false,
        }
    }

    /// Take an `identity` hint from conversation attributes.
    ///
    /// Only fills an unknown identity. Returns whether it was used.
    pub fn observe_attributes(&mut self, attributes: &Value) -> bool {
        if self.known.is_some() {
            return false;
        }
        let hint = attributes
            .get("identity")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());
        match hint {
            Some(identity) => {
                log::info!("[Session] Using identity {} from conversation attributes", identity);
                self.known = Some(Identity::new(identity));
                true
            }
            None => false,
        }
    }

    /// Presentation form of a message, in local time.
    pub fn view(&mut self, message: &Message) -> MessageView {
        self.view_in(message, &Local)
    }

    pub fn view_in<Tz>(&mut self, message: &Message, tz: &Tz) -> MessageView
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let is_mine = self.resolve_is_mine(message);
        MessageView::build(message, is_mine, tz)
    }
}

/// A message as the presentation layer shows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub body: String,
    pub author: String,
    /// `HH:MM`
    pub time: String,
    pub is_mine: bool,
}

impl MessageView {
    /// View of an already classified message, in local time.
    pub fn of(message: &Message, is_mine: bool) -> Self {
        Self::build(message, is_mine, &Local)
    }

    fn build<Tz>(message: &Message, is_mine: bool, tz: &Tz) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let created = message.date_created.unwrap_or_else(Utc::now);
        Self {
            body: message.body.clone().unwrap_or_default(),
            author: message.author().unwrap_or(UNKNOWN_AUTHOR).to_string(),
            time: format_time(created, tz),
            is_mine,
        }
    }
}

fn format_time<Tz>(at: DateTime<Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    at.with_timezone(tz).format("%H:%M").to_string()
}
