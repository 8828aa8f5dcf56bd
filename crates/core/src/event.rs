//! Typed event envelope and broadcast bus.
//!
//! Everything observable about a client connection crosses this bus: state
//! transitions, connection failures, roster and presence changes, inbound
//! messages and form deliveries. Subscribers receive events by channel
//! prefix so a consumer can watch `connection` without draining `roster`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Hierarchical channel name, dotted lowercase (e.g. `connection.state`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }
        name.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.'))
    }

    /// First dotted segment.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn matches_prefix(&self, prefix: &str) -> bool {
        prefix.is_empty()
            || self.0 == prefix
            || (self.0.starts_with(prefix) && self.0.as_bytes().get(prefix.len()) == Some(&b'.'))
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The envelope wrapping every event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Channel name (e.g. `connection.state`, `roster.item.updated`)
    pub channel: Channel,
    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,
    /// Unique identifier for this event
    pub id: Uuid,
    /// The typed payload
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            payload,
        }
    }
}

/// A single entry of the contact list as it crosses the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Bare JID of the contact
    pub jid: String,
    /// Display name set by the user, if any
    pub name: Option<String>,
    pub subscription: Subscription,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }
}

impl std::str::FromStr for Subscription {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => Subscription::None,
        })
    }
}

/// Presence as cached against a roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    /// Full JID the presence was received from
    pub from: String,
    pub available: bool,
    /// `<show/>` value (away, chat, dnd, xa), absent when plain available
    pub show: Option<String>,
    pub status: Option<String>,
}

/// Message classes per RFC 6121 `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatKind {
    Chat,
    Error,
    GroupChat,
    Headline,
    Normal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Connection ───────────────────────────────────────────────
    StateChanged {
        previous: String,
        current: String,
    },
    ConnectionError {
        message: String,
        recoverable: bool,
    },
    ErrorOccurred {
        component: String,
        message: String,
    },

    // ── Roster ───────────────────────────────────────────────────
    RosterReceived {
        items: Vec<RosterEntry>,
    },
    RosterItemAdded {
        item: RosterEntry,
    },
    RosterItemUpdated {
        item: RosterEntry,
    },
    RosterItemRemoved {
        jid: String,
    },

    // ── Presence ─────────────────────────────────────────────────
    PresenceChanged {
        update: PresenceUpdate,
    },
    SubscriptionRequested {
        from: String,
    },
    SubscriptionGranted {
        from: String,
    },
    SubscriptionWithdrawn {
        from: String,
    },
    SubscriptionDeclined {
        from: String,
    },
    PresenceProbe {
        from: String,
    },
    PresenceError {
        from: String,
        stanza: String,
    },

    // ── Messages ─────────────────────────────────────────────────
    MessageReceived {
        kind: ChatKind,
        from: String,
        body: Option<String>,
        stanza: String,
    },

    // ── Forms & account management ───────────────────────────────
    RegistrationFormReceived {
        from: String,
        form: String,
    },
    PasswordChangeFormReceived {
        from: String,
        form: String,
    },
    PasswordChanged,
    DynamicFormUpdated {
        from: String,
        form: String,
    },
}

/// Event publication seam. Implementations must be cheap to call from the
/// dispatch loop; a slow subscriber must not be able to stall the stream.
pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;

    fn subscribe(&self, prefix: &str) -> Result<EventSubscription, EventBusError>;
}

/// `tokio::sync::broadcast` backed bus. Events published while no
/// subscriber exists are dropped, matching fire-and-forget semantics.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self, prefix: &str) -> Result<EventSubscription, EventBusError> {
        if !prefix.is_empty() && !Channel::is_valid(prefix) {
            return Err(EventBusError::InvalidChannel(prefix.to_string()));
        }
        Ok(EventSubscription {
            prefix: prefix.to_string(),
            receiver: self.sender.subscribe(),
        })
    }
}

pub struct EventSubscription {
    prefix: String,
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.channel.matches_prefix(&self.prefix) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_validation() {
        assert!(Channel::is_valid("connection.state"));
        assert!(Channel::is_valid("roster.item.updated"));
        assert!(Channel::is_valid("message.chat"));

        assert!(!Channel::is_valid("connection..state"));
        assert!(!Channel::is_valid(".starts.with.dot"));
        assert!(!Channel::is_valid("ends.with.dot."));
        assert!(!Channel::is_valid("UpperCase"));
        assert!(!Channel::is_valid("with-hyphen"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn channel_domain() {
        let c = Channel::new("roster.item.updated").unwrap();
        assert_eq!(c.domain(), "roster");
    }

    #[test]
    fn prefix_matching_is_segment_aware() {
        let c = Channel::new("message.chat").unwrap();
        assert!(c.matches_prefix(""));
        assert!(c.matches_prefix("message"));
        assert!(c.matches_prefix("message.chat"));
        assert!(!c.matches_prefix("mess"));
        assert!(!c.matches_prefix("message.chat.extra"));
    }

    #[tokio::test]
    async fn subscriber_receives_matching_events_only() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("connection").expect("subscribe should succeed");

        bus.publish(Event::new(
            Channel::new("roster.item.removed").unwrap(),
            EventPayload::RosterItemRemoved {
                jid: "a@b".to_string(),
            },
        ))
        .unwrap();
        bus.publish(Event::new(
            Channel::new("connection.state").unwrap(),
            EventPayload::StateChanged {
                previous: "offline".to_string(),
                current: "connecting".to_string(),
            },
        ))
        .unwrap();

        let event = sub.recv().await.expect("event should arrive");
        assert_eq!(event.channel.as_str(), "connection.state");
    }

    #[tokio::test]
    async fn empty_prefix_receives_everything() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("").expect("subscribe should succeed");

        bus.publish(Event::new(
            Channel::new("account.password.changed").unwrap(),
            EventPayload::PasswordChanged,
        ))
        .unwrap();

        let event = sub.recv().await.expect("event should arrive");
        assert!(matches!(event.payload, EventPayload::PasswordChanged));
    }
}
