pub mod error;
pub mod event;

pub use error::EventBusError;
pub use event::{
    BroadcastEventBus, Channel, ChatKind, Event, EventBus, EventPayload, EventSubscription,
    PresenceUpdate, RosterEntry, Subscription,
};
