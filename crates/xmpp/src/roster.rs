//! RFC 6121 roster cache.
//!
//! The roster (contact list) lives at the server; this module keeps the
//! client-side cache: the item list fetched at startup, pushes applied as
//! they arrive, and the last presence seen per contact. The cache also
//! answers the assured-delivery admission question "is this sender one of
//! my contacts".

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use jid::{BareJid, Jid};
use minidom::Element;
use perch_core::event::{PresenceUpdate, RosterEntry, Subscription};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::XmppError;
use crate::parser::ns;

/// Pending subscription request state (`ask` attribute). Only `subscribe`
/// is valid per RFC 6121.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AskType {
    Subscribe,
}

impl AskType {
    pub fn as_str(&self) -> &'static str {
        "subscribe"
    }

    pub fn from_str(s: &str) -> Result<Self, XmppError> {
        match s {
            "subscribe" => Ok(AskType::Subscribe),
            other => Err(XmppError::bad_request(Some(format!(
                "invalid ask value '{}'",
                other
            )))),
        }
    }
}

/// A contact in the user's roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterItem {
    /// The contact's bare JID
    pub jid: BareJid,
    /// Optional human-readable name
    pub name: Option<String>,
    pub subscription: Subscription,
    pub ask: Option<AskType>,
    pub groups: Vec<String>,
    /// Presence cache slot, updated by inbound presence stanzas
    #[serde(skip)]
    pub last_presence: Option<PresenceUpdate>,
}

impl RosterItem {
    pub fn new(jid: BareJid) -> Self {
        Self {
            jid,
            name: None,
            subscription: Subscription::None,
            ask: None,
            groups: Vec::new(),
            last_presence: None,
        }
    }

    /// Parse a roster `<item/>` element.
    pub fn from_element(elem: &Element) -> Result<Self, XmppError> {
        let jid_str = elem.attr("jid").ok_or_else(|| {
            XmppError::bad_request(Some("roster item missing 'jid' attribute".to_string()))
        })?;

        let jid: BareJid = jid_str.parse().map_err(|e| {
            XmppError::bad_request(Some(format!("invalid JID '{}': {}", jid_str, e)))
        })?;

        let name = elem.attr("name").map(|s| s.to_string());

        let subscription = elem
            .attr("subscription")
            .map(|s| s.parse().unwrap_or(Subscription::None))
            .unwrap_or(Subscription::None);

        let ask = elem.attr("ask").map(AskType::from_str).transpose()?;

        // RFC 6121 does not allow empty or duplicate group names.
        let mut groups = Vec::new();
        let mut seen_groups = HashSet::new();
        for group_elem in elem
            .children()
            .filter(|c| c.name() == "group" && c.ns() == ns::ROSTER)
        {
            let group = group_elem.text();
            if group.trim().is_empty() {
                return Err(XmppError::bad_request(Some(
                    "roster group name must not be empty".to_string(),
                )));
            }
            if !seen_groups.insert(group.clone()) {
                return Err(XmppError::bad_request(Some(
                    "roster group names must be unique".to_string(),
                )));
            }
            groups.push(group);
        }

        Ok(Self {
            jid,
            name,
            subscription,
            ask,
            groups,
            last_presence: None,
        })
    }

    /// Serialize to a roster `<item/>` element.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("item", ns::ROSTER)
            .attr("jid", self.jid.to_string())
            .attr("subscription", self.subscription.as_str());

        if let Some(ref name) = self.name {
            builder = builder.attr("name", name.clone());
        }

        if let Some(ref ask) = self.ask {
            builder = builder.attr("ask", ask.as_str());
        }

        for group in &self.groups {
            builder = builder.append(
                Element::builder("group", ns::ROSTER)
                    .append(group.clone())
                    .build(),
            );
        }

        builder.build()
    }

    /// Event-bus view of this item.
    pub fn to_entry(&self) -> RosterEntry {
        RosterEntry {
            jid: self.jid.to_string(),
            name: self.name.clone(),
            subscription: self.subscription,
            groups: self.groups.clone(),
        }
    }
}

/// Effect of applying a roster push.
#[derive(Debug, Clone)]
pub enum RosterChange {
    Added(RosterItem),
    Updated(RosterItem),
    Removed(BareJid),
    /// A removal push for a contact we never had
    Unchanged,
}

pub(crate) struct RosterCache {
    items: Mutex<HashMap<BareJid, RosterItem>>,
}

impl RosterCache {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the whole cache from a roster fetch result.
    pub fn replace_all(&self, items: Vec<RosterItem>) {
        let mut map = self.items.lock().expect("roster mutex poisoned");
        map.clear();
        for item in items {
            map.insert(item.jid.clone(), item);
        }
        debug!(count = map.len(), "roster cache replaced");
    }

    pub fn snapshot(&self) -> Vec<RosterItem> {
        self.items
            .lock()
            .expect("roster mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, jid: &BareJid) -> Option<RosterItem> {
        self.items
            .lock()
            .expect("roster mutex poisoned")
            .get(jid)
            .cloned()
    }

    pub fn contains(&self, jid: &BareJid) -> bool {
        self.items
            .lock()
            .expect("roster mutex poisoned")
            .contains_key(jid)
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("roster mutex poisoned").len()
    }

    /// Apply one pushed item; `subscription='remove'` deletes.
    pub fn apply_item(&self, item: RosterItem) -> RosterChange {
        let mut map = self.items.lock().expect("roster mutex poisoned");
        if item.subscription == Subscription::Remove {
            return match map.remove(&item.jid) {
                Some(_) => RosterChange::Removed(item.jid),
                None => RosterChange::Unchanged,
            };
        }

        match map.insert(item.jid.clone(), item.clone()) {
            Some(previous) => {
                // Presence survives metadata updates.
                if let Some(existing) = map.get_mut(&item.jid) {
                    existing.last_presence = previous.last_presence;
                }
                RosterChange::Updated(item)
            }
            None => RosterChange::Added(item),
        }
    }

    /// Update the presence cache slot for the sender's bare JID. An
    /// unavailable presence clears the slot only when its full JID matches
    /// the cached one.
    pub fn apply_presence(&self, from: &Jid, update: Option<PresenceUpdate>) {
        let bare = from.to_bare();
        let mut map = self.items.lock().expect("roster mutex poisoned");
        let Some(item) = map.get_mut(&bare) else {
            return;
        };

        match update {
            Some(update) => item.last_presence = Some(update),
            None => {
                let matches = item
                    .last_presence
                    .as_ref()
                    .is_some_and(|cached| cached.from == from.to_string());
                if matches {
                    item.last_presence = None;
                }
            }
        }
    }

    pub fn clear(&self) {
        self.items.lock().expect("roster mutex poisoned").clear();
    }
}

/// Parse all items of a roster query element.
pub fn parse_roster_query(query: &Element) -> Result<Vec<RosterItem>, XmppError> {
    query
        .children()
        .filter(|c| c.name() == "item" && c.ns() == ns::ROSTER)
        .map(RosterItem::from_element)
        .collect()
}
