//! Quality-of-service delivery engine (`urn:xmpp:qos`).
//!
//! Three service levels: unacknowledged (plain `<message/>`, done when
//! written), acknowledged (message wrapped in an iq-set, done when the
//! result arrives) and assured (two-phase: `<assured/>` → `<received/>` →
//! `<deliver/>` → result). The inbound side keeps an inventory of assured
//! messages awaiting their deliver phase, with per-source and global
//! admission limits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use jid::BareJid;
use minidom::Element;
use rand::RngCore;
use tracing::debug;

use crate::error::XmppError;
use crate::parser::ns;
use crate::pending::RetryPolicy;

/// Delivery guarantee requested for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    /// Fire and forget; completion fires on write completion
    Unacknowledged,
    /// Completion fires when the receiving client acknowledged the iq
    Acknowledged,
    /// Two-phase handover; completion fires when the deliver result arrives
    Assured,
}

/// Completion callback for a QoS send.
pub type DeliveryCallback = Box<dyn FnOnce(bool) + Send>;

/// Retry parameters for acknowledged/assured sends: patient and
/// effectively unlimited, backing off to an hour between attempts.
pub fn qos_retry_policy() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_secs(2),
        retries: u32::MAX,
        drop_off: true,
        max_timeout: Some(Duration::from_secs(3600)),
    }
}

/// Fresh assured-delivery message id: 16 random bytes, hex.
pub fn generate_msg_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn wrap_acknowledged(message_xml: &str) -> String {
    format!(
        "<acknowledged xmlns='{}'>{}</acknowledged>",
        ns::QOS,
        message_xml
    )
}

pub fn wrap_assured(message_xml: &str, msg_id: &str) -> String {
    format!(
        "<assured xmlns='{}' msgId='{}'>{}</assured>",
        ns::QOS,
        msg_id,
        message_xml
    )
}

pub fn deliver_request(msg_id: &str) -> String {
    format!("<deliver xmlns='{}' msgId='{}'/>", ns::QOS, msg_id)
}

/// The `<received/>` payload confirming acceptance of an assured message.
pub fn received_response(msg_id: &str) -> Element {
    Element::builder("received", ns::QOS)
        .attr("msgId", msg_id)
        .build()
}

#[derive(Default)]
struct AssuredInner {
    /// `(bare sender, msgId)` → the wrapped message awaiting deliver
    pending: HashMap<(String, String), Element>,
    per_source: HashMap<String, usize>,
    total: usize,
}

/// Inventory of inbound assured messages between their `received` and
/// `deliver` phases. The counters always equal the map's cardinality.
pub(crate) struct AssuredInventory {
    inner: Mutex<AssuredInner>,
}

impl AssuredInventory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AssuredInner::default()),
        }
    }

    /// Admission check and record. A message is admitted iff the sender is
    /// in the roster and neither the per-source nor the global limit is
    /// reached. A duplicate `(sender, msgId)` is idempotently re-accepted
    /// without recounting.
    pub fn admit(
        &self,
        from: &BareJid,
        msg_id: &str,
        message: Element,
        sender_in_roster: bool,
        per_source_limit: usize,
        total_limit: usize,
    ) -> Result<(), XmppError> {
        if !sender_in_roster {
            return Err(XmppError::not_allowed(Some(
                "sender is not in the roster".to_string(),
            )));
        }

        let mut inner = self.inner.lock().expect("assured inventory mutex poisoned");
        let key = (from.to_string(), msg_id.to_string());
        if inner.pending.contains_key(&key) {
            debug!(msg_id, "duplicate assured message re-accepted");
            return Ok(());
        }

        let source_count = inner.per_source.get(&key.0).copied().unwrap_or(0);
        if source_count >= per_source_limit || inner.total >= total_limit {
            return Err(XmppError::resource_constraint(Some(
                "too many assured messages pending".to_string(),
            )));
        }

        *inner.per_source.entry(key.0.clone()).or_insert(0) += 1;
        inner.total += 1;
        inner.pending.insert(key, message);
        Ok(())
    }

    /// Remove a recorded message for its deliver phase, decrementing the
    /// counters.
    pub fn take(&self, from: &BareJid, msg_id: &str) -> Option<Element> {
        let mut inner = self.inner.lock().expect("assured inventory mutex poisoned");
        let key = (from.to_string(), msg_id.to_string());
        let message = inner.pending.remove(&key)?;

        inner.total -= 1;
        if let Some(count) = inner.per_source.get_mut(&key.0) {
            *count -= 1;
            if *count == 0 {
                inner.per_source.remove(&key.0);
            }
        }
        Some(message)
    }

    /// `(total pending, pending from this source)`
    pub fn counts(&self, from: &BareJid) -> (usize, usize) {
        let inner = self.inner.lock().expect("assured inventory mutex poisoned");
        (
            inner.total,
            inner
                .per_source
                .get(&from.to_string())
                .copied()
                .unwrap_or(0),
        )
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("assured inventory mutex poisoned");
        inner.pending.clear();
        inner.per_source.clear();
        inner.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StanzaErrorCondition, XmppError};

    fn bare(s: &str) -> BareJid {
        s.parse().expect("valid bare jid")
    }

    fn message() -> Element {
        Element::builder("message", ns::JABBER_CLIENT)
            .append(
                Element::builder("body", ns::JABBER_CLIENT)
                    .append(String::from("hello"))
                    .build(),
            )
            .build()
    }

    fn condition_of(error: XmppError) -> StanzaErrorCondition {
        match error {
            XmppError::Stanza { condition, .. } => condition,
            other => panic!("expected stanza error, got {:?}", other),
        }
    }

    #[test]
    fn msg_ids_are_32_hex_chars_and_distinct() {
        let a = generate_msg_id();
        let b = generate_msg_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn sender_outside_roster_is_not_allowed() {
        let inventory = AssuredInventory::new();
        let error = inventory
            .admit(&bare("stranger@x"), "m1", message(), false, 5, 100)
            .expect_err("admission must fail");
        assert_eq!(condition_of(error), StanzaErrorCondition::NotAllowed);
        assert_eq!(inventory.counts(&bare("stranger@x")), (0, 0));
    }

    #[test]
    fn per_source_limit_is_enforced() {
        let inventory = AssuredInventory::new();
        let sender = bare("friend@x");
        for i in 0..5 {
            inventory
                .admit(&sender, &format!("m{}", i), message(), true, 5, 100)
                .expect("under the limit");
        }

        let error = inventory
            .admit(&sender, "m5", message(), true, 5, 100)
            .expect_err("sixth message must be rejected");
        assert_eq!(condition_of(error), StanzaErrorCondition::ResourceConstraint);
        assert_eq!(inventory.counts(&sender), (5, 5));
    }

    #[test]
    fn global_limit_is_enforced_across_sources() {
        let inventory = AssuredInventory::new();
        inventory
            .admit(&bare("a@x"), "m1", message(), true, 5, 2)
            .unwrap();
        inventory
            .admit(&bare("b@x"), "m1", message(), true, 5, 2)
            .unwrap();

        let error = inventory
            .admit(&bare("c@x"), "m1", message(), true, 5, 2)
            .expect_err("global limit reached");
        assert_eq!(condition_of(error), StanzaErrorCondition::ResourceConstraint);
    }

    #[test]
    fn take_decrements_counters_exactly_once() {
        let inventory = AssuredInventory::new();
        let sender = bare("friend@x");
        inventory
            .admit(&sender, "m1", message(), true, 5, 100)
            .unwrap();
        assert_eq!(inventory.counts(&sender), (1, 1));

        let stored = inventory.take(&sender, "m1").expect("message is recorded");
        assert_eq!(stored.name(), "message");
        assert_eq!(inventory.counts(&sender), (0, 0));

        // A second deliver for the same id finds nothing.
        assert!(inventory.take(&sender, "m1").is_none());
        assert_eq!(inventory.counts(&sender), (0, 0));
    }

    #[test]
    fn duplicate_admission_is_idempotent() {
        let inventory = AssuredInventory::new();
        let sender = bare("friend@x");
        inventory
            .admit(&sender, "m1", message(), true, 5, 100)
            .unwrap();
        inventory
            .admit(&sender, "m1", message(), true, 5, 100)
            .expect("duplicate is re-accepted");
        assert_eq!(inventory.counts(&sender), (1, 1));
    }

    #[test]
    fn wrappers_carry_namespace_and_msg_id() {
        assert_eq!(
            wrap_acknowledged("<message/>"),
            "<acknowledged xmlns='urn:xmpp:qos'><message/></acknowledged>"
        );
        assert_eq!(
            wrap_assured("<message/>", "abc"),
            "<assured xmlns='urn:xmpp:qos' msgId='abc'><message/></assured>"
        );
        assert_eq!(
            deliver_request("abc"),
            "<deliver xmlns='urn:xmpp:qos' msgId='abc'/>"
        );
        let received = received_response("abc");
        assert_eq!(received.attr("msgId"), Some("abc"));
        assert_eq!(received.ns(), ns::QOS);
    }
}
