//! Handler registry: `(local-name, namespace)` → handler dispatch tables
//! for inbound iq-get, iq-set and message stanzas, plus the advertised
//! service-discovery feature set.
//!
//! The feature set is updated under the same lock as the handler maps so
//! discovery responses always reflect exactly the registered handlers that
//! opted in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use minidom::Element;
use tracing::debug;

use crate::error::XmppError;
use crate::parser::ns;

/// What an iq handler wants sent back.
pub enum IqReply {
    /// An empty iq-result
    Empty,
    /// An iq-result carrying this payload
    Payload(Element),
    /// Nothing; the handler already sent its reply
    Handled,
}

/// Handler for inbound iq-get/iq-set. Arguments are the matched child and
/// the whole iq stanza. A returned stanza error becomes an iq-error reply.
pub type IqHandler = Arc<dyn Fn(&Element, &Element) -> Result<IqReply, XmppError> + Send + Sync>;

/// Handler for inbound messages. Arguments are the matched content child
/// and the whole message stanza.
pub type MessageHandler = Arc<dyn Fn(&Element, &Element) + Send + Sync>;

/// Features every client advertises regardless of registrations.
const DEFAULT_FEATURES: &[&str] = &[ns::DISCO_INFO];

fn key_of(local: &str, namespace: &str) -> String {
    format!("{} {}", local, namespace)
}

struct IqEntry {
    handler: IqHandler,
    feature: Option<String>,
}

struct MessageEntry {
    handler: MessageHandler,
    feature: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    iq_get: HashMap<String, IqEntry>,
    iq_set: HashMap<String, IqEntry>,
    message: HashMap<String, MessageEntry>,
    /// Published namespace → number of registrations advertising it
    features: HashMap<String, usize>,
}

impl RegistryInner {
    fn publish(&mut self, namespace: &str) {
        *self.features.entry(namespace.to_string()).or_insert(0) += 1;
    }

    fn retract(&mut self, namespace: &str) {
        if let Some(count) = self.features.get_mut(namespace) {
            *count -= 1;
            if *count == 0 {
                self.features.remove(namespace);
            }
        }
    }
}

pub(crate) struct HandlerRegistry {
    inner: Mutex<RegistryInner>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn register_iq_get(
        &self,
        local: &str,
        namespace: &str,
        handler: IqHandler,
        publish_as_feature: bool,
    ) -> Result<(), XmppError> {
        let mut inner = self.inner.lock().expect("handler registry mutex poisoned");
        let key = key_of(local, namespace);
        if inner.iq_get.contains_key(&key) {
            return Err(XmppError::HandlerConflict(key));
        }
        let feature = publish_as_feature.then(|| namespace.to_string());
        if let Some(feature) = &feature {
            inner.publish(feature);
        }
        debug!(%key, "registered iq-get handler");
        inner.iq_get.insert(key, IqEntry { handler, feature });
        Ok(())
    }

    pub fn register_iq_set(
        &self,
        local: &str,
        namespace: &str,
        handler: IqHandler,
        publish_as_feature: bool,
    ) -> Result<(), XmppError> {
        let mut inner = self.inner.lock().expect("handler registry mutex poisoned");
        let key = key_of(local, namespace);
        if inner.iq_set.contains_key(&key) {
            return Err(XmppError::HandlerConflict(key));
        }
        let feature = publish_as_feature.then(|| namespace.to_string());
        if let Some(feature) = &feature {
            inner.publish(feature);
        }
        debug!(%key, "registered iq-set handler");
        inner.iq_set.insert(key, IqEntry { handler, feature });
        Ok(())
    }

    pub fn register_message(
        &self,
        local: &str,
        namespace: &str,
        handler: MessageHandler,
        publish_as_feature: bool,
    ) -> Result<(), XmppError> {
        let mut inner = self.inner.lock().expect("handler registry mutex poisoned");
        let key = key_of(local, namespace);
        if inner.message.contains_key(&key) {
            return Err(XmppError::HandlerConflict(key));
        }
        let feature = publish_as_feature.then(|| namespace.to_string());
        if let Some(feature) = &feature {
            inner.publish(feature);
        }
        debug!(%key, "registered message handler");
        inner.message.insert(key, MessageEntry { handler, feature });
        Ok(())
    }

    /// Remove an iq-get handler. The caller must present the same handle it
    /// registered with; another registrant's handler cannot be removed.
    pub fn unregister_iq_get(
        &self,
        local: &str,
        namespace: &str,
        handler: &IqHandler,
    ) -> Result<(), XmppError> {
        let mut inner = self.inner.lock().expect("handler registry mutex poisoned");
        let key = key_of(local, namespace);
        match inner.iq_get.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.handler, handler) => {
                let entry = inner.iq_get.remove(&key).expect("entry checked above");
                if let Some(feature) = &entry.feature {
                    inner.retract(feature);
                }
                Ok(())
            }
            _ => Err(XmppError::HandlerMismatch(key)),
        }
    }

    pub fn unregister_iq_set(
        &self,
        local: &str,
        namespace: &str,
        handler: &IqHandler,
    ) -> Result<(), XmppError> {
        let mut inner = self.inner.lock().expect("handler registry mutex poisoned");
        let key = key_of(local, namespace);
        match inner.iq_set.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.handler, handler) => {
                let entry = inner.iq_set.remove(&key).expect("entry checked above");
                if let Some(feature) = &entry.feature {
                    inner.retract(feature);
                }
                Ok(())
            }
            _ => Err(XmppError::HandlerMismatch(key)),
        }
    }

    pub fn unregister_message(
        &self,
        local: &str,
        namespace: &str,
        handler: &MessageHandler,
    ) -> Result<(), XmppError> {
        let mut inner = self.inner.lock().expect("handler registry mutex poisoned");
        let key = key_of(local, namespace);
        match inner.message.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.handler, handler) => {
                let entry = inner.message.remove(&key).expect("entry checked above");
                if let Some(feature) = &entry.feature {
                    inner.retract(feature);
                }
                Ok(())
            }
            _ => Err(XmppError::HandlerMismatch(key)),
        }
    }

    /// Find the first child of an iq-get/iq-set with a registered handler.
    /// The handler and a clone of the matched child are returned so the
    /// lock is released before invocation.
    pub fn lookup_iq(&self, is_set: bool, stanza: &Element) -> Option<(IqHandler, Element)> {
        let inner = self.inner.lock().expect("handler registry mutex poisoned");
        let map = if is_set { &inner.iq_set } else { &inner.iq_get };
        for child in stanza.children() {
            if let Some(entry) = map.get(&key_of(child.name(), &child.ns())) {
                return Some((entry.handler.clone(), child.clone()));
            }
        }
        None
    }

    /// Find the first child of a message with a registered content handler.
    pub fn lookup_message(&self, stanza: &Element) -> Option<(MessageHandler, Element)> {
        let inner = self.inner.lock().expect("handler registry mutex poisoned");
        for child in stanza.children() {
            if let Some(entry) = inner.message.get(&key_of(child.name(), &child.ns())) {
                return Some((entry.handler.clone(), child.clone()));
            }
        }
        None
    }

    /// The advertised feature set: core defaults plus every namespace
    /// published by a registered handler.
    pub fn features(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("handler registry mutex poisoned");
        let mut features: Vec<String> = DEFAULT_FEATURES
            .iter()
            .map(|f| f.to_string())
            .chain(inner.features.keys().cloned())
            .collect();
        features.sort();
        features.dedup();
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_fragment;

    fn noop_iq() -> IqHandler {
        Arc::new(|_, _| Ok(IqReply::Empty))
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = HandlerRegistry::new();
        registry
            .register_iq_get("query", ns::VERSION, noop_iq(), true)
            .expect("first registration succeeds");
        let result = registry.register_iq_get("query", ns::VERSION, noop_iq(), true);
        assert!(matches!(result, Err(XmppError::HandlerConflict(_))));
    }

    #[test]
    fn same_key_different_kinds_do_not_conflict() {
        let registry = HandlerRegistry::new();
        registry
            .register_iq_get("query", ns::ROSTER, noop_iq(), false)
            .unwrap();
        registry
            .register_iq_set("query", ns::ROSTER, noop_iq(), false)
            .unwrap();
    }

    #[test]
    fn unregistration_requires_handle_equality() {
        let registry = HandlerRegistry::new();
        let mine = noop_iq();
        registry
            .register_iq_get("query", ns::VERSION, mine.clone(), false)
            .unwrap();

        let impostor = noop_iq();
        assert!(matches!(
            registry.unregister_iq_get("query", ns::VERSION, &impostor),
            Err(XmppError::HandlerMismatch(_))
        ));

        registry
            .unregister_iq_get("query", ns::VERSION, &mine)
            .expect("owner can unregister");
    }

    #[test]
    fn lookup_matches_first_registered_child() {
        let registry = HandlerRegistry::new();
        registry
            .register_iq_get("query", ns::DISCO_INFO, noop_iq(), true)
            .unwrap();

        let iq = parse_fragment(
            "<iq type='get' id='7'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
        )
        .unwrap();
        let (_, child) = registry.lookup_iq(false, &iq).expect("handler found");
        assert_eq!(child.name(), "query");

        let unknown = parse_fragment("<iq type='get' id='8'><weird xmlns='x:y'/></iq>").unwrap();
        assert!(registry.lookup_iq(false, &unknown).is_none());
    }

    #[test]
    fn feature_set_tracks_opt_in_registrations() {
        let registry = HandlerRegistry::new();
        assert_eq!(registry.features(), vec![ns::DISCO_INFO.to_string()]);

        let handler = noop_iq();
        registry
            .register_iq_get("query", ns::VERSION, handler.clone(), true)
            .unwrap();
        assert!(registry.features().contains(&ns::VERSION.to_string()));

        // Opt-out registrations do not advertise.
        registry
            .register_iq_set("query", ns::ROSTER, noop_iq(), false)
            .unwrap();
        assert!(!registry.features().contains(&ns::ROSTER.to_string()));

        registry
            .unregister_iq_get("query", ns::VERSION, &handler)
            .unwrap();
        assert!(!registry.features().contains(&ns::VERSION.to_string()));
    }

    #[test]
    fn shared_namespace_features_are_refcounted() {
        let registry = HandlerRegistry::new();
        let acknowledged = noop_iq();
        let assured = noop_iq();
        registry
            .register_iq_set("acknowledged", ns::QOS, acknowledged.clone(), true)
            .unwrap();
        registry
            .register_iq_set("assured", ns::QOS, assured, true)
            .unwrap();

        registry
            .unregister_iq_set("acknowledged", ns::QOS, &acknowledged)
            .unwrap();
        assert!(
            registry.features().contains(&ns::QOS.to_string()),
            "one publisher remains"
        );
    }
}
