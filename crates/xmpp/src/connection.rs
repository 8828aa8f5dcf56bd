//! Connection state machine and stanza dispatch.
//!
//! `Client` owns the whole lifecycle: dial TCP, negotiate the stream
//! (STARTTLS → SASL → bind → roster → presence), then hand the stream to a
//! read task, a writer task and a 1-second tick task. Inbound stanzas are
//! routed to the handler registry (requests), the pending table
//! (responses) or the QoS engine; everything observable is published on
//! the event bus.

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use base64::prelude::*;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use perch_core::error::EventBusError;
use perch_core::event::{
    BroadcastEventBus, Channel, ChatKind, Event, EventBus, EventPayload, EventSubscription,
    PresenceUpdate,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{ClientConfig, Secret};
use crate::disco::{self, DiscoInfo, DiscoItems, Identity};
use crate::error::{
    generate_iq_error, SaslErrorCondition, StanzaErrorCondition, StanzaErrorType,
    StreamErrorCondition, XmppError,
};
use crate::parser::{
    element_to_string, escape_xml, ns, parse_fragment, StreamEvent, StreamTokenizer, Utf8Reader,
};
use crate::pending::{IqCallback, IqResponse, PendingTable, RetryPolicy};
use crate::qos::{self, AssuredInventory, DeliveryCallback, QosLevel};
use crate::registry::{HandlerRegistry, IqHandler, IqReply, MessageHandler};
use crate::roster::{parse_roster_query, RosterCache, RosterChange, RosterItem};
use crate::sasl::{build_mechanism, select_mechanism, Mechanism};
use crate::sniffer::Sniffer;
use crate::transport::{self, BoxStream};
use crate::writer::{spawn_writer, WriteCompletion, WriteQueue};
use crate::xep::xep0004::DataForm;
use crate::xep::xep0055::{self, SearchFields, SearchResult};
use crate::xep::xep0077::{self, RegistrationFields};
use crate::xep::xep0092::{self, SoftwareVersion};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    StreamNegotiation,
    StartingEncryption,
    Authenticating,
    Registering,
    Binding,
    FetchingRoster,
    SettingPresence,
    Connected,
    Offline,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::StreamNegotiation => "stream-negotiation",
            Self::StartingEncryption => "starting-encryption",
            Self::Authenticating => "authenticating",
            Self::Registering => "registering",
            Self::Binding => "binding",
            Self::FetchingRoster => "fetching-roster",
            Self::SettingPresence => "setting-presence",
            Self::Connected => "connected",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Handshake-local iq ids; the pending table is not in play yet.
const BIND_ID: &str = "bind-1";
const ROSTER_ID: &str = "roster-1";
const REGISTER_FORM_ID: &str = "register-form-1";
const REGISTER_SUBMIT_ID: &str = "register-submit-1";

struct SessionIdentity {
    full_jid: Option<FullJid>,
    /// Bound resource, reused on reconnect
    resource: Option<String>,
    roster_fetched: bool,
}

pub(crate) struct ClientInner {
    config: Mutex<ClientConfig>,
    state: Mutex<ConnectionState>,
    events: Arc<dyn EventBus>,
    registry: HandlerRegistry,
    pending: PendingTable,
    roster: RosterCache,
    assured: AssuredInventory,
    writer: Mutex<Option<WriteQueue>>,
    identity: Mutex<SessionIdentity>,
    sniffer: Option<Arc<dyn Sniffer>>,
    shutdown: watch::Sender<bool>,
}

impl ClientInner {
    fn set_state(&self, next: ConnectionState) {
        let previous = {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if *state == next {
                return;
            }
            std::mem::replace(&mut *state, next)
        };
        debug!(from = %previous, to = %next, "connection state changed");
        self.emit(
            "connection.state",
            EventPayload::StateChanged {
                previous: previous.as_str().to_string(),
                current: next.as_str().to_string(),
            },
        );
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn emit(&self, channel: &str, payload: EventPayload) {
        match Channel::new(channel) {
            Ok(channel) => {
                let _ = self.events.publish(Event::new(channel, payload));
            }
            Err(_) => warn!(channel, "invalid event channel"),
        }
    }

    fn sniff_out(&self, payload: &str) {
        if let Some(sniffer) = &self.sniffer {
            sniffer.outbound(payload);
        }
    }

    fn sniff_in(&self, payload: &str) {
        if let Some(sniffer) = &self.sniffer {
            sniffer.inbound(payload);
        }
    }

    fn config_snapshot(&self) -> ClientConfig {
        self.config.lock().expect("config mutex poisoned").clone()
    }

    fn writer_handle(&self) -> Option<WriteQueue> {
        self.writer.lock().expect("writer mutex poisoned").clone()
    }

    /// Submit a payload to the write queue; quietly dropped when offline.
    fn submit(&self, payload: String, completion: Option<WriteCompletion>) {
        match self.writer_handle() {
            Some(writer) => {
                if writer.submit(payload, completion).is_err() {
                    debug!("write queue gone, payload dropped");
                }
            }
            None => {
                if let Some(completion) = completion {
                    completion(false);
                }
            }
        }
    }

    /// Send an iq-result for an inbound request.
    fn reply_result(&self, request: &Element, payload: Option<Element>) {
        let id = request.attr("id").unwrap_or_default();
        let to = request
            .attr("from")
            .map(|f| format!(" to='{}'", f))
            .unwrap_or_default();
        let body = payload
            .as_ref()
            .and_then(|p| element_to_string(p).ok())
            .unwrap_or_default();
        self.submit(
            format!("<iq type='result' id='{}'{}>{}</iq>", id, to, body),
            None,
        );
    }

    /// Send an iq-error for an inbound request.
    fn reply_error(
        &self,
        request: &Element,
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<&str>,
    ) {
        let id = request.attr("id").unwrap_or_default();
        self.submit(
            generate_iq_error(id, request.attr("from"), condition, error_type, text),
            None,
        );
    }

    /// Register an outbound request and transmit it.
    fn send_iq(
        &self,
        iq_type: &str,
        to: Option<&str>,
        body: &str,
        callback: IqCallback,
        policy: RetryPolicy,
    ) -> Result<u32, XmppError> {
        let writer = self.writer_handle().ok_or(XmppError::NotConnected)?;
        let (seqnr, stanza) = self.pending.register(iq_type, to, body, callback, policy);
        writer.submit(stanza, None)?;
        Ok(seqnr)
    }

    /// Tear the session down: stop tasks, drop the writer, fail every
    /// pending request, and land in `state`.
    fn teardown(&self, state: ConnectionState) {
        let _ = self.shutdown.send(true);
        *self.writer.lock().expect("writer mutex poisoned") = None;
        for (callback, response) in self.pending.drain() {
            invoke_iq_callback(callback, response);
        }
        self.assured.clear();
        self.set_state(state);
    }

    fn on_transport_failure(&self, error: XmppError) {
        if matches!(self.state(), ConnectionState::Offline) {
            return; // deliberate teardown already ran
        }
        warn!(error = %error, "transport failure");
        self.emit(
            "connection.error",
            EventPayload::ConnectionError {
                message: error.to_string(),
                recoverable: error.is_recoverable(),
            },
        );
        self.teardown(ConnectionState::Error);
    }

    fn on_stream_closed(&self) {
        debug!("stream footer received, going offline");
        self.teardown(ConnectionState::Offline);
    }
}

/// XMPP client handle. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_observers(config, Arc::new(BroadcastEventBus::default()), None)
    }

    /// Construct with an externally owned event bus and an optional wire
    /// sniffer.
    pub fn with_observers(
        config: ClientConfig,
        events: Arc<dyn EventBus>,
        sniffer: Option<Arc<dyn Sniffer>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            config: Mutex::new(config),
            state: Mutex::new(ConnectionState::Offline),
            events,
            registry: HandlerRegistry::new(),
            pending: PendingTable::new(),
            roster: RosterCache::new(),
            assured: AssuredInventory::new(),
            writer: Mutex::new(None),
            identity: Mutex::new(SessionIdentity {
                full_jid: None,
                resource: None,
                roster_fetched: false,
            }),
            sniffer,
            shutdown,
        });
        install_default_handlers(&inner);
        Self { inner }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Subscribe to client events by channel prefix (empty for all).
    pub fn subscribe(&self, prefix: &str) -> Result<EventSubscription, EventBusError> {
        self.inner.events.subscribe(prefix)
    }

    /// The full JID established by resource binding.
    pub fn full_jid(&self) -> Option<FullJid> {
        self.inner
            .identity
            .lock()
            .expect("identity mutex poisoned")
            .full_jid
            .clone()
    }

    /// Connect, drive the handshake to completion and start the session
    /// tasks. Follows `see-other-host` redirects.
    pub async fn connect(&self) -> Result<(), XmppError> {
        run_connect(self.inner.clone()).await
    }

    /// Like [`Client::connect`] but over a caller-supplied stream. No
    /// redirects: a `see-other-host` surfaces as an error.
    pub async fn connect_over(&self, stream: BoxStream) -> Result<(), XmppError> {
        self.inner.set_state(ConnectionState::Connecting);
        match negotiate(&self.inner, stream).await {
            Ok(established) => {
                spawn_session(&self.inner, established);
                self.inner.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.inner.emit(
                    "connection.error",
                    EventPayload::ConnectionError {
                        message: e.to_string(),
                        recoverable: e.is_recoverable(),
                    },
                );
                self.inner.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    // ── Requests ─────────────────────────────────────────────────────

    pub fn send_iq_get(
        &self,
        to: Option<&str>,
        body: &str,
        callback: IqCallback,
    ) -> Result<u32, XmppError> {
        let policy = RetryPolicy::from_config(&self.inner.config_snapshot());
        self.inner.send_iq("get", to, body, callback, policy)
    }

    pub fn send_iq_set(
        &self,
        to: Option<&str>,
        body: &str,
        callback: IqCallback,
    ) -> Result<u32, XmppError> {
        let policy = RetryPolicy::from_config(&self.inner.config_snapshot());
        self.inner.send_iq("set", to, body, callback, policy)
    }

    pub fn send_iq_with(
        &self,
        iq_type: &str,
        to: Option<&str>,
        body: &str,
        callback: IqCallback,
        policy: RetryPolicy,
    ) -> Result<u32, XmppError> {
        self.inner.send_iq(iq_type, to, body, callback, policy)
    }

    /// Single-shot iq-get gated on a timeout; returns the result payload.
    pub async fn iq_get_sync(
        &self,
        to: Option<&str>,
        body: &str,
        timeout: Duration,
    ) -> Result<Element, XmppError> {
        let response = self.iq_sync("get", to, body, timeout).await?;
        response
            .payload
            .ok_or_else(|| XmppError::xml_parse("iq-result carried no payload"))
    }

    /// Single-shot iq-set gated on a timeout; empty results are fine.
    pub async fn iq_set_sync(
        &self,
        to: Option<&str>,
        body: &str,
        timeout: Duration,
    ) -> Result<Option<Element>, XmppError> {
        Ok(self.iq_sync("set", to, body, timeout).await?.payload)
    }

    async fn iq_sync(
        &self,
        iq_type: &str,
        to: Option<&str>,
        body: &str,
        timeout: Duration,
    ) -> Result<IqResponse, XmppError> {
        let (tx, rx) = oneshot::channel();
        let policy = RetryPolicy::from_config(&self.inner.config_snapshot());
        self.inner.send_iq(
            iq_type,
            to,
            body,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
            policy,
        )?;

        let response = match tokio::time::timeout(timeout, rx).await {
            Err(_) => return Err(XmppError::Timeout),
            Ok(Err(_)) => return Err(XmppError::NotConnected),
            Ok(Ok(response)) => response,
        };

        if response.ok {
            Ok(response)
        } else {
            Err(stanza_error_from(response.payload.as_ref()))
        }
    }

    // ── Messaging ────────────────────────────────────────────────────

    /// Send a message element at the requested delivery level. The element
    /// must carry a `to` attribute.
    pub fn send_message_element(
        &self,
        message: Element,
        level: QosLevel,
        completion: Option<DeliveryCallback>,
    ) -> Result<(), XmppError> {
        let to = message
            .attr("to")
            .map(String::from)
            .ok_or_else(|| XmppError::bad_request(Some("message lacks a 'to'".to_string())))?;
        let xml = element_to_string(&message)?;

        match level {
            QosLevel::Unacknowledged => {
                self.inner.submit(
                    xml,
                    completion.map(|cb| Box::new(move |ok: bool| cb(ok)) as WriteCompletion),
                );
                Ok(())
            }
            QosLevel::Acknowledged => {
                let body = qos::wrap_acknowledged(&xml);
                let mut completion = completion;
                self.inner.send_iq(
                    "set",
                    Some(&to),
                    &body,
                    Box::new(move |response| {
                        if let Some(cb) = completion.take() {
                            cb(response.ok);
                        }
                    }),
                    qos::qos_retry_policy(),
                )?;
                Ok(())
            }
            QosLevel::Assured => {
                let msg_id = qos::generate_msg_id();
                let body = qos::wrap_assured(&xml, &msg_id);
                let weak = Arc::downgrade(&self.inner);
                let to_clone = to.clone();
                self.inner.send_iq(
                    "set",
                    Some(&to),
                    &body,
                    Box::new(move |response| {
                        assured_second_phase(weak, to_clone, msg_id, response, completion)
                    }),
                    qos::qos_retry_policy(),
                )?;
                Ok(())
            }
        }
    }

    /// Convenience chat message.
    pub fn send_chat_message(
        &self,
        to: &str,
        body: &str,
        level: QosLevel,
        completion: Option<DeliveryCallback>,
    ) -> Result<(), XmppError> {
        self.send_message_element(chat_message(to, body), level, completion)
    }

    // ── Presence ─────────────────────────────────────────────────────

    /// Broadcast our own presence.
    pub fn set_presence(&self, show: Option<&str>, status: Option<&str>) -> Result<(), XmppError> {
        let mut xml = String::from("<presence>");
        if let Some(show) = show {
            xml.push_str(&format!("<show>{}</show>", escape_xml(show)));
        }
        if let Some(status) = status {
            xml.push_str(&format!("<status>{}</status>", escape_xml(status)));
        }
        xml.push_str("</presence>");
        self.inner
            .writer_handle()
            .ok_or(XmppError::NotConnected)?
            .submit(xml, None)
    }

    fn presence_to(&self, to: &BareJid, presence_type: &str) -> Result<(), XmppError> {
        self.inner
            .writer_handle()
            .ok_or(XmppError::NotConnected)?
            .submit(
                format!("<presence to='{}' type='{}'/>", to, presence_type),
                None,
            )
    }

    /// Ask a contact for a presence subscription.
    pub fn request_subscription(&self, to: &BareJid) -> Result<(), XmppError> {
        self.presence_to(to, "subscribe")
    }

    /// Approve a contact's subscription request.
    pub fn approve_subscription(&self, to: &BareJid) -> Result<(), XmppError> {
        self.presence_to(to, "subscribed")
    }

    /// Decline (or revoke) a contact's subscription.
    pub fn refuse_subscription(&self, to: &BareJid) -> Result<(), XmppError> {
        self.presence_to(to, "unsubscribed")
    }

    /// Cancel our subscription to a contact.
    pub fn cancel_subscription(&self, to: &BareJid) -> Result<(), XmppError> {
        self.presence_to(to, "unsubscribe")
    }

    // ── Roster ───────────────────────────────────────────────────────

    pub fn roster_items(&self) -> Vec<RosterItem> {
        self.inner.roster.snapshot()
    }

    /// Add or update a roster item at the server.
    pub fn roster_set(
        &self,
        item: &RosterItem,
        completion: Option<DeliveryCallback>,
    ) -> Result<u32, XmppError> {
        let body = format!(
            "<query xmlns='{}'>{}</query>",
            ns::ROSTER,
            element_to_string(&item.to_element())?
        );
        let mut completion = completion;
        let policy = RetryPolicy::from_config(&self.inner.config_snapshot());
        self.inner.send_iq(
            "set",
            None,
            &body,
            Box::new(move |response| {
                if let Some(cb) = completion.take() {
                    cb(response.ok);
                }
            }),
            policy,
        )
    }

    /// Remove a roster item at the server.
    pub fn roster_remove(
        &self,
        jid: &BareJid,
        completion: Option<DeliveryCallback>,
    ) -> Result<u32, XmppError> {
        let body = format!(
            "<query xmlns='{}'><item jid='{}' subscription='remove'/></query>",
            ns::ROSTER,
            jid
        );
        let mut completion = completion;
        let policy = RetryPolicy::from_config(&self.inner.config_snapshot());
        self.inner.send_iq(
            "set",
            None,
            &body,
            Box::new(move |response| {
                if let Some(cb) = completion.take() {
                    cb(response.ok);
                }
            }),
            policy,
        )
    }

    // ── Discovery, version, search, registration ─────────────────────

    pub async fn disco_info(
        &self,
        to: Option<&str>,
        timeout: Duration,
    ) -> Result<DiscoInfo, XmppError> {
        let payload = self
            .iq_get_sync(to, &disco::info_request(), timeout)
            .await?;
        let query = disco::query_of(&payload, ns::DISCO_INFO)?;
        Ok(DiscoInfo::from_element(query))
    }

    pub async fn disco_items(
        &self,
        to: Option<&str>,
        timeout: Duration,
    ) -> Result<DiscoItems, XmppError> {
        let payload = self
            .iq_get_sync(to, &disco::items_request(), timeout)
            .await?;
        let query = disco::query_of(&payload, ns::DISCO_ITEMS)?;
        Ok(DiscoItems::from_element(query))
    }

    pub async fn query_version(
        &self,
        to: Option<&str>,
        timeout: Duration,
    ) -> Result<SoftwareVersion, XmppError> {
        let payload = self
            .iq_get_sync(to, &xep0092::version_request(), timeout)
            .await?;
        SoftwareVersion::from_element(&payload)
    }

    /// Ask a search service which fields it supports.
    pub async fn search_fields(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<SearchFields, XmppError> {
        let payload = self
            .iq_get_sync(Some(service), &xep0055::fields_request(), timeout)
            .await?;
        SearchFields::from_element(&payload)
    }

    /// Legacy fixed-field search.
    pub async fn search(
        &self,
        service: &str,
        criteria: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<SearchResult, XmppError> {
        let body = xep0055::search_request(criteria);
        let payload = self
            .iq_set_sync(Some(service), &body, timeout)
            .await?
            .ok_or_else(|| XmppError::xml_parse("search result carried no payload"))?;
        SearchResult::from_element(&payload)
    }

    /// Form-based search; the form is signed when signature keys are
    /// configured.
    pub async fn search_with_form(
        &self,
        service: &str,
        mut form: DataForm,
        timeout: Duration,
    ) -> Result<SearchResult, XmppError> {
        let config = self.inner.config_snapshot();
        if let (Some(key), Some(secret)) =
            (&config.form_signature_key, &config.form_signature_secret)
        {
            form.sign(key, secret)?;
        }
        let body = xep0055::form_search_request(&form)?;
        let payload = self
            .iq_set_sync(Some(service), &body, timeout)
            .await?
            .ok_or_else(|| XmppError::xml_parse("search result carried no payload"))?;
        SearchResult::from_element(&payload)
    }

    /// Fetch the registration form (XEP-0077) and publish it as an event.
    pub async fn fetch_registration_form(
        &self,
        timeout: Duration,
    ) -> Result<RegistrationFields, XmppError> {
        let payload = self
            .iq_get_sync(None, &xep0077::fields_request(), timeout)
            .await?;
        let fields = RegistrationFields::from_element(&payload)?;
        self.inner.emit(
            "account.registration.form",
            EventPayload::RegistrationFormReceived {
                from: self.inner.config_snapshot().host,
                form: element_to_string(&payload).unwrap_or_default(),
            },
        );
        Ok(fields)
    }

    /// Fetch the same form for a password-change flow.
    pub async fn fetch_password_change_form(
        &self,
        timeout: Duration,
    ) -> Result<RegistrationFields, XmppError> {
        let payload = self
            .iq_get_sync(None, &xep0077::fields_request(), timeout)
            .await?;
        let fields = RegistrationFields::from_element(&payload)?;
        self.inner.emit(
            "account.password.form",
            EventPayload::PasswordChangeFormReceived {
                from: self.inner.config_snapshot().host,
                form: element_to_string(&payload).unwrap_or_default(),
            },
        );
        Ok(fields)
    }

    /// Change the account password. On success the configured secret is
    /// replaced with the new plaintext, discarding any stored hash.
    pub async fn change_password(
        &self,
        new_password: &str,
        timeout: Duration,
    ) -> Result<(), XmppError> {
        let user = self.inner.config_snapshot().user;
        let body = xep0077::password_change(&user, new_password);
        self.iq_set_sync(None, &body, timeout).await?;

        {
            let mut config = self.inner.config.lock().expect("config mutex poisoned");
            config.secret = Secret::password(new_password);
        }
        self.inner
            .emit("account.password.changed", EventPayload::PasswordChanged);
        Ok(())
    }

    /// Cancel the account registration.
    pub async fn unregister(&self, timeout: Duration) -> Result<(), XmppError> {
        self.iq_set_sync(None, &xep0077::unregister_request(), timeout)
            .await?;
        Ok(())
    }

    // ── Handler registration passthrough ─────────────────────────────

    pub fn register_iq_get(
        &self,
        local: &str,
        namespace: &str,
        handler: IqHandler,
        publish_as_feature: bool,
    ) -> Result<(), XmppError> {
        self.inner
            .registry
            .register_iq_get(local, namespace, handler, publish_as_feature)
    }

    pub fn register_iq_set(
        &self,
        local: &str,
        namespace: &str,
        handler: IqHandler,
        publish_as_feature: bool,
    ) -> Result<(), XmppError> {
        self.inner
            .registry
            .register_iq_set(local, namespace, handler, publish_as_feature)
    }

    pub fn register_message(
        &self,
        local: &str,
        namespace: &str,
        handler: MessageHandler,
        publish_as_feature: bool,
    ) -> Result<(), XmppError> {
        self.inner
            .registry
            .register_message(local, namespace, handler, publish_as_feature)
    }

    pub fn unregister_iq_get(
        &self,
        local: &str,
        namespace: &str,
        handler: &IqHandler,
    ) -> Result<(), XmppError> {
        self.inner.registry.unregister_iq_get(local, namespace, handler)
    }

    pub fn unregister_iq_set(
        &self,
        local: &str,
        namespace: &str,
        handler: &IqHandler,
    ) -> Result<(), XmppError> {
        self.inner.registry.unregister_iq_set(local, namespace, handler)
    }

    pub fn unregister_message(
        &self,
        local: &str,
        namespace: &str,
        handler: &MessageHandler,
    ) -> Result<(), XmppError> {
        self.inner
            .registry
            .unregister_message(local, namespace, handler)
    }

    /// The feature set advertised in disco#info responses.
    pub fn advertised_features(&self) -> Vec<String> {
        self.inner.registry.features()
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Soft shutdown: emit the stream footer, let the queue drain, close.
    pub async fn dispose(&self) {
        let writer = self.inner.writer_handle();
        if let Some(writer) = writer {
            let (tx, rx) = oneshot::channel();
            let _ = writer.submit(
                "</stream:stream>".to_string(),
                Some(Box::new(move |_| {
                    let _ = tx.send(());
                })),
            );
            let _ = tokio::time::timeout(Duration::from_secs(2), rx).await;
        }
        self.inner.teardown(ConnectionState::Offline);
    }

    /// Abrupt shutdown.
    pub fn hard_offline(&self) {
        self.inner.teardown(ConnectionState::Offline);
    }

    /// Reconnect after `dispose`/`hard_offline`. The previously bound
    /// resource is reused and the roster is not refetched.
    pub async fn reconnect(&self) -> Result<(), XmppError> {
        if !matches!(
            self.state(),
            ConnectionState::Offline | ConnectionState::Error
        ) {
            return Err(XmppError::internal("reconnect requires an offline client"));
        }
        self.connect().await
    }
}

/// Build a plain chat message element.
pub fn chat_message(to: &str, body: &str) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr("to", to)
        .attr("type", "chat")
        .append(
            Element::builder("body", ns::JABBER_CLIENT)
                .append(String::from(body))
                .build(),
        )
        .build()
}

// ── Connect / negotiate ──────────────────────────────────────────────

async fn run_connect(inner: Arc<ClientInner>) -> Result<(), XmppError> {
    loop {
        let (host, port) = {
            let config = inner.config.lock().expect("config mutex poisoned");
            (config.host.clone(), config.port)
        };

        inner.set_state(ConnectionState::Connecting);
        let stream = match transport::open_tcp(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                inner.emit(
                    "connection.error",
                    EventPayload::ConnectionError {
                        message: e.to_string(),
                        recoverable: e.is_recoverable(),
                    },
                );
                inner.set_state(ConnectionState::Error);
                return Err(e);
            }
        };

        match negotiate(&inner, stream).await {
            Ok(established) => {
                spawn_session(&inner, established);
                inner.set_state(ConnectionState::Connected);
                return Ok(());
            }
            Err(XmppError::Stream {
                condition: StreamErrorCondition::SeeOtherHost,
                text: Some(target),
            }) => {
                let (new_host, new_port) = split_host_port(&target);
                debug!(host = %new_host, "following see-other-host redirect");
                let mut config = inner.config.lock().expect("config mutex poisoned");
                config.host = new_host;
                if let Some(new_port) = new_port {
                    config.port = new_port;
                }
                // Everything else (credentials, flags) is preserved.
            }
            Err(e) => {
                inner.emit(
                    "connection.error",
                    EventPayload::ConnectionError {
                        message: e.to_string(),
                        recoverable: e.is_recoverable(),
                    },
                );
                inner.set_state(ConnectionState::Error);
                return Err(e);
            }
        }
    }
}

/// A negotiated session ready for the read loop: the stream plus the
/// framing state it was left in, and any stanzas that arrived in the same
/// read as the handshake tail.
struct Established {
    stream: BoxStream,
    tokenizer: StreamTokenizer,
    utf8: Utf8Reader,
    backlog: VecDeque<StreamEvent>,
}

async fn send_handshake(
    inner: &ClientInner,
    stream: &mut BoxStream,
    payload: &str,
) -> Result<(), XmppError> {
    inner.sniff_out(payload);
    stream.write_all(payload.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn stream_preamble(config: &ClientConfig) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream from='{}' to='{}' version='1.0' \
         xml:lang='{}' xmlns='{}' xmlns:stream='{}'>",
        config.bare_jid(),
        config.host,
        config.language,
        ns::JABBER_CLIENT,
        ns::STREAM
    )
}

async fn start_authentication(
    inner: &ClientInner,
    stream: &mut BoxStream,
    offered: &HashSet<String>,
) -> Result<Box<dyn Mechanism>, XmppError> {
    let config = inner.config_snapshot();
    let selected = select_mechanism(offered, &config).ok_or_else(|| {
        XmppError::auth_failed(format!(
            "no acceptable SASL mechanism; server offers: {}",
            offered.iter().cloned().collect::<Vec<_>>().join(", ")
        ))
    })?;
    debug!(mechanism = %selected, "selected SASL mechanism");

    let mut mechanism = build_mechanism(selected, &config.user, &config.host, &config.secret)?;
    let payload = match mechanism.initial()? {
        Some(data) if !data.is_empty() => BASE64_STANDARD.encode(data),
        _ => "=".to_string(),
    };

    inner.set_state(ConnectionState::Authenticating);
    send_handshake(
        inner,
        stream,
        &format!(
            "<auth xmlns='{}' mechanism='{}'>{}</auth>",
            ns::SASL,
            selected.name(),
            payload
        ),
    )
    .await?;
    Ok(mechanism)
}

async fn negotiate(
    inner: &Arc<ClientInner>,
    mut stream: BoxStream,
) -> Result<Established, XmppError> {
    let config = inner.config_snapshot();
    let (prev_resource, roster_fetched) = {
        let identity = inner.identity.lock().expect("identity mutex poisoned");
        (identity.resource.clone(), identity.roster_fetched)
    };
    let resource = prev_resource.or_else(|| config.resource.clone());

    let mut tokenizer = StreamTokenizer::new();
    let mut utf8 = Utf8Reader::new();
    let mut buf = [0u8; 8192];
    let mut queue: VecDeque<StreamEvent> = VecDeque::new();

    send_handshake(inner, &mut stream, &stream_preamble(&config)).await?;
    inner.set_state(ConnectionState::StreamNegotiation);

    let mut tls_done = false;
    let mut authenticated = false;
    let mut mechanism: Option<Box<dyn Mechanism>> = None;
    let mut offered: HashSet<String> = HashSet::new();
    let mut register_offered = false;
    let mut registration_attempted = false;

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(XmppError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during negotiation",
            )));
        }
        queue.extend(tokenizer.feed(&utf8.push(&buf[..n])?)?);

        while let Some(event) = queue.pop_front() {
            let fragment = match event {
                StreamEvent::Header(_) => continue,
                StreamEvent::Closed => {
                    return Err(XmppError::stream(
                        StreamErrorCondition::Reset,
                        Some("stream closed during negotiation".to_string()),
                    ));
                }
                StreamEvent::Stanza(fragment) => fragment,
            };

            inner.sniff_in(&fragment);
            let element = parse_fragment(&fragment)?;

            match (element.name(), element.ns().as_str()) {
                ("features", ns::STREAM) => {
                    if element.get_child("register", ns::REGISTER_FEATURE).is_some() {
                        register_offered = true;
                    }

                    if element.get_child("starttls", ns::TLS).is_some() && !tls_done {
                        inner.set_state(ConnectionState::StartingEncryption);
                        send_handshake(
                            inner,
                            &mut stream,
                            &format!("<starttls xmlns='{}'/>", ns::TLS),
                        )
                        .await?;
                    } else if let Some(mechanisms) = element.get_child("mechanisms", ns::SASL) {
                        if !authenticated {
                            offered = mechanisms
                                .children()
                                .filter(|c| c.name() == "mechanism")
                                .map(|c| c.text())
                                .collect();
                            mechanism =
                                Some(start_authentication(inner, &mut stream, &offered).await?);
                        } else if element.get_child("bind", ns::BIND).is_some() {
                            inner.set_state(ConnectionState::Binding);
                            send_bind(inner, &mut stream, resource.as_deref()).await?;
                        }
                    } else if element.get_child("bind", ns::BIND).is_some() && authenticated {
                        inner.set_state(ConnectionState::Binding);
                        send_bind(inner, &mut stream, resource.as_deref()).await?;
                    } else if !authenticated && !offered.is_empty() {
                        // Re-entry after TLS with nothing new required.
                        mechanism =
                            Some(start_authentication(inner, &mut stream, &offered).await?);
                    }
                }
                ("proceed", ns::TLS) => {
                    stream =
                        transport::upgrade_tls(stream, &config.host, config.trust_server).await?;
                    tls_done = true;
                    tokenizer.reset();
                    utf8 = Utf8Reader::new();
                    queue.clear();
                    send_handshake(inner, &mut stream, &stream_preamble(&config)).await?;
                    inner.set_state(ConnectionState::StreamNegotiation);
                }
                ("failure", ns::TLS) => {
                    return Err(XmppError::internal("server refused STARTTLS"));
                }
                ("challenge", ns::SASL) => {
                    let data = BASE64_STANDARD
                        .decode(element.text().trim())
                        .map_err(|_| XmppError::auth_failed("undecodable SASL challenge"))?;
                    let mech = mechanism
                        .as_mut()
                        .ok_or_else(|| XmppError::internal("challenge without a mechanism"))?;
                    let response = mech.respond(&data)?;
                    let payload = if response.is_empty() {
                        "=".to_string()
                    } else {
                        BASE64_STANDARD.encode(response)
                    };
                    send_handshake(
                        inner,
                        &mut stream,
                        &format!("<response xmlns='{}'>{}</response>", ns::SASL, payload),
                    )
                    .await?;
                }
                ("success", ns::SASL) => {
                    let data = BASE64_STANDARD
                        .decode(element.text().trim())
                        .unwrap_or_default();
                    if let Some(mech) = mechanism.as_mut() {
                        mech.verify_success(&data)?;
                    }
                    // Stream restart: only the authenticated identity
                    // survives; framing and the offered set are cleared.
                    authenticated = true;
                    mechanism = None;
                    offered.clear();
                    tokenizer.reset();
                    utf8 = Utf8Reader::new();
                    queue.clear();
                    send_handshake(inner, &mut stream, &stream_preamble(&config)).await?;
                    inner.set_state(ConnectionState::StreamNegotiation);
                }
                ("failure", ns::SASL) => {
                    let can_register = register_offered
                        && config.allow_registration
                        && !registration_attempted
                        && config.secret.plaintext().is_some();
                    if can_register {
                        registration_attempted = true;
                        inner.set_state(ConnectionState::Registering);
                        send_handshake(
                            inner,
                            &mut stream,
                            &format!(
                                "<iq type='get' id='{}'>{}</iq>",
                                REGISTER_FORM_ID,
                                xep0077::fields_request()
                            ),
                        )
                        .await?;
                    } else {
                        return Err(classify_sasl_failure(&element));
                    }
                }
                ("iq", ns::JABBER_CLIENT) => {
                    let id = element.attr("id").unwrap_or_default();
                    let is_result = element.attr("type") == Some("result");

                    match id {
                        BIND_ID => {
                            if !is_result {
                                return Err(stanza_error_from(
                                    element.get_child("error", ns::JABBER_CLIENT),
                                ));
                            }
                            let jid_text = element
                                .get_child("bind", ns::BIND)
                                .and_then(|bind| bind.get_child("jid", ns::BIND))
                                .map(|jid| jid.text())
                                .ok_or_else(|| {
                                    XmppError::xml_parse("bind result lacks a jid")
                                })?;
                            let full: FullJid = jid_text.trim().parse()?;
                            {
                                let mut identity =
                                    inner.identity.lock().expect("identity mutex poisoned");
                                identity.resource = Some(full.resource().to_string());
                                identity.full_jid = Some(full);
                            }

                            if config.request_roster_on_startup && !roster_fetched {
                                inner.set_state(ConnectionState::FetchingRoster);
                                send_handshake(
                                    inner,
                                    &mut stream,
                                    &format!(
                                        "<iq type='get' id='{}'><query xmlns='{}'/></iq>",
                                        ROSTER_ID,
                                        ns::ROSTER
                                    ),
                                )
                                .await?;
                            } else {
                                finish_presence(inner, &mut stream).await?;
                                return Ok(Established {
                                    stream,
                                    tokenizer,
                                    utf8,
                                    backlog: queue,
                                });
                            }
                        }
                        ROSTER_ID => {
                            if !is_result {
                                return Err(stanza_error_from(
                                    element.get_child("error", ns::JABBER_CLIENT),
                                ));
                            }
                            let items = element
                                .get_child("query", ns::ROSTER)
                                .map(parse_roster_query)
                                .transpose()?
                                .unwrap_or_default();
                            let entries =
                                items.iter().map(RosterItem::to_entry).collect::<Vec<_>>();
                            inner.roster.replace_all(items);
                            {
                                let mut identity =
                                    inner.identity.lock().expect("identity mutex poisoned");
                                identity.roster_fetched = true;
                            }
                            inner.emit(
                                "roster.received",
                                EventPayload::RosterReceived { items: entries },
                            );

                            finish_presence(inner, &mut stream).await?;
                            return Ok(Established {
                                stream,
                                tokenizer,
                                utf8,
                                backlog: queue,
                            });
                        }
                        REGISTER_FORM_ID => {
                            if !is_result {
                                return Err(stanza_error_from(
                                    element.get_child("error", ns::JABBER_CLIENT),
                                ));
                            }
                            if let Some(query) = element.get_child("query", ns::REGISTER) {
                                inner.emit(
                                    "account.registration.form",
                                    EventPayload::RegistrationFormReceived {
                                        from: config.host.clone(),
                                        form: element_to_string(query).unwrap_or_default(),
                                    },
                                );
                            }
                            let password = config.secret.plaintext().unwrap_or_default();
                            send_handshake(
                                inner,
                                &mut stream,
                                &format!(
                                    "<iq type='set' id='{}'>{}</iq>",
                                    REGISTER_SUBMIT_ID,
                                    xep0077::registration_submit(&[
                                        ("username", config.user.as_str()),
                                        ("password", password),
                                    ])
                                ),
                            )
                            .await?;
                        }
                        REGISTER_SUBMIT_ID => {
                            if !is_result {
                                return Err(stanza_error_from(
                                    element.get_child("error", ns::JABBER_CLIENT),
                                ));
                            }
                            debug!("in-band registration succeeded, retrying SASL");
                            mechanism =
                                Some(start_authentication(inner, &mut stream, &offered).await?);
                        }
                        _ => debug!(id, "ignoring unexpected iq during negotiation"),
                    }
                }
                ("error", ns::STREAM) => {
                    return Err(classify_stream_error(&element));
                }
                (name, _) => {
                    debug!(name, "ignoring stanza during negotiation");
                }
            }
        }
    }
}

async fn send_bind(
    inner: &ClientInner,
    stream: &mut BoxStream,
    resource: Option<&str>,
) -> Result<(), XmppError> {
    let body = match resource {
        Some(resource) => format!(
            "<bind xmlns='{}'><resource>{}</resource></bind>",
            ns::BIND,
            escape_xml(resource)
        ),
        None => format!("<bind xmlns='{}'/>", ns::BIND),
    };
    send_handshake(
        inner,
        stream,
        &format!("<iq type='set' id='{}'>{}</iq>", BIND_ID, body),
    )
    .await
}

async fn finish_presence(inner: &ClientInner, stream: &mut BoxStream) -> Result<(), XmppError> {
    inner.set_state(ConnectionState::SettingPresence);
    send_handshake(inner, stream, "<presence/>").await
}

// ── Session tasks ────────────────────────────────────────────────────

fn spawn_session(inner: &Arc<ClientInner>, established: Established) {
    let Established {
        stream,
        tokenizer,
        utf8,
        backlog,
    } = established;

    inner.shutdown.send_replace(false);
    let (read_half, write_half) = tokio::io::split(stream);

    let failure_inner = inner.clone();
    let queue = spawn_writer(
        write_half,
        inner.sniffer.clone(),
        Box::new(move |error| failure_inner.on_transport_failure(error)),
    );
    *inner.writer.lock().expect("writer mutex poisoned") = Some(queue);

    let read_inner = inner.clone();
    let read_shutdown = inner.shutdown.subscribe();
    tokio::spawn(read_loop(
        read_inner,
        read_half,
        tokenizer,
        utf8,
        backlog,
        read_shutdown,
    ));

    let tick_inner = inner.clone();
    let tick_shutdown = inner.shutdown.subscribe();
    tokio::spawn(tick_loop(tick_inner, tick_shutdown));
}

async fn read_loop(
    inner: Arc<ClientInner>,
    mut read_half: ReadHalf<BoxStream>,
    mut tokenizer: StreamTokenizer,
    mut utf8: Utf8Reader,
    mut backlog: VecDeque<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 8192];

    loop {
        while let Some(event) = backlog.pop_front() {
            match event {
                StreamEvent::Header(_) => {}
                StreamEvent::Closed => {
                    inner.on_stream_closed();
                    return;
                }
                StreamEvent::Stanza(fragment) => {
                    inner.sniff_in(&fragment);
                    match parse_fragment(&fragment) {
                        Ok(element) => dispatch_stanza(&inner, element),
                        Err(e) => {
                            inner.on_transport_failure(e);
                            return;
                        }
                    }
                }
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        inner.on_stream_closed();
                        return;
                    }
                    Ok(n) => {
                        match utf8.push(&buf[..n]).and_then(|text| tokenizer.feed(&text)) {
                            Ok(events) => backlog.extend(events),
                            Err(e) => {
                                inner.on_transport_failure(e);
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        inner.on_transport_failure(XmppError::Io(e));
                        return;
                    }
                }
            }
        }
    }
}

async fn tick_loop(inner: Arc<ClientInner>, mut shutdown: watch::Receiver<bool>) {
    let keep_alive = inner.config_snapshot().keep_alive_seconds;
    let half_keep_alive = Duration::from_millis(keep_alive * 1000 / 2);
    let mut next_ping_due = Instant::now() + half_keep_alive;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let work = inner.pending.due(now);
                for stanza in work.retransmit {
                    inner.submit(stanza, None);
                }
                for (callback, response) in work.expired {
                    invoke_iq_callback(callback, response);
                }

                // Piggy-backed keep-alive; the ping is not tracked.
                if keep_alive > 0 && now >= next_ping_due {
                    inner.submit(" ".to_string(), None);
                    next_ping_due = now + half_keep_alive;
                }
            }
        }
    }
}

// ── Dispatch (stanza routing) ────────────────────────────────────────

fn dispatch_stanza(inner: &Arc<ClientInner>, stanza: Element) {
    match (stanza.name(), stanza.ns().as_str()) {
        ("iq", ns::JABBER_CLIENT) => dispatch_iq(inner, &stanza),
        ("message", ns::JABBER_CLIENT) => dispatch_message(inner, &stanza),
        ("presence", ns::JABBER_CLIENT) => dispatch_presence(inner, &stanza),
        ("error", ns::STREAM) => {
            let error = classify_stream_error(&stanza);
            // See-other-host: replace the host and reconnect with
            // everything else preserved.
            if let XmppError::Stream {
                condition: StreamErrorCondition::SeeOtherHost,
                text: Some(target),
            } = &error
            {
                let (new_host, new_port) = split_host_port(target);
                {
                    let mut config = inner.config.lock().expect("config mutex poisoned");
                    config.host = new_host;
                    if let Some(port) = new_port {
                        config.port = port;
                    }
                }
                inner.teardown(ConnectionState::Offline);
                let reconnect_inner = inner.clone();
                tokio::spawn(async move {
                    let _ = run_connect(reconnect_inner).await;
                });
                return;
            }
            inner.on_transport_failure(error);
        }
        ("features", ns::STREAM) => {}
        (name, _) => debug!(name, "ignoring unexpected top-level element"),
    }
}

fn dispatch_iq(inner: &Arc<ClientInner>, stanza: &Element) {
    let iq_type = stanza.attr("type").unwrap_or_default();
    let id = stanza.attr("id").unwrap_or_default().to_string();
    let from = stanza.attr("from").map(String::from);
    let to = stanza.attr("to").map(String::from);

    match iq_type {
        "get" | "set" => {
            let is_set = iq_type == "set";
            let Some((handler, child)) = inner.registry.lookup_iq(is_set, stanza) else {
                inner.reply_error(
                    stanza,
                    StanzaErrorCondition::FeatureNotImplemented,
                    StanzaErrorType::Cancel,
                    None,
                );
                return;
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&child, stanza)));
            match outcome {
                Ok(Ok(IqReply::Empty)) => inner.reply_result(stanza, None),
                Ok(Ok(IqReply::Payload(payload))) => inner.reply_result(stanza, Some(payload)),
                Ok(Ok(IqReply::Handled)) => {}
                Ok(Err(XmppError::Stanza {
                    condition,
                    error_type,
                    text,
                })) => inner.reply_error(stanza, condition, error_type, text.as_deref()),
                Ok(Err(other)) => {
                    warn!(error = %other, "iq handler failed");
                    inner.emit(
                        "error.handler",
                        EventPayload::ErrorOccurred {
                            component: "iq-handler".to_string(),
                            message: other.to_string(),
                        },
                    );
                    inner.reply_error(
                        stanza,
                        StanzaErrorCondition::InternalServerError,
                        StanzaErrorType::Wait,
                        None,
                    );
                }
                Err(_) => {
                    warn!("iq handler panicked");
                    inner.reply_error(
                        stanza,
                        StanzaErrorCondition::InternalServerError,
                        StanzaErrorType::Wait,
                        None,
                    );
                }
            }
        }
        "result" => {
            let payload = stanza.children().next().cloned();
            if let Some((callback, response)) = inner.pending.resolve(&id, true, payload, from, to)
            {
                invoke_iq_callback(callback, response);
            }
        }
        "error" => {
            let payload = stanza.get_child("error", ns::JABBER_CLIENT).cloned();
            if let Some((callback, response)) = inner.pending.resolve(&id, false, payload, from, to)
            {
                invoke_iq_callback(callback, response);
            }
        }
        other => debug!(iq_type = other, "ignoring iq with unknown type"),
    }
}

fn dispatch_message(inner: &Arc<ClientInner>, stanza: &Element) {
    if let Some((handler, content)) = inner.registry.lookup_message(stanza) {
        if catch_unwind(AssertUnwindSafe(|| handler(&content, stanza))).is_err() {
            warn!("message handler panicked");
        }
        return;
    }

    let kind = match stanza.attr("type") {
        Some("chat") => ChatKind::Chat,
        Some("error") => ChatKind::Error,
        Some("groupchat") => ChatKind::GroupChat,
        Some("headline") => ChatKind::Headline,
        _ => ChatKind::Normal,
    };
    let channel = match kind {
        ChatKind::Chat => "message.chat",
        ChatKind::Error => "message.error",
        ChatKind::GroupChat => "message.groupchat",
        ChatKind::Headline => "message.headline",
        ChatKind::Normal => "message.normal",
    };
    let body = stanza
        .get_child("body", ns::JABBER_CLIENT)
        .map(|body| body.text());

    inner.emit(
        channel,
        EventPayload::MessageReceived {
            kind,
            from: stanza.attr("from").unwrap_or_default().to_string(),
            body,
            stanza: element_to_string(stanza).unwrap_or_default(),
        },
    );
}

fn dispatch_presence(inner: &Arc<ClientInner>, stanza: &Element) {
    let from_text = stanza.attr("from").unwrap_or_default().to_string();
    let from: Option<Jid> = from_text.parse().ok();

    match stanza.attr("type") {
        None | Some("unavailable") => {
            let available = stanza.attr("type").is_none();
            let update = PresenceUpdate {
                from: from_text.clone(),
                available,
                show: stanza
                    .get_child("show", ns::JABBER_CLIENT)
                    .map(|show| show.text()),
                status: stanza
                    .get_child("status", ns::JABBER_CLIENT)
                    .map(|status| status.text()),
            };
            if let Some(jid) = &from {
                let cache_update = available.then(|| update.clone());
                inner.roster.apply_presence(jid, cache_update);
            }
            inner.emit(
                "presence.changed",
                EventPayload::PresenceChanged { update },
            );
        }
        Some("subscribe") => inner.emit(
            "presence.subscription.requested",
            EventPayload::SubscriptionRequested { from: from_text },
        ),
        Some("subscribed") => inner.emit(
            "presence.subscription.granted",
            EventPayload::SubscriptionGranted { from: from_text },
        ),
        Some("unsubscribe") => inner.emit(
            "presence.subscription.withdrawn",
            EventPayload::SubscriptionWithdrawn { from: from_text },
        ),
        Some("unsubscribed") => inner.emit(
            "presence.subscription.declined",
            EventPayload::SubscriptionDeclined { from: from_text },
        ),
        Some("probe") => inner.emit(
            "presence.probe",
            EventPayload::PresenceProbe { from: from_text },
        ),
        Some("error") => inner.emit(
            "presence.error",
            EventPayload::PresenceError {
                from: from_text,
                stanza: element_to_string(stanza).unwrap_or_default(),
            },
        ),
        Some(other) => debug!(presence_type = other, "ignoring unknown presence type"),
    }
}

// ── Default handlers ─────────────────────────────────────────────────

fn install_default_handlers(inner: &Arc<ClientInner>) {
    let must = |result: Result<(), XmppError>| {
        result.expect("default handler registration cannot conflict");
    };

    // Roster push (RFC 6121): apply, notify, ack with an empty result.
    let weak = Arc::downgrade(inner);
    must(inner.registry.register_iq_set(
        "query",
        ns::ROSTER,
        Arc::new(move |child, _stanza| {
            let Some(inner) = weak.upgrade() else {
                return Ok(IqReply::Empty);
            };
            for item_elem in child
                .children()
                .filter(|c| c.name() == "item" && c.ns() == ns::ROSTER)
            {
                let item = RosterItem::from_element(item_elem)?;
                match inner.roster.apply_item(item) {
                    RosterChange::Added(item) => inner.emit(
                        "roster.item.added",
                        EventPayload::RosterItemAdded {
                            item: item.to_entry(),
                        },
                    ),
                    RosterChange::Updated(item) => inner.emit(
                        "roster.item.updated",
                        EventPayload::RosterItemUpdated {
                            item: item.to_entry(),
                        },
                    ),
                    RosterChange::Removed(jid) => inner.emit(
                        "roster.item.removed",
                        EventPayload::RosterItemRemoved {
                            jid: jid.to_string(),
                        },
                    ),
                    RosterChange::Unchanged => {}
                }
            }
            Ok(IqReply::Empty)
        }),
        false,
    ));

    // Service discovery info (XEP-0030).
    let weak = Arc::downgrade(inner);
    must(inner.registry.register_iq_get(
        "query",
        ns::DISCO_INFO,
        Arc::new(move |_child, _stanza| {
            let Some(inner) = weak.upgrade() else {
                return Ok(IqReply::Empty);
            };
            let features = inner.registry.features();
            Ok(IqReply::Payload(disco::build_info_response(
                &Identity::client(Some("perch")),
                &features,
            )))
        }),
        true,
    ));

    // Software version (XEP-0092).
    must(inner.registry.register_iq_get(
        "query",
        ns::VERSION,
        Arc::new(|_child, _stanza| Ok(IqReply::Payload(SoftwareVersion::own().to_element()))),
        true,
    ));

    // QoS acknowledged delivery: ack first, then dispatch locally.
    let weak = Arc::downgrade(inner);
    must(inner.registry.register_iq_set(
        "acknowledged",
        ns::QOS,
        Arc::new(move |child, stanza| {
            let Some(inner) = weak.upgrade() else {
                return Ok(IqReply::Empty);
            };
            let message = child.children().next().cloned().ok_or_else(|| {
                XmppError::bad_request(Some("acknowledged element is empty".to_string()))
            })?;
            inner.reply_result(stanza, None);
            if message.name() == "message" {
                dispatch_message(&inner, &message);
            }
            Ok(IqReply::Handled)
        }),
        true,
    ));

    // QoS assured delivery, receive phase: admission control, then the
    // receipt. The message is parked until the deliver phase.
    let weak = Arc::downgrade(inner);
    must(inner.registry.register_iq_set(
        "assured",
        ns::QOS,
        Arc::new(move |child, stanza| {
            let Some(inner) = weak.upgrade() else {
                return Ok(IqReply::Empty);
            };
            let from: Jid = stanza
                .attr("from")
                .ok_or_else(|| {
                    XmppError::bad_request(Some("assured iq lacks a 'from'".to_string()))
                })?
                .parse()
                .map_err(|_| {
                    XmppError::stanza(StanzaErrorCondition::JidMalformed, None)
                })?;
            let msg_id = child.attr("msgId").ok_or_else(|| {
                XmppError::bad_request(Some("assured element lacks a msgId".to_string()))
            })?;
            let message = child.children().next().cloned().ok_or_else(|| {
                XmppError::bad_request(Some("assured element is empty".to_string()))
            })?;

            let bare = from.to_bare();
            let config = inner.config_snapshot();
            inner.assured.admit(
                &bare,
                msg_id,
                message,
                inner.roster.contains(&bare),
                config.max_assured_pending_from_source,
                config.max_assured_pending_total,
            )?;
            Ok(IqReply::Payload(qos::received_response(msg_id)))
        }),
        true,
    ));

    // QoS assured delivery, deliver phase: hand the parked message over.
    let weak = Arc::downgrade(inner);
    must(inner.registry.register_iq_set(
        "deliver",
        ns::QOS,
        Arc::new(move |child, stanza| {
            let Some(inner) = weak.upgrade() else {
                return Ok(IqReply::Empty);
            };
            let from: Jid = stanza
                .attr("from")
                .ok_or_else(|| {
                    XmppError::bad_request(Some("deliver iq lacks a 'from'".to_string()))
                })?
                .parse()
                .map_err(|_| XmppError::stanza(StanzaErrorCondition::JidMalformed, None))?;
            let msg_id = child.attr("msgId").ok_or_else(|| {
                XmppError::bad_request(Some("deliver element lacks a msgId".to_string()))
            })?;

            match inner.assured.take(&from.to_bare(), msg_id) {
                Some(message) => {
                    inner.reply_result(stanza, None);
                    if message.name() == "message" {
                        dispatch_message(&inner, &message);
                    }
                    Ok(IqReply::Handled)
                }
                None => Err(XmppError::item_not_found(Some(
                    "no assured message with that id".to_string(),
                ))),
            }
        }),
        true,
    ));

    // Dynamic form updates arriving as messages (XEP-0004).
    let weak = Arc::downgrade(inner);
    must(inner.registry.register_message(
        "x",
        ns::DATA_FORMS,
        Arc::new(move |content, stanza| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.emit(
                "form.updated",
                EventPayload::DynamicFormUpdated {
                    from: stanza.attr("from").unwrap_or_default().to_string(),
                    form: element_to_string(content).unwrap_or_default(),
                },
            );
        }),
        true,
    ));
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Second phase of an assured send: on a matching `<received/>`, emit the
/// `<deliver/>` request; its result completes the delivery.
fn assured_second_phase(
    weak: Weak<ClientInner>,
    to: String,
    msg_id: String,
    response: IqResponse,
    completion: Option<DeliveryCallback>,
) {
    let finish = move |ok: bool| {
        if let Some(cb) = completion {
            cb(ok);
        }
    };

    if !response.ok {
        finish(false);
        return;
    }
    let matched = response.payload.as_ref().is_some_and(|payload| {
        payload.name() == "received"
            && payload.ns() == ns::QOS
            && payload.attr("msgId") == Some(msg_id.as_str())
    });
    if !matched {
        warn!(%msg_id, "assured receipt missing or mismatched");
        finish(false);
        return;
    }
    let Some(inner) = weak.upgrade() else {
        finish(false);
        return;
    };

    let deliver = qos::deliver_request(&msg_id);
    let result = inner.send_iq(
        "set",
        Some(&to),
        &deliver,
        Box::new(move |deliver_response| finish(deliver_response.ok)),
        qos::qos_retry_policy(),
    );
    if result.is_err() {
        debug!(%msg_id, "deliver phase could not be sent");
    }
}

fn invoke_iq_callback(callback: IqCallback, response: IqResponse) {
    if catch_unwind(AssertUnwindSafe(move || callback(response))).is_err() {
        warn!("iq callback panicked");
    }
}

/// Map a `<stream:error/>` element to the error taxonomy. The
/// `see-other-host` payload ends up in the error text.
fn classify_stream_error(stanza: &Element) -> XmppError {
    let mut condition = StreamErrorCondition::UndefinedCondition;
    let mut text = None;
    let mut host = None;

    for child in stanza.children() {
        if child.ns() != ns::STREAMS {
            continue;
        }
        if child.name() == "text" {
            text = Some(child.text());
        } else if let Some(parsed) = StreamErrorCondition::from_str(child.name()) {
            condition = parsed;
            if parsed == StreamErrorCondition::SeeOtherHost {
                host = Some(child.text());
            }
        }
    }

    let text = if condition == StreamErrorCondition::SeeOtherHost {
        host
    } else {
        text
    };
    XmppError::stream(condition, text)
}

/// Map a SASL `<failure/>` element to the error taxonomy.
fn classify_sasl_failure(stanza: &Element) -> XmppError {
    let mut condition = SaslErrorCondition::NotAuthorized;
    let mut text = None;

    for child in stanza.children() {
        if child.name() == "text" {
            text = Some(child.text());
        } else if let Some(parsed) = SaslErrorCondition::from_str(child.name()) {
            condition = parsed;
        }
    }
    XmppError::Sasl { condition, text }
}

/// Map an `<error/>` payload from an iq-error to the error taxonomy.
fn stanza_error_from(payload: Option<&Element>) -> XmppError {
    let Some(error) = payload else {
        return XmppError::stanza(StanzaErrorCondition::UndefinedCondition, None);
    };

    let error_type = error
        .attr("type")
        .and_then(|t| match t {
            "auth" => Some(StanzaErrorType::Auth),
            "cancel" => Some(StanzaErrorType::Cancel),
            "modify" => Some(StanzaErrorType::Modify),
            "wait" => Some(StanzaErrorType::Wait),
            _ => None,
        });

    let mut condition = StanzaErrorCondition::UndefinedCondition;
    let mut text = None;
    for child in error.children() {
        if child.ns() != ns::STANZAS {
            continue;
        }
        if child.name() == "text" {
            text = Some(child.text());
        } else if let Some(parsed) = StanzaErrorCondition::from_str(child.name()) {
            condition = parsed;
        }
    }

    XmppError::Stanza {
        condition,
        error_type: error_type.unwrap_or_else(|| condition.default_type()),
        text,
    }
}

/// Split a `see-other-host` payload into host and optional port.
fn split_host_port(target: &str) -> (String, Option<u16>) {
    if let Some((host, port)) = target.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), Some(port));
        }
    }
    (target.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_stable() {
        assert_eq!(ConnectionState::StreamNegotiation.as_str(), "stream-negotiation");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[test]
    fn split_host_port_handles_both_forms() {
        assert_eq!(
            split_host_port("mirror.example.org"),
            ("mirror.example.org".to_string(), None)
        );
        assert_eq!(
            split_host_port("mirror.example.org:5223"),
            ("mirror.example.org".to_string(), Some(5223))
        );
        // A non-numeric suffix is part of the host.
        assert_eq!(split_host_port("weird:host"), ("weird:host".to_string(), None));
    }

    #[test]
    fn stream_error_classification_extracts_see_other_host() {
        let stanza = parse_fragment(
            "<stream:error><see-other-host xmlns='urn:ietf:params:xml:ns:xmpp-streams'>\
             mirror.example.org</see-other-host></stream:error>",
        )
        .unwrap();
        let error = classify_stream_error(&stanza);
        match error {
            XmppError::Stream { condition, text } => {
                assert_eq!(condition, StreamErrorCondition::SeeOtherHost);
                assert_eq!(text.as_deref(), Some("mirror.example.org"));
            }
            other => panic!("expected stream error, got {:?}", other),
        }
    }

    #[test]
    fn sasl_failure_classification() {
        let stanza = parse_fragment(
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>",
        )
        .unwrap();
        match classify_sasl_failure(&stanza) {
            XmppError::Sasl { condition, .. } => {
                assert_eq!(condition, SaslErrorCondition::NotAuthorized);
            }
            other => panic!("expected SASL error, got {:?}", other),
        }
    }

    #[test]
    fn stanza_error_parses_condition_type_and_text() {
        let iq = parse_fragment(
            "<iq type='error' id='9'><error type='cancel'>\
             <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>gone</text>\
             </error></iq>",
        )
        .unwrap();
        let error_elem = iq.get_child("error", ns::JABBER_CLIENT).cloned();
        match stanza_error_from(error_elem.as_ref()) {
            XmppError::Stanza {
                condition,
                error_type,
                text,
            } => {
                assert_eq!(condition, StanzaErrorCondition::ItemNotFound);
                assert_eq!(error_type, StanzaErrorType::Cancel);
                assert_eq!(text.as_deref(), Some("gone"));
            }
            other => panic!("expected stanza error, got {:?}", other),
        }
    }

    #[test]
    fn default_feature_set_covers_the_installed_handlers() {
        let client = Client::new(ClientConfig::new("example.org", "alice", "pw"));
        let features = client.advertised_features();
        assert!(features.contains(&ns::DISCO_INFO.to_string()));
        assert!(features.contains(&ns::VERSION.to_string()));
        assert!(features.contains(&ns::QOS.to_string()));
        assert!(features.contains(&ns::DATA_FORMS.to_string()));
    }

    #[test]
    fn chat_message_builder_sets_to_and_body() {
        let message = chat_message("peer@example.org", "hi there");
        assert_eq!(message.attr("to"), Some("peer@example.org"));
        assert_eq!(message.attr("type"), Some("chat"));
        assert_eq!(
            message
                .get_child("body", ns::JABBER_CLIENT)
                .map(|b| b.text()),
            Some("hi there".to_string())
        );
    }
}
