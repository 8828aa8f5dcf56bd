//! # perch-xmpp
//!
//! XMPP client core per RFC 6120/6121/6122: a long-lived XML stream
//! machine with STARTTLS and SASL negotiation, resource binding, pluggable
//! stanza handlers keyed by `(local-name, namespace)`, a retrying request
//! correlator, and a three-level QoS delivery engine (`urn:xmpp:qos`).
//!
//! ## Architecture
//!
//! - **Tokenizer**: incremental character-level framing of the open-ended
//!   stream document (`parser`)
//! - **Connection**: handshake state machine and stanza dispatch
//!   (`connection`)
//! - **Pending table**: request/response correlation with retry and
//!   exponential back-off (`pending`)
//! - **Write serializer**: single-writer FIFO over the transport
//! - **QoS**: unacknowledged / acknowledged / assured delivery with
//!   admission control (`qos`)
//!
//! ## Extensions
//!
//! XEP-0004 (Data Forms), XEP-0030 (Service Discovery), XEP-0055 (Jabber
//! Search), XEP-0077 (In-Band Registration), XEP-0092 (Software Version).

pub mod config;
pub mod connection;
pub mod disco;
pub mod parser;
pub mod pending;
pub mod qos;
pub mod registry;
pub mod roster;
pub mod sasl;
pub mod sniffer;
pub mod transport;
pub mod xep;

mod error;
mod writer;

pub use config::{ClientConfig, Secret, XMPP_CLIENT_PORT};
pub use connection::{chat_message, Client, ConnectionState};
pub use error::{
    generate_iq_error, SaslErrorCondition, StanzaErrorCondition, StanzaErrorType,
    StreamErrorCondition, XmppError,
};
pub use parser::{ns, StreamHeader};
pub use pending::{IqCallback, IqResponse, RetryPolicy};
pub use qos::{DeliveryCallback, QosLevel};
pub use registry::{IqHandler, IqReply, MessageHandler};
pub use roster::{AskType, RosterChange, RosterItem};
pub use sniffer::{Sniffer, TracingSniffer};
pub use transport::BoxStream;
