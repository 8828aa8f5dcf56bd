//! Error types for the XMPP client.

use thiserror::Error;

use crate::parser::ns;

/// XMPP client errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (socket read/write, shutdown)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing or stream framing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Malformed JID
    #[error("JID error: {0}")]
    Jid(#[from] jid::Error),

    /// Stream-level error received from the server (fatal)
    #[error("Stream error: {condition}")]
    Stream {
        condition: StreamErrorCondition,
        /// Text payload; for `see-other-host` this carries the new host
        text: Option<String>,
    },

    /// SASL failure received from the server
    #[error("SASL failure: {condition}")]
    Sasl {
        condition: SaslErrorCondition,
        text: Option<String>,
    },

    /// Local authentication failure (no acceptable mechanism, bad credentials
    /// shape, server signature mismatch)
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A synchronous wrapper expired before its response arrived
    #[error("Operation timed out")]
    Timeout,

    /// Operation requires an established connection
    #[error("Not connected")]
    NotConnected,

    /// A handler is already bound to the dispatch key
    #[error("Handler already registered for {0}")]
    HandlerConflict(String),

    /// Unregistration attempted with a handle that is not the registrant's
    #[error("Handler handle mismatch for {0}")]
    HandlerMismatch(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error, serialised into an iq-error reply when raised by a
    /// handler, or carried back to a caller when a request failed remotely
    #[error("Stanza error: {condition}")]
    Stanza {
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<String>,
    },
}

impl XmppError {
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn stream(condition: StreamErrorCondition, text: Option<String>) -> Self {
        Self::Stream { condition, text }
    }

    /// Create a stanza error with the condition's default error type.
    pub fn stanza(condition: StanzaErrorCondition, text: Option<String>) -> Self {
        Self::Stanza {
            condition,
            error_type: condition.default_type(),
            text,
        }
    }

    pub fn bad_request(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::BadRequest, text)
    }

    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::FeatureNotImplemented, text)
    }

    pub fn item_not_found(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ItemNotFound, text)
    }

    pub fn not_allowed(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAllowed, text)
    }

    pub fn resource_constraint(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ResourceConstraint, text)
    }

    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ServiceUnavailable, text)
    }

    /// Whether reconnecting could plausibly succeed. Stream errors other
    /// than `see-other-host` and authentication failures are final.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout => true,
            Self::Stream { condition, .. } => {
                matches!(condition, StreamErrorCondition::SeeOtherHost)
            }
            _ => false,
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        Some(match name {
            "bad-request" => Self::BadRequest,
            "conflict" => Self::Conflict,
            "feature-not-implemented" => Self::FeatureNotImplemented,
            "forbidden" => Self::Forbidden,
            "gone" => Self::Gone,
            "internal-server-error" => Self::InternalServerError,
            "item-not-found" => Self::ItemNotFound,
            "jid-malformed" => Self::JidMalformed,
            "not-acceptable" => Self::NotAcceptable,
            "not-allowed" => Self::NotAllowed,
            "not-authorized" => Self::NotAuthorized,
            "policy-violation" => Self::PolicyViolation,
            "recipient-unavailable" => Self::RecipientUnavailable,
            "redirect" => Self::Redirect,
            "registration-required" => Self::RegistrationRequired,
            "remote-server-not-found" => Self::RemoteServerNotFound,
            "remote-server-timeout" => Self::RemoteServerTimeout,
            "resource-constraint" => Self::ResourceConstraint,
            "service-unavailable" => Self::ServiceUnavailable,
            "subscription-required" => Self::SubscriptionRequired,
            "undefined-condition" => Self::UndefinedCondition,
            "unexpected-request" => Self::UnexpectedRequest,
            _ => return None,
        })
    }

    /// Default error type per the RFC 6120 suggested mapping.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest
            | Self::JidMalformed
            | Self::NotAcceptable
            | Self::Redirect
            | Self::PolicyViolation => StanzaErrorType::Modify,
            Self::Forbidden
            | Self::NotAuthorized
            | Self::RegistrationRequired
            | Self::SubscriptionRequired => StanzaErrorType::Auth,
            Self::InternalServerError
            | Self::RecipientUnavailable
            | Self::RemoteServerTimeout
            | Self::ResourceConstraint
            | Self::UnexpectedRequest => StanzaErrorType::Wait,
            _ => StanzaErrorType::Cancel,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stream error conditions (RFC 6120 Section 4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    RemoteConnectionFailed,
    Reset,
    ResourceConstraint,
    RestrictedXml,
    /// Carries the replacement host in the error text
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedEncoding,
    UnsupportedFeature,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

impl StreamErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::BadNamespacePrefix => "bad-namespace-prefix",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostGone => "host-gone",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::Reset => "reset",
            Self::ResourceConstraint => "resource-constraint",
            Self::RestrictedXml => "restricted-xml",
            Self::SeeOtherHost => "see-other-host",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnsupportedEncoding => "unsupported-encoding",
            Self::UnsupportedFeature => "unsupported-feature",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        Some(match name {
            "bad-format" => Self::BadFormat,
            "bad-namespace-prefix" => Self::BadNamespacePrefix,
            "conflict" => Self::Conflict,
            "connection-timeout" => Self::ConnectionTimeout,
            "host-gone" => Self::HostGone,
            "host-unknown" => Self::HostUnknown,
            "improper-addressing" => Self::ImproperAddressing,
            "internal-server-error" => Self::InternalServerError,
            "invalid-from" => Self::InvalidFrom,
            "invalid-namespace" => Self::InvalidNamespace,
            "invalid-xml" => Self::InvalidXml,
            "not-authorized" => Self::NotAuthorized,
            "not-well-formed" => Self::NotWellFormed,
            "policy-violation" => Self::PolicyViolation,
            "remote-connection-failed" => Self::RemoteConnectionFailed,
            "reset" => Self::Reset,
            "resource-constraint" => Self::ResourceConstraint,
            "restricted-xml" => Self::RestrictedXml,
            "see-other-host" => Self::SeeOtherHost,
            "system-shutdown" => Self::SystemShutdown,
            "undefined-condition" => Self::UndefinedCondition,
            "unsupported-encoding" => Self::UnsupportedEncoding,
            "unsupported-feature" => Self::UnsupportedFeature,
            "unsupported-stanza-type" => Self::UnsupportedStanzaType,
            "unsupported-version" => Self::UnsupportedVersion,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SASL failure conditions (RFC 6120 Section 6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslErrorCondition {
    AccountDisabled,
    CredentialsExpired,
    EncryptionRequired,
    IncorrectEncoding,
    InvalidAuthzid,
    InvalidMechanism,
    MalformedRequest,
    MechanismTooWeak,
    NotAuthorized,
    TemporaryAuthFailure,
}

impl SaslErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountDisabled => "account-disabled",
            Self::CredentialsExpired => "credentials-expired",
            Self::EncryptionRequired => "encryption-required",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MalformedRequest => "malformed-request",
            Self::MechanismTooWeak => "mechanism-too-weak",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        Some(match name {
            "account-disabled" => Self::AccountDisabled,
            "credentials-expired" => Self::CredentialsExpired,
            "encryption-required" => Self::EncryptionRequired,
            "incorrect-encoding" => Self::IncorrectEncoding,
            "invalid-authzid" => Self::InvalidAuthzid,
            "invalid-mechanism" => Self::InvalidMechanism,
            "malformed-request" => Self::MalformedRequest,
            "mechanism-too-weak" => Self::MechanismTooWeak,
            "not-authorized" => Self::NotAuthorized,
            "temporary-auth-failure" => Self::TemporaryAuthFailure,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SaslErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generate an IQ error response.
pub fn generate_iq_error(
    id: &str,
    to: Option<&str>,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    text: Option<&str>,
) -> String {
    let mut iq = format!("<iq type='error' id='{}'", id);

    if let Some(to) = to {
        iq.push_str(&format!(" to='{}'", to));
    }

    iq.push_str(&format!(
        "><error type='{}'><{} xmlns='{}'/>{}</error></iq>",
        error_type.as_str(),
        condition.as_str(),
        ns::STANZAS,
        text.map(|t| format!("<text xmlns='{}' xml:lang='en'>{}</text>", ns::STANZAS, t))
            .unwrap_or_default()
    ));

    iq
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iq_error_generation() {
        let error = generate_iq_error(
            "42",
            Some("user@example.com"),
            StanzaErrorCondition::NotAllowed,
            StanzaErrorType::Cancel,
            Some("sender not in roster"),
        );

        assert!(error.contains("type='error'"));
        assert!(error.contains("id='42'"));
        assert!(error.contains("to='user@example.com'"));
        assert!(error.contains("<not-allowed"));
        assert!(error.contains("sender not in roster"));
    }

    #[test]
    fn stanza_condition_round_trip() {
        for condition in [
            StanzaErrorCondition::BadRequest,
            StanzaErrorCondition::RecipientUnavailable,
            StanzaErrorCondition::ResourceConstraint,
            StanzaErrorCondition::UnexpectedRequest,
        ] {
            assert_eq!(
                StanzaErrorCondition::from_str(condition.as_str()),
                Some(condition)
            );
        }
    }

    #[test]
    fn stream_condition_round_trip() {
        for condition in [
            StreamErrorCondition::SeeOtherHost,
            StreamErrorCondition::NotWellFormed,
            StreamErrorCondition::UnsupportedVersion,
        ] {
            assert_eq!(
                StreamErrorCondition::from_str(condition.as_str()),
                Some(condition)
            );
        }
    }

    #[test]
    fn see_other_host_is_recoverable() {
        let error = XmppError::stream(
            StreamErrorCondition::SeeOtherHost,
            Some("mirror.example.org".to_string()),
        );
        assert!(error.is_recoverable());

        let fatal = XmppError::stream(StreamErrorCondition::Conflict, None);
        assert!(!fatal.is_recoverable());
    }

    #[test]
    fn default_types_follow_rfc_mapping() {
        assert_eq!(
            StanzaErrorCondition::BadRequest.default_type(),
            StanzaErrorType::Modify
        );
        assert_eq!(
            StanzaErrorCondition::NotAllowed.default_type(),
            StanzaErrorType::Cancel
        );
        assert_eq!(
            StanzaErrorCondition::ResourceConstraint.default_type(),
            StanzaErrorType::Wait
        );
        assert_eq!(
            StanzaErrorCondition::Forbidden.default_type(),
            StanzaErrorType::Auth
        );
    }
}
