//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default XMPP client port.
pub const XMPP_CLIENT_PORT: u16 = 5222;

/// The account secret: either a plaintext password or a stored hash with
/// the method it was produced by. PLAIN and the MD5 family require the
/// plaintext form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Secret {
    Password { value: String },
    Hash { value: String, method: String },
}

impl Secret {
    pub fn password(value: impl Into<String>) -> Self {
        Self::Password {
            value: value.into(),
        }
    }

    /// The plaintext password, when one is configured.
    pub fn plaintext(&self) -> Option<&str> {
        match self {
            Secret::Password { value } => Some(value),
            Secret::Hash { .. } => None,
        }
    }
}

/// Connection and behaviour options.
///
/// `host` doubles as the XMPP domain and the address to dial; a
/// `see-other-host` redirect replaces it while everything else is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Localpart of the account JID
    pub user: String,
    pub secret: Secret,
    /// Preferred resource; the server assigns one when absent
    pub resource: Option<String>,
    /// `xml:lang` sent on the stream header
    pub language: String,
    /// Accept the server certificate regardless of validation outcome
    pub trust_server: bool,

    pub allow_plain: bool,
    pub allow_cram_md5: bool,
    pub allow_digest_md5: bool,
    pub allow_scram_sha1: bool,

    pub keep_alive_seconds: u64,

    #[serde(with = "duration_millis")]
    pub default_retry_timeout: Duration,
    pub default_nr_retries: u32,
    pub default_drop_off: bool,
    #[serde(with = "opt_duration_millis")]
    pub default_max_retry_timeout: Option<Duration>,

    pub max_assured_pending_from_source: usize,
    pub max_assured_pending_total: usize,

    pub request_roster_on_startup: bool,
    /// Fall back to in-band registration when SASL fails and the server
    /// offered it
    pub allow_registration: bool,

    pub form_signature_key: Option<String>,
    pub form_signature_secret: Option<String>,
}

impl ClientConfig {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: XMPP_CLIENT_PORT,
            user: user.into(),
            secret: Secret::password(password),
            resource: None,
            language: "en".to_string(),
            trust_server: false,
            allow_plain: false,
            allow_cram_md5: true,
            allow_digest_md5: true,
            allow_scram_sha1: true,
            keep_alive_seconds: 30,
            default_retry_timeout: Duration::from_millis(2000),
            default_nr_retries: 5,
            default_drop_off: true,
            default_max_retry_timeout: None,
            max_assured_pending_from_source: 5,
            max_assured_pending_total: 100,
            request_roster_on_startup: true,
            allow_registration: false,
            form_signature_key: None,
            form_signature_secret: None,
        }
    }

    /// Bare JID string of the configured account.
    pub fn bare_jid(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = ClientConfig::new("example.org", "alice", "secret");

        assert_eq!(config.port, XMPP_CLIENT_PORT);
        assert!(!config.allow_plain);
        assert!(config.allow_scram_sha1);
        assert_eq!(config.keep_alive_seconds, 30);
        assert_eq!(config.default_retry_timeout, Duration::from_millis(2000));
        assert_eq!(config.default_nr_retries, 5);
        assert!(config.default_drop_off);
        assert!(config.default_max_retry_timeout.is_none());
        assert_eq!(config.max_assured_pending_from_source, 5);
        assert_eq!(config.max_assured_pending_total, 100);
        assert!(config.request_roster_on_startup);
        assert!(!config.allow_registration);
    }

    #[test]
    fn bare_jid_combines_user_and_host() {
        let config = ClientConfig::new("example.org", "alice", "secret");
        assert_eq!(config.bare_jid(), "alice@example.org");
    }

    #[test]
    fn hash_secret_has_no_plaintext() {
        let secret = Secret::Hash {
            value: "abc123".to_string(),
            method: "SHA-1".to_string(),
        };
        assert!(secret.plaintext().is_none());
        assert_eq!(Secret::password("pw").plaintext(), Some("pw"));
    }
}
