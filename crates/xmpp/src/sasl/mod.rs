//! SASL mechanism selection and the client-side exchange contract.
//!
//! The negotiation loop in the connection layer only ever sees the
//! [`Mechanism`] contract: an optional initial response, a challenge →
//! response step, and a final success check. PLAIN and SCRAM-SHA-1 are
//! provided by the `sasl` crate; CRAM-MD5 and DIGEST-MD5 live next door in
//! this module. The set of supported algorithms is the closed
//! [`SelectedMechanism`] variant.

mod cram;
mod digest;

use std::collections::HashSet;

use sasl::client::mechanisms::{Plain, Scram};
use sasl::client::Mechanism as SaslClientMechanism;
use sasl::common::scram::Sha1;
use sasl::common::{ChannelBinding, Credentials};

use crate::config::{ClientConfig, Secret};
use crate::error::XmppError;

pub(crate) use cram::CramMd5;
pub(crate) use digest::DigestMd5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha1,
    DigestMd5,
    CramMd5,
    Plain,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::DigestMd5 => "DIGEST-MD5",
            SelectedMechanism::CramMd5 => "CRAM-MD5",
            SelectedMechanism::Plain => "PLAIN",
        }
    }

    fn permitted(&self, config: &ClientConfig) -> bool {
        match self {
            SelectedMechanism::ScramSha1 => config.allow_scram_sha1,
            SelectedMechanism::DigestMd5 => config.allow_digest_md5,
            SelectedMechanism::CramMd5 => config.allow_cram_md5,
            SelectedMechanism::Plain => config.allow_plain,
        }
    }
}

impl std::fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const MECHANISM_PREFERENCE: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha1,
    SelectedMechanism::DigestMd5,
    SelectedMechanism::CramMd5,
    SelectedMechanism::Plain,
];

/// Pick the first mechanism, in preference order, that the server offered
/// and the configuration permits.
pub fn select_mechanism(
    offered: &HashSet<String>,
    config: &ClientConfig,
) -> Option<SelectedMechanism> {
    MECHANISM_PREFERENCE
        .iter()
        .find(|m| offered.contains(m.name()) && m.permitted(config))
        .copied()
}

/// Client side of one SASL exchange. A fresh instance is built per attempt.
pub trait Mechanism: Send {
    fn name(&self) -> &'static str;

    /// Initial response sent with `<auth/>`; `None` sends none.
    fn initial(&mut self) -> Result<Option<Vec<u8>>, XmppError>;

    /// Answer a server `<challenge/>`.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, XmppError>;

    /// Check any additional data carried by `<success/>` (e.g. the SCRAM
    /// server signature).
    fn verify_success(&mut self, data: &[u8]) -> Result<(), XmppError>;
}

/// Build a mechanism instance for the selected algorithm.
pub fn build_mechanism(
    selected: SelectedMechanism,
    username: &str,
    host: &str,
    secret: &Secret,
) -> Result<Box<dyn Mechanism>, XmppError> {
    let password = secret.plaintext().ok_or_else(|| {
        XmppError::auth_failed(format!(
            "{} requires a plaintext password; a stored hash was configured",
            selected
        ))
    })?;

    match selected {
        SelectedMechanism::ScramSha1 => {
            let credentials = Credentials::default()
                .with_username(username)
                .with_password(password)
                .with_channel_binding(ChannelBinding::Unsupported);
            let inner = Scram::<Sha1>::from_credentials(credentials).map_err(|e| {
                XmppError::auth_failed(format!("failed to initialize SCRAM-SHA-1: {:?}", e))
            })?;
            Ok(Box::new(CrateMechanism {
                inner: Box::new(inner),
                name: "SCRAM-SHA-1",
            }))
        }
        SelectedMechanism::DigestMd5 => Ok(Box::new(DigestMd5::new(username, password, host))),
        SelectedMechanism::CramMd5 => Ok(Box::new(CramMd5::new(username, password))),
        SelectedMechanism::Plain => {
            let credentials = Credentials::default()
                .with_username(username)
                .with_password(password)
                .with_channel_binding(ChannelBinding::Unsupported);
            let inner = Plain::from_credentials(credentials).map_err(|e| {
                XmppError::auth_failed(format!("failed to initialize PLAIN: {:?}", e))
            })?;
            Ok(Box::new(CrateMechanism {
                inner: Box::new(inner),
                name: "PLAIN",
            }))
        }
    }
}

/// Adapter over the `sasl` crate's client mechanisms.
struct CrateMechanism {
    inner: Box<dyn SaslClientMechanism + Send>,
    name: &'static str,
}

impl Mechanism for CrateMechanism {
    fn name(&self) -> &'static str {
        self.name
    }

    fn initial(&mut self) -> Result<Option<Vec<u8>>, XmppError> {
        let data = self.inner.initial();
        Ok(if data.is_empty() { None } else { Some(data) })
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, XmppError> {
        self.inner
            .response(challenge)
            .map_err(|e| XmppError::auth_failed(format!("challenge-response failed: {:?}", e)))
    }

    fn verify_success(&mut self, data: &[u8]) -> Result<(), XmppError> {
        self.inner.success(data).map_err(|e| {
            XmppError::auth_failed(format!("server signature verification failed: {:?}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offered(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn config() -> ClientConfig {
        ClientConfig::new("example.org", "alice", "secret")
    }

    #[test]
    fn prefers_scram_sha1() {
        let server = offered(&["PLAIN", "CRAM-MD5", "DIGEST-MD5", "SCRAM-SHA-1"]);
        assert_eq!(
            select_mechanism(&server, &config()),
            Some(SelectedMechanism::ScramSha1)
        );
    }

    #[test]
    fn falls_back_through_the_md5_family() {
        let server = offered(&["PLAIN", "CRAM-MD5", "DIGEST-MD5"]);
        assert_eq!(
            select_mechanism(&server, &config()),
            Some(SelectedMechanism::DigestMd5)
        );

        let server = offered(&["PLAIN", "CRAM-MD5"]);
        assert_eq!(
            select_mechanism(&server, &config()),
            Some(SelectedMechanism::CramMd5)
        );
    }

    #[test]
    fn plain_requires_opt_in() {
        let server = offered(&["PLAIN"]);
        assert_eq!(select_mechanism(&server, &config()), None);

        let mut permissive = config();
        permissive.allow_plain = true;
        assert_eq!(
            select_mechanism(&server, &permissive),
            Some(SelectedMechanism::Plain)
        );
    }

    #[test]
    fn disabled_mechanisms_are_skipped() {
        let server = offered(&["SCRAM-SHA-1", "DIGEST-MD5"]);
        let mut cfg = config();
        cfg.allow_scram_sha1 = false;
        assert_eq!(
            select_mechanism(&server, &cfg),
            Some(SelectedMechanism::DigestMd5)
        );
    }

    #[test]
    fn returns_none_when_nothing_matches() {
        let server = offered(&["EXTERNAL", "GSSAPI"]);
        assert_eq!(select_mechanism(&server, &config()), None);
        assert_eq!(select_mechanism(&HashSet::new(), &config()), None);
    }

    #[test]
    fn plain_initial_response_is_nul_separated() {
        let mut mechanism = build_mechanism(
            SelectedMechanism::Plain,
            "alice",
            "example.org",
            &Secret::password("secret"),
        )
        .expect("PLAIN should build");

        let initial = mechanism
            .initial()
            .expect("initial should succeed")
            .expect("PLAIN sends an initial response");
        assert_eq!(initial, b"\0alice\0secret");
    }

    #[test]
    fn scram_sha1_builds_and_has_initial() {
        let mut mechanism = build_mechanism(
            SelectedMechanism::ScramSha1,
            "alice",
            "example.org",
            &Secret::password("secret"),
        )
        .expect("SCRAM-SHA-1 should build");
        assert_eq!(mechanism.name(), "SCRAM-SHA-1");
        let initial = mechanism.initial().expect("initial should succeed");
        assert!(initial.is_some());
    }

    #[test]
    fn stored_hash_cannot_feed_sasl() {
        let result = build_mechanism(
            SelectedMechanism::CramMd5,
            "alice",
            "example.org",
            &Secret::Hash {
                value: "ab".to_string(),
                method: "SHA-1".to_string(),
            },
        );
        assert!(matches!(result, Err(XmppError::AuthFailed(_))));
    }
}
