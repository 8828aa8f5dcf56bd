//! DIGEST-MD5 (RFC 2831), client side, `qop=auth` only.

use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::XmppError;

use super::Mechanism;

enum State {
    /// Waiting for the first challenge
    Fresh,
    /// Response sent; the server still owes us its `rspauth`
    AwaitingRspauth { expected: String },
    /// `rspauth` verified
    Done,
}

pub(crate) struct DigestMd5 {
    username: String,
    password: String,
    /// Domain part of the digest-uri (`xmpp/<host>`)
    host: String,
    state: State,
}

impl DigestMd5 {
    pub(crate) fn new(username: &str, password: &str, host: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            host: host.to_string(),
            state: State::Fresh,
        }
    }

    fn check_rspauth(expected: &str, challenge: &str) -> Result<(), XmppError> {
        match parse_directives(challenge).remove("rspauth") {
            Some(rspauth) if rspauth == expected => Ok(()),
            Some(_) => Err(XmppError::auth_failed("DIGEST-MD5 rspauth mismatch")),
            None => Err(XmppError::auth_failed("DIGEST-MD5 rspauth missing")),
        }
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn initial(&mut self) -> Result<Option<Vec<u8>>, XmppError> {
        Ok(None)
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, XmppError> {
        let challenge = std::str::from_utf8(challenge)
            .map_err(|_| XmppError::auth_failed("DIGEST-MD5 challenge is not UTF-8"))?;

        match &self.state {
            State::Fresh => {
                let directives = parse_directives(challenge);
                let nonce = directives
                    .get("nonce")
                    .ok_or_else(|| XmppError::auth_failed("DIGEST-MD5 challenge lacks nonce"))?;
                let realm = directives
                    .get("realm")
                    .cloned()
                    .unwrap_or_else(|| self.host.clone());
                if let Some(qop) = directives.get("qop") {
                    if !qop.split(',').any(|q| q.trim() == "auth") {
                        return Err(XmppError::auth_failed(
                            "DIGEST-MD5 server does not offer qop=auth",
                        ));
                    }
                }

                let mut cnonce_bytes = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut cnonce_bytes);
                let cnonce = hex(&cnonce_bytes);
                let nc = "00000001";
                let digest_uri = format!("xmpp/{}", self.host);

                let response = response_value(
                    &self.username,
                    &realm,
                    &self.password,
                    nonce,
                    &cnonce,
                    nc,
                    &digest_uri,
                    "AUTHENTICATE",
                );
                let expected = response_value(
                    &self.username,
                    &realm,
                    &self.password,
                    nonce,
                    &cnonce,
                    nc,
                    &digest_uri,
                    "",
                );

                let reply = format!(
                    "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},\
                     qop=auth,digest-uri=\"{}\",response={},charset=utf-8",
                    self.username, realm, nonce, cnonce, nc, digest_uri, response
                );

                self.state = State::AwaitingRspauth { expected };
                Ok(reply.into_bytes())
            }
            State::AwaitingRspauth { expected } => {
                Self::check_rspauth(expected, challenge)?;
                self.state = State::Done;
                // The final response carries no data.
                Ok(Vec::new())
            }
            State::Done => Err(XmppError::auth_failed(
                "unexpected DIGEST-MD5 challenge after completion",
            )),
        }
    }

    fn verify_success(&mut self, data: &[u8]) -> Result<(), XmppError> {
        // Some servers skip the empty-response round and put rspauth on
        // <success/> directly.
        if let State::AwaitingRspauth { expected } = &self.state {
            let text = std::str::from_utf8(data)
                .map_err(|_| XmppError::auth_failed("DIGEST-MD5 success data is not UTF-8"))?;
            Self::check_rspauth(expected, text)?;
            self.state = State::Done;
        }
        Ok(())
    }
}

/// Compute the RFC 2831 response value for `qop=auth`. `a2_prefix` is
/// `AUTHENTICATE` for the client response and empty for `rspauth`.
#[allow(clippy::too_many_arguments)]
fn response_value(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    digest_uri: &str,
    a2_prefix: &str,
) -> String {
    let mut a1_hasher = Md5::new();
    a1_hasher.update(format!("{}:{}:{}", username, realm, password));
    let a1_hash = a1_hasher.finalize();

    let mut a1 = a1_hash.to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    let ha1 = hex(Md5::digest(&a1).as_slice());

    let ha2 = hex(Md5::digest(format!("{}:{}", a2_prefix, digest_uri).as_bytes()).as_slice());

    hex(Md5::digest(format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2).as_bytes())
        .as_slice())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a comma-separated directive list with optionally quoted values.
fn parse_directives(input: &str) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = stripped.find('"') else { break };
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }

        out.insert(key, value);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_2831_response_example() {
        // The worked example from RFC 2831 section 4.
        let response = response_value(
            "chris",
            "elwood.innosoft.com",
            "secret",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "00000001",
            "imap/elwood.innosoft.com",
            "AUTHENTICATE",
        );
        assert_eq!(response, "d388dad90d4bbd760a152321f2143af7");
    }

    #[test]
    fn rfc_2831_rspauth_example() {
        let rspauth = response_value(
            "chris",
            "elwood.innosoft.com",
            "secret",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "00000001",
            "imap/elwood.innosoft.com",
            "",
        );
        assert_eq!(rspauth, "ea40f60335c427b5527b84dbabcdfffd");
    }

    #[test]
    fn challenge_directives_parse_with_and_without_quotes() {
        let directives = parse_directives(
            "realm=\"example.org\",nonce=\"abc123\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
        );
        assert_eq!(directives.get("realm").map(String::as_str), Some("example.org"));
        assert_eq!(directives.get("nonce").map(String::as_str), Some("abc123"));
        assert_eq!(directives.get("qop").map(String::as_str), Some("auth"));
        assert_eq!(directives.get("charset").map(String::as_str), Some("utf-8"));
    }

    #[test]
    fn full_exchange_accepts_matching_rspauth() {
        let mut mechanism = DigestMd5::new("chris", "secret", "elwood.innosoft.com");
        assert!(mechanism.initial().unwrap().is_none());

        let reply = mechanism
            .respond(b"realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",charset=utf-8,algorithm=md5-sess")
            .expect("first challenge should produce a response");
        let reply = String::from_utf8(reply).unwrap();
        assert!(reply.contains("username=\"chris\""));
        assert!(reply.contains("digest-uri=\"xmpp/elwood.innosoft.com\""));
        assert!(reply.contains("qop=auth"));

        // Extract what the mechanism expects and feed it back as rspauth.
        let expected = match &mechanism.state {
            State::AwaitingRspauth { expected } => expected.clone(),
            _ => panic!("mechanism should await rspauth"),
        };
        let second = mechanism
            .respond(format!("rspauth={}", expected).as_bytes())
            .expect("matching rspauth should be accepted");
        assert!(second.is_empty());
        assert!(mechanism.verify_success(b"").is_ok());
    }

    #[test]
    fn mismatched_rspauth_is_rejected() {
        let mut mechanism = DigestMd5::new("chris", "secret", "elwood.innosoft.com");
        mechanism
            .respond(b"nonce=\"abc\",qop=\"auth\"")
            .expect("first challenge should succeed");
        assert!(mechanism.respond(b"rspauth=deadbeef").is_err());
    }
}
