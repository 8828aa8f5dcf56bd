//! CRAM-MD5 (RFC 2195), client side.

use hmac::{Hmac, Mac};
use md5::Md5;

use crate::error::XmppError;

use super::Mechanism;

type HmacMd5 = Hmac<Md5>;

pub(crate) struct CramMd5 {
    username: String,
    password: String,
}

impl CramMd5 {
    pub(crate) fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl Mechanism for CramMd5 {
    fn name(&self) -> &'static str {
        "CRAM-MD5"
    }

    fn initial(&mut self) -> Result<Option<Vec<u8>>, XmppError> {
        Ok(None)
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, XmppError> {
        let mut mac = HmacMd5::new_from_slice(self.password.as_bytes())
            .map_err(|_| XmppError::auth_failed("CRAM-MD5 key setup failed"))?;
        mac.update(challenge);
        let digest = mac.finalize().into_bytes();

        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(format!("{} {}", self.username, hex).into_bytes())
    }

    fn verify_success(&mut self, _data: &[u8]) -> Result<(), XmppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_2195_example() {
        let mut mechanism = CramMd5::new("tim", "tanstaaftanstaaf");
        let response = mechanism
            .respond(b"<1896.697170952@postoffice.reston.mci.net>")
            .expect("respond should succeed");
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "tim b913a602c7eda7a495b4e6e7334d3890"
        );
    }

    #[test]
    fn no_initial_response() {
        let mut mechanism = CramMd5::new("tim", "pw");
        assert!(mechanism.initial().unwrap().is_none());
    }
}
