//! XEP-0077: In-Band Registration, client side.
//!
//! Covers the fallback registration performed during the handshake when
//! SASL fails and the server advertised registration, plus the post-
//! connect account operations: fetch form, register, change password,
//! cancel registration.

use minidom::Element;

use crate::error::XmppError;
use crate::parser::{escape_xml, ns};
use crate::xep::xep0004::DataForm;

/// The registration form a server returns for an iq-get.
#[derive(Debug, Clone, Default)]
pub struct RegistrationFields {
    pub instructions: Option<String>,
    /// Legacy fixed fields requested by the server (username, password, …)
    pub fields: Vec<String>,
    /// Extended form, when the server uses XEP-0004
    pub form: Option<DataForm>,
    /// Set when the server says this entity is already registered
    pub registered: bool,
}

impl RegistrationFields {
    pub fn from_element(query: &Element) -> Result<Self, XmppError> {
        let mut out = RegistrationFields::default();
        for child in query.children() {
            match (child.name(), child.ns().as_str()) {
                ("instructions", ns::REGISTER) => out.instructions = Some(child.text()),
                ("registered", ns::REGISTER) => out.registered = true,
                ("x", ns::DATA_FORMS) => out.form = Some(DataForm::from_element(child)?),
                (name, ns::REGISTER) => out.fields.push(name.to_string()),
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Request payload fetching the registration form.
pub fn fields_request() -> String {
    format!("<query xmlns='{}'/>", ns::REGISTER)
}

/// Submission payload registering with legacy fixed fields.
pub fn registration_submit(values: &[(&str, &str)]) -> String {
    let mut body = format!("<query xmlns='{}'>", ns::REGISTER);
    for (field, value) in values {
        body.push_str(&format!("<{}>{}</{}>", field, escape_xml(value), field));
    }
    body.push_str("</query>");
    body
}

/// Submission payload for a password change (RFC: username + new password
/// addressed to the bare domain).
pub fn password_change(username: &str, new_password: &str) -> String {
    registration_submit(&[("username", username), ("password", new_password)])
}

/// Submission payload cancelling the registration.
pub fn unregister_request() -> String {
    format!("<query xmlns='{}'><remove/></query>", ns::REGISTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_parse_instructions_and_registered_flag() {
        let query: Element = format!(
            "<query xmlns='{}'><instructions>Choose wisely</instructions>\
             <registered/><username/><password/><email/></query>",
            ns::REGISTER
        )
        .parse()
        .unwrap();

        let fields = RegistrationFields::from_element(&query).expect("fields should parse");
        assert_eq!(fields.instructions.as_deref(), Some("Choose wisely"));
        assert!(fields.registered);
        assert_eq!(fields.fields, vec!["username", "password", "email"]);
    }

    #[test]
    fn submit_escapes_values() {
        let body = registration_submit(&[("username", "alice"), ("password", "p<w>&")]);
        assert!(body.contains("<username>alice</username>"));
        assert!(body.contains("<password>p&lt;w&gt;&amp;</password>"));
    }

    #[test]
    fn password_change_carries_both_fields() {
        let body = password_change("alice", "newpw");
        assert!(body.contains("<username>alice</username>"));
        assert!(body.contains("<password>newpw</password>"));
    }

    #[test]
    fn unregister_contains_remove() {
        assert!(unregister_request().contains("<remove/>"));
    }
}
