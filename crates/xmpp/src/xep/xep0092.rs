//! XEP-0092: Software Version.

use minidom::Element;

use crate::error::XmppError;
use crate::parser::ns;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareVersion {
    pub name: String,
    pub version: String,
    pub os: Option<String>,
}

impl SoftwareVersion {
    /// What this client reports about itself.
    pub fn own() -> Self {
        Self {
            name: "perch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: Some(std::env::consts::OS.to_string()),
        }
    }

    pub fn from_element(query: &Element) -> Result<Self, XmppError> {
        let text_of = |name: &str| query.get_child(name, ns::VERSION).map(|e| e.text());
        Ok(Self {
            name: text_of("name")
                .ok_or_else(|| XmppError::xml_parse("version response lacks a name"))?,
            version: text_of("version")
                .ok_or_else(|| XmppError::xml_parse("version response lacks a version"))?,
            os: text_of("os"),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("query", ns::VERSION)
            .append(
                Element::builder("name", ns::VERSION)
                    .append(self.name.clone())
                    .build(),
            )
            .append(
                Element::builder("version", ns::VERSION)
                    .append(self.version.clone())
                    .build(),
            );
        if let Some(os) = &self.os {
            builder = builder.append(
                Element::builder("os", ns::VERSION)
                    .append(os.clone())
                    .build(),
            );
        }
        builder.build()
    }
}

/// Request payload for a version query.
pub fn version_request() -> String {
    format!("<query xmlns='{}'/>", ns::VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_version_round_trips() {
        let own = SoftwareVersion::own();
        let parsed = SoftwareVersion::from_element(&own.to_element()).expect("round trip");
        assert_eq!(parsed, own);
        assert_eq!(parsed.name, "perch");
    }

    #[test]
    fn missing_name_is_an_error() {
        let query: Element = format!(
            "<query xmlns='{}'><version>1.0</version></query>",
            ns::VERSION
        )
        .parse()
        .unwrap();
        assert!(SoftwareVersion::from_element(&query).is_err());
    }
}
