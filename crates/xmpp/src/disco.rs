//! Service discovery (XEP-0030): info and items, both directions.

use minidom::Element;

use crate::error::XmppError;
use crate::parser::ns;

/// An identity advertised in a disco#info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Category (e.g. "client", "server")
    pub category: String,
    /// Type within the category (e.g. "pc", "im")
    pub type_: String,
    /// Optional human-readable name
    pub name: Option<String>,
}

impl Identity {
    pub fn new(category: &str, type_: &str, name: Option<&str>) -> Self {
        Self {
            category: category.to_string(),
            type_: type_.to_string(),
            name: name.map(|s| s.to_string()),
        }
    }

    /// The identity this client advertises.
    pub fn client(name: Option<&str>) -> Self {
        Self::new("client", "pc", name)
    }
}

/// Parsed disco#info result.
#[derive(Debug, Clone, Default)]
pub struct DiscoInfo {
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
}

impl DiscoInfo {
    pub fn from_element(query: &Element) -> Self {
        let mut info = DiscoInfo::default();
        for child in query.children() {
            match child.name() {
                "identity" => {
                    if let (Some(category), Some(type_)) =
                        (child.attr("category"), child.attr("type"))
                    {
                        info.identities
                            .push(Identity::new(category, type_, child.attr("name")));
                    }
                }
                "feature" => {
                    if let Some(var) = child.attr("var") {
                        info.features.push(var.to_string());
                    }
                }
                _ => {}
            }
        }
        info
    }

    pub fn has_feature(&self, var: &str) -> bool {
        self.features.iter().any(|f| f == var)
    }
}

/// One entry of a disco#items result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoItem {
    pub jid: String,
    pub node: Option<String>,
    pub name: Option<String>,
}

/// Parsed disco#items result.
#[derive(Debug, Clone, Default)]
pub struct DiscoItems {
    pub items: Vec<DiscoItem>,
}

impl DiscoItems {
    pub fn from_element(query: &Element) -> Self {
        let items = query
            .children()
            .filter(|c| c.name() == "item")
            .filter_map(|c| {
                c.attr("jid").map(|jid| DiscoItem {
                    jid: jid.to_string(),
                    node: c.attr("node").map(String::from),
                    name: c.attr("name").map(String::from),
                })
            })
            .collect();
        Self { items }
    }
}

/// Build the disco#info response payload for our advertised feature set.
pub fn build_info_response(identity: &Identity, features: &[String]) -> Element {
    let mut identity_builder = Element::builder("identity", ns::DISCO_INFO)
        .attr("category", identity.category.clone())
        .attr("type", identity.type_.clone());
    if let Some(name) = &identity.name {
        identity_builder = identity_builder.attr("name", name.clone());
    }

    let mut builder = Element::builder("query", ns::DISCO_INFO).append(identity_builder.build());
    for feature in features {
        builder = builder.append(
            Element::builder("feature", ns::DISCO_INFO)
                .attr("var", feature.clone())
                .build(),
        );
    }
    builder.build()
}

/// The request payload for a disco#info query.
pub fn info_request() -> String {
    format!("<query xmlns='{}'/>", ns::DISCO_INFO)
}

/// The request payload for a disco#items query.
pub fn items_request() -> String {
    format!("<query xmlns='{}'/>", ns::DISCO_ITEMS)
}

/// Check that a disco result payload is the `<query/>` element of the
/// expected namespace before handing it to a parser.
pub fn query_of<'e>(payload: &'e Element, namespace: &str) -> Result<&'e Element, XmppError> {
    if payload.name() == "query" && payload.ns() == namespace {
        Ok(payload)
    } else {
        Err(XmppError::xml_parse(format!(
            "disco response payload is not a {} query",
            namespace
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_response_carries_identity_and_features() {
        let features = vec![ns::DISCO_INFO.to_string(), ns::QOS.to_string()];
        let query = build_info_response(&Identity::client(Some("perch")), &features);

        let parsed = DiscoInfo::from_element(&query);
        assert_eq!(parsed.identities.len(), 1);
        assert_eq!(parsed.identities[0].category, "client");
        assert!(parsed.has_feature(ns::QOS));
        assert!(parsed.has_feature(ns::DISCO_INFO));
        assert!(!parsed.has_feature("urn:example:absent"));
    }

    #[test]
    fn query_of_rejects_foreign_payloads() {
        let features = vec![ns::DISCO_INFO.to_string()];
        let query = build_info_response(&Identity::client(None), &features);
        assert!(query_of(&query, ns::DISCO_INFO).is_ok());
        assert!(query_of(&query, ns::DISCO_ITEMS).is_err());

        let wrong: Element = "<ping xmlns='urn:xmpp:ping'/>".parse().unwrap();
        assert!(query_of(&wrong, ns::DISCO_INFO).is_err());
    }

    #[test]
    fn items_parse_jid_node_and_name() {
        let query: Element = format!(
            "<query xmlns='{}'><item jid='rooms.example.org' name='Chatrooms'/>\
             <item jid='search.example.org' node='directory'/></query>",
            ns::DISCO_ITEMS
        )
        .parse()
        .unwrap();

        let items = DiscoItems::from_element(&query);
        assert_eq!(items.items.len(), 2);
        assert_eq!(items.items[0].jid, "rooms.example.org");
        assert_eq!(items.items[0].name.as_deref(), Some("Chatrooms"));
        assert_eq!(items.items[1].node.as_deref(), Some("directory"));
    }
}
