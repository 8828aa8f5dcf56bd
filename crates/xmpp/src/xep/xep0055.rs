//! XEP-0055: Jabber Search.
//!
//! Legacy fixed-field search plus the data-form variant. The client asks a
//! search service for its fields, submits criteria, and reads back item
//! rows (or a result form).

use minidom::Element;

use crate::error::XmppError;
use crate::parser::{escape_xml, ns};
use crate::xep::xep0004::DataForm;

/// The searchable fields a service advertises.
#[derive(Debug, Clone, Default)]
pub struct SearchFields {
    pub instructions: Option<String>,
    /// Legacy fixed fields present in the query (first, last, nick, email)
    pub fields: Vec<String>,
    /// Extended form, when the service uses XEP-0004
    pub form: Option<DataForm>,
}

impl SearchFields {
    pub fn from_element(query: &Element) -> Result<Self, XmppError> {
        let mut out = SearchFields::default();
        for child in query.children() {
            match (child.name(), child.ns().as_str()) {
                ("instructions", ns::SEARCH) => out.instructions = Some(child.text()),
                ("x", ns::DATA_FORMS) => out.form = Some(DataForm::from_element(child)?),
                (name, ns::SEARCH) => out.fields.push(name.to_string()),
                _ => {}
            }
        }
        Ok(out)
    }
}

/// One row of a legacy search result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchItem {
    pub jid: String,
    pub first: Option<String>,
    pub last: Option<String>,
    pub nick: Option<String>,
    pub email: Option<String>,
}

/// Search results: legacy item rows or a result form.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub items: Vec<SearchItem>,
    pub form: Option<DataForm>,
}

impl SearchResult {
    pub fn from_element(query: &Element) -> Result<Self, XmppError> {
        let mut out = SearchResult::default();
        for child in query.children() {
            match (child.name(), child.ns().as_str()) {
                ("item", ns::SEARCH) => {
                    let jid = child.attr("jid").ok_or_else(|| {
                        XmppError::xml_parse("search item missing 'jid' attribute")
                    })?;
                    let text_of = |name: &str| {
                        child
                            .get_child(name, ns::SEARCH)
                            .map(|e| e.text())
                            .filter(|t| !t.is_empty())
                    };
                    out.items.push(SearchItem {
                        jid: jid.to_string(),
                        first: text_of("first"),
                        last: text_of("last"),
                        nick: text_of("nick"),
                        email: text_of("email"),
                    });
                }
                ("x", ns::DATA_FORMS) => out.form = Some(DataForm::from_element(child)?),
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Request payload asking a service for its search fields.
pub fn fields_request() -> String {
    format!("<query xmlns='{}'/>", ns::SEARCH)
}

/// Submission payload for a legacy fixed-field search.
pub fn search_request(criteria: &[(&str, &str)]) -> String {
    let mut body = format!("<query xmlns='{}'>", ns::SEARCH);
    for (field, value) in criteria {
        body.push_str(&format!(
            "<{}>{}</{}>",
            field,
            escape_xml(value),
            field
        ));
    }
    body.push_str("</query>");
    body
}

/// Submission payload for a form-based search.
pub fn form_search_request(form: &DataForm) -> Result<String, XmppError> {
    let form_xml = crate::parser::element_to_string(&form.to_element())?;
    Ok(format!("<query xmlns='{}'>{}</query>", ns::SEARCH, form_xml))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_parse_legacy_and_form() {
        let query: Element = format!(
            "<query xmlns='{search}'><instructions>Find people</instructions>\
             <first/><last/><nick/>\
             <x xmlns='{form}' type='form'><field var='email'/></x></query>",
            search = ns::SEARCH,
            form = ns::DATA_FORMS
        )
        .parse()
        .unwrap();

        let fields = SearchFields::from_element(&query).expect("fields should parse");
        assert_eq!(fields.instructions.as_deref(), Some("Find people"));
        assert_eq!(fields.fields, vec!["first", "last", "nick"]);
        assert!(fields.form.is_some());
    }

    #[test]
    fn search_request_escapes_values() {
        let body = search_request(&[("first", "A&B"), ("last", "O'Neil")]);
        assert!(body.contains("<first>A&amp;B</first>"));
        assert!(body.contains("<last>O&apos;Neil</last>"));
    }

    #[test]
    fn result_rows_parse() {
        let query: Element = format!(
            "<query xmlns='{}'><item jid='ada@example.org'>\
             <first>Ada</first><last>Lovelace</last><email>ada@example.org</email>\
             </item></query>",
            ns::SEARCH
        )
        .parse()
        .unwrap();

        let result = SearchResult::from_element(&query).expect("result should parse");
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].jid, "ada@example.org");
        assert_eq!(result.items[0].first.as_deref(), Some("Ada"));
        assert!(result.items[0].nick.is_none());
    }

    #[test]
    fn item_without_jid_is_an_error() {
        let query: Element = format!("<query xmlns='{}'><item/></query>", ns::SEARCH)
            .parse()
            .unwrap();
        assert!(SearchResult::from_element(&query).is_err());
    }
}
