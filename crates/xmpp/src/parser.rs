//! Incremental XML stream framing for XMPP.
//!
//! An XMPP stream is not a well-formed document delivered end-to-end: the
//! root `<stream:stream>` element stays open for the life of the session and
//! its children are appended over time. The tokenizer here is a small
//! character-level state machine that captures the stream header once, then
//! frames each top-level child as a complete fragment, tracking nesting
//! depth and attribute quoting by hand. Fragments are parsed into a tree
//! only after framing, by re-wrapping them in the stream context so that
//! inherited namespaces resolve.

use minidom::Element;

use crate::error::XmppError;

/// Namespace URIs used by the client core.
pub mod ns {
    /// XMPP client content namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace (the `stream:` prefix)
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Stream error conditions namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Stanza error conditions namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Roster management (RFC 6121)
    pub const ROSTER: &str = "jabber:iq:roster";
    /// Service discovery info (XEP-0030)
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Service discovery items (XEP-0030)
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Software version (XEP-0092)
    pub const VERSION: &str = "jabber:iq:version";
    /// In-band registration (XEP-0077)
    pub const REGISTER: &str = "jabber:iq:register";
    /// Stream-feature advertisement for in-band registration
    pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";
    /// Jabber search (XEP-0055)
    pub const SEARCH: &str = "jabber:iq:search";
    /// Data forms (XEP-0004)
    pub const DATA_FORMS: &str = "jabber:x:data";
    /// Quality-of-service delivery extension
    pub const QOS: &str = "urn:xmpp:qos";
}

/// Parsed attributes of the server's `<stream:stream …>` header.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse the header from the raw tag text. The tag is intentionally
    /// unclosed XML, so attributes are extracted textually.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        if !tag.starts_with("<stream:stream") && !tag.starts_with("<stream ") {
            return Err(XmppError::xml_parse("no stream:stream element found"));
        }

        Ok(Self {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
        })
    }

    /// Validate the header per RFC 6120.
    pub fn validate(&self) -> Result<(), XmppError> {
        if let Some(ref version) = self.version {
            if version != "1.0" {
                return Err(XmppError::xml_parse(format!(
                    "unsupported XMPP version: {}",
                    version
                )));
            }
        }
        Ok(())
    }
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

/// Output of the tokenizer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The opening `<stream:stream …>` tag, emitted exactly once per stream
    Header(StreamHeader),
    /// One complete top-level child, verbatim
    Stanza(String),
    /// The stream footer; the session is over
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenizerState {
    /// Whitespace before the first `<`
    Prolog,
    /// `<` seen before the header; the next character disambiguates
    OpenAngle,
    /// Inside `<?xml … ?>`
    Declaration,
    /// Inside the `<stream:stream …>` tag
    Header,
    /// Inside a quoted attribute value of the header
    HeaderQuote(char),
    /// Depth 1, between top-level children
    Idle,
    /// `<` seen at depth 1
    ChildAngle,
    /// Inside `</stream:stream` — the footer
    Footer,
    /// Inside a child, outside markup
    Text,
    /// Inside a tag within a child
    Tag,
    /// Inside a quoted attribute value within a child tag
    TagQuote(char),
    /// Footer consumed; nothing further is expected
    Closed,
}

/// Character-level stream tokenizer.
///
/// One fragment buffer is maintained; it is taken and reset on emission.
pub struct StreamTokenizer {
    state: TokenizerState,
    header_buf: String,
    fragment: String,
    depth: usize,
    tag_is_end: bool,
    tag_seen_first: bool,
    prev_slash: bool,
}

impl StreamTokenizer {
    pub fn new() -> Self {
        Self {
            state: TokenizerState::Prolog,
            header_buf: String::new(),
            fragment: String::with_capacity(1024),
            depth: 0,
            tag_is_end: false,
            tag_seen_first: false,
            prev_slash: false,
        }
    }

    /// Reset for a stream restart (after STARTTLS or SASL success). Only
    /// framing state is cleared; nothing about the session survives here.
    pub fn reset(&mut self) {
        self.state = TokenizerState::Prolog;
        self.header_buf.clear();
        self.fragment.clear();
        self.depth = 0;
        self.tag_is_end = false;
        self.tag_seen_first = false;
        self.prev_slash = false;
    }

    /// Whether the stream footer has been consumed.
    pub fn is_closed(&self) -> bool {
        self.state == TokenizerState::Closed
    }

    /// Feed decoded input, producing zero or more events.
    pub fn feed(&mut self, input: &str) -> Result<Vec<StreamEvent>, XmppError> {
        let mut events = Vec::new();

        for c in input.chars() {
            match self.state {
                TokenizerState::Prolog => {
                    if c == '<' {
                        self.state = TokenizerState::OpenAngle;
                    } else if !c.is_whitespace() {
                        return Err(XmppError::xml_parse(format!(
                            "unexpected character '{}' before stream header",
                            c
                        )));
                    }
                }
                TokenizerState::OpenAngle => match c {
                    '?' => self.state = TokenizerState::Declaration,
                    '!' => {
                        return Err(XmppError::xml_parse(
                            "markup declarations are not allowed in an XMPP stream",
                        ));
                    }
                    _ => {
                        self.header_buf.clear();
                        self.header_buf.push('<');
                        self.header_buf.push(c);
                        self.state = TokenizerState::Header;
                    }
                },
                TokenizerState::Declaration => {
                    if c == '>' {
                        self.state = TokenizerState::Prolog;
                    }
                }
                TokenizerState::Header => match c {
                    '\'' | '"' => {
                        self.header_buf.push(c);
                        self.state = TokenizerState::HeaderQuote(c);
                    }
                    '>' => {
                        let header = StreamHeader::parse(&self.header_buf)?;
                        header.validate()?;
                        self.depth = 1;
                        self.state = TokenizerState::Idle;
                        events.push(StreamEvent::Header(header));
                    }
                    _ => self.header_buf.push(c),
                },
                TokenizerState::HeaderQuote(quote) => {
                    self.header_buf.push(c);
                    if c == quote {
                        self.state = TokenizerState::Header;
                    }
                }
                TokenizerState::Idle => {
                    if c == '<' {
                        self.state = TokenizerState::ChildAngle;
                    } else if !c.is_whitespace() {
                        return Err(XmppError::xml_parse(format!(
                            "unexpected character '{}' between stanzas",
                            c
                        )));
                    }
                }
                TokenizerState::ChildAngle => match c {
                    '/' => self.state = TokenizerState::Footer,
                    '?' | '!' => {
                        return Err(XmppError::xml_parse("unexpected markup inside the stream"));
                    }
                    _ => {
                        self.fragment.clear();
                        self.fragment.push('<');
                        self.fragment.push(c);
                        self.tag_is_end = false;
                        self.tag_seen_first = true;
                        self.prev_slash = false;
                        self.state = TokenizerState::Tag;
                    }
                },
                TokenizerState::Footer => {
                    if c == '>' {
                        self.depth = 0;
                        self.state = TokenizerState::Closed;
                        events.push(StreamEvent::Closed);
                    }
                }
                TokenizerState::Text => {
                    self.fragment.push(c);
                    if c == '<' {
                        self.tag_is_end = false;
                        self.tag_seen_first = false;
                        self.prev_slash = false;
                        self.state = TokenizerState::Tag;
                    }
                }
                TokenizerState::Tag => {
                    if !self.tag_seen_first {
                        self.tag_seen_first = true;
                        if c == '/' {
                            self.tag_is_end = true;
                            self.fragment.push(c);
                            continue;
                        }
                    }
                    match c {
                        '\'' | '"' => {
                            self.fragment.push(c);
                            self.prev_slash = false;
                            self.state = TokenizerState::TagQuote(c);
                        }
                        '>' => {
                            self.fragment.push(c);
                            if self.tag_is_end {
                                if self.depth == 0 {
                                    return Err(XmppError::xml_parse("unbalanced closing tag"));
                                }
                                self.depth -= 1;
                            } else if !self.prev_slash {
                                self.depth += 1;
                            }
                            self.prev_slash = false;
                            if self.depth == 1 {
                                events.push(StreamEvent::Stanza(std::mem::take(
                                    &mut self.fragment,
                                )));
                                self.state = TokenizerState::Idle;
                            } else {
                                self.state = TokenizerState::Text;
                            }
                        }
                        '/' => {
                            self.fragment.push(c);
                            self.prev_slash = true;
                        }
                        _ => {
                            self.fragment.push(c);
                            self.prev_slash = false;
                        }
                    }
                }
                TokenizerState::TagQuote(quote) => {
                    self.fragment.push(c);
                    if c == quote {
                        self.state = TokenizerState::Tag;
                    }
                }
                TokenizerState::Closed => {
                    // Trailing bytes after the footer are ignored; the
                    // connection is coming down anyway.
                }
            }
        }

        Ok(events)
    }
}

impl Default for StreamTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental UTF-8 decoding across read boundaries. A chunk may end in
/// the middle of a multi-byte sequence; the tail is held back until the
/// next read completes it.
#[derive(Default)]
pub struct Utf8Reader {
    pending: Vec<u8>,
}

impl Utf8Reader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<String, XmppError> {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(decoded) => {
                let out = decoded.to_string();
                self.pending.clear();
                Ok(out)
            }
            Err(e) => {
                if e.error_len().is_some() {
                    return Err(XmppError::xml_parse("invalid UTF-8 on the stream"));
                }
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                Ok(out)
            }
        }
    }
}

/// Parse a framed fragment into a stanza tree.
///
/// The fragment is wrapped back into the stream context so unprefixed
/// elements inherit `jabber:client` and `stream:`-prefixed elements resolve,
/// then the single child of the synthetic root is the stanza.
pub fn parse_fragment(fragment: &str) -> Result<Element, XmppError> {
    let document = format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}'>{}</stream:stream>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        fragment
    );
    let root: Element = document
        .parse()
        .map_err(|e: minidom::Error| XmppError::xml_parse(format!("bad stanza: {}", e)))?;
    root.children()
        .next()
        .cloned()
        .ok_or_else(|| XmppError::xml_parse("empty stanza fragment"))
}

/// Serialize an element to its XML text.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::xml_parse(format!("invalid UTF-8: {}", e)))
}

/// Escape text for inclusion in XML content or attribute values.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' from='example.org' id='s1' \
        version='1.0'>";

    fn collect(tok: &mut StreamTokenizer, input: &str) -> Vec<StreamEvent> {
        tok.feed(input).expect("feed should succeed")
    }

    #[test]
    fn header_is_emitted_once_with_attributes() {
        let mut tok = StreamTokenizer::new();
        let events = collect(&mut tok, HEADER);

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Header(header) => {
                assert_eq!(header.from.as_deref(), Some("example.org"));
                assert_eq!(header.id.as_deref(), Some("s1"));
                assert_eq!(header.version.as_deref(), Some("1.0"));
            }
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn header_split_across_reads() {
        let mut tok = StreamTokenizer::new();
        let (a, b) = HEADER.split_at(37);
        assert!(collect(&mut tok, a).is_empty());
        let events = collect(&mut tok, b);
        assert!(matches!(events[0], StreamEvent::Header(_)));
    }

    #[test]
    fn stanzas_are_framed_in_order() {
        let mut tok = StreamTokenizer::new();
        collect(&mut tok, HEADER);
        let events = collect(&mut tok, "<iq type='get' id='1'><ping/></iq> <presence/>");

        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (StreamEvent::Stanza(a), StreamEvent::Stanza(b)) => {
                assert_eq!(a, "<iq type='get' id='1'><ping/></iq>");
                assert_eq!(b, "<presence/>");
            }
            other => panic!("expected two stanzas, got {:?}", other),
        }
    }

    #[test]
    fn fragment_split_across_reads() {
        let mut tok = StreamTokenizer::new();
        collect(&mut tok, HEADER);
        assert!(collect(&mut tok, "<message to='a@b'><bo").is_empty());
        let events = collect(&mut tok, "dy>hi there</body></message>");
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Stanza(s) => {
                assert_eq!(s, "<message to='a@b'><body>hi there</body></message>");
            }
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    #[test]
    fn whitespace_inside_fragment_is_preserved() {
        let mut tok = StreamTokenizer::new();
        collect(&mut tok, HEADER);
        let events = collect(&mut tok, "<message><body>  two  spaces  </body></message>");
        match &events[0] {
            StreamEvent::Stanza(s) => assert!(s.contains(">  two  spaces  <")),
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    #[test]
    fn angle_bracket_inside_quoted_attribute() {
        let mut tok = StreamTokenizer::new();
        collect(&mut tok, HEADER);
        let events = collect(&mut tok, "<message note='a > b'><body>x</body></message>");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn footer_closes_the_stream() {
        let mut tok = StreamTokenizer::new();
        collect(&mut tok, HEADER);
        let events = collect(&mut tok, "<presence/></stream:stream>");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Closed));
        assert!(tok.is_closed());
    }

    #[test]
    fn non_whitespace_between_stanzas_is_a_violation() {
        let mut tok = StreamTokenizer::new();
        collect(&mut tok, HEADER);
        assert!(tok.feed("garbage").is_err());
    }

    #[test]
    fn unsupported_stream_version_is_rejected() {
        let mut tok = StreamTokenizer::new();
        let result = tok.feed("<stream:stream version='2.0'>");
        assert!(result.is_err());
    }

    #[test]
    fn reset_allows_a_fresh_stream() {
        let mut tok = StreamTokenizer::new();
        collect(&mut tok, HEADER);
        collect(&mut tok, "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        tok.reset();
        let events = collect(&mut tok, HEADER);
        assert!(matches!(events[0], StreamEvent::Header(_)));
    }

    #[test]
    fn full_stream_emits_header_stanzas_footer() {
        // Header exactly once, one event per child in order, then EOF.
        let mut tok = StreamTokenizer::new();
        let mut events = Vec::new();
        let stream = format!(
            "{}<iq id='1' type='result'/><message><body>a</body></message></stream:stream>",
            HEADER
        );
        // Feed character by character to exercise every split point.
        for c in stream.chars() {
            events.extend(collect(&mut tok, &c.to_string()));
        }

        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], StreamEvent::Header(_)));
        assert!(matches!(events[1], StreamEvent::Stanza(_)));
        assert!(matches!(events[2], StreamEvent::Stanza(_)));
        assert!(matches!(events[3], StreamEvent::Closed));
    }

    #[test]
    fn parse_fragment_resolves_inherited_namespace() {
        let element =
            parse_fragment("<iq type='get' id='1'><query xmlns='jabber:iq:roster'/></iq>")
                .expect("fragment should parse");
        assert_eq!(element.name(), "iq");
        assert!(element.get_child("query", ns::ROSTER).is_some());
    }

    #[test]
    fn parse_fragment_resolves_stream_prefix() {
        let element = parse_fragment(
            "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>",
        )
        .expect("features should parse");
        assert_eq!(element.name(), "features");
        assert!(element.get_child("bind", ns::BIND).is_some());
    }

    #[test]
    fn utf8_reader_holds_back_partial_sequences() {
        let mut reader = Utf8Reader::new();
        let bytes = "héllo".as_bytes();
        let (a, b) = bytes.split_at(2); // split inside the two-byte 'é'
        assert_eq!(reader.push(a).unwrap(), "h");
        assert_eq!(reader.push(b).unwrap(), "éllo");
    }

    #[test]
    fn utf8_reader_rejects_invalid_sequences() {
        let mut reader = Utf8Reader::new();
        assert!(reader.push(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn escape_round_trip() {
        assert_eq!(escape_xml("a<b&c>'d\""), "a&lt;b&amp;c&gt;&apos;d&quot;");
    }
}
