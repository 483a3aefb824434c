//! Immutable element trees parsed from framed stanza text.
//!
//! Every stanza is parsed into its own fresh tree; nothing is shared between
//! calls.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("XML syntax error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("invalid attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("no root element")]
    Empty,
    #[error("unexpected content after the root element")]
    TrailingContent,
    #[error("root element is not closed")]
    Unclosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Parse exactly one element from `text`.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    if root.is_some() {
                        return Err(ParseError::TrailingContent);
                    }
                    stack.push(Element::from_start(&e)?);
                }
                Event::Empty(e) => {
                    if root.is_some() {
                        return Err(ParseError::TrailingContent);
                    }
                    let element = Element::from_start(&e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => root = Some(element),
                    }
                }
                Event::End(_) => {
                    let Some(element) = stack.pop() else {
                        return Err(ParseError::TrailingContent);
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => root = Some(element),
                    }
                }
                Event::Text(t) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = t.unescape()?;
                        parent.push_text(&text);
                    } else if !t.iter().all(u8::is_ascii_whitespace) {
                        return Err(ParseError::TrailingContent);
                    }
                }
                Event::CData(c) => {
                    if let Some(parent) = stack.last_mut() {
                        let raw = c.into_inner();
                        parent.push_text(&String::from_utf8_lossy(&raw));
                    }
                }
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if !stack.is_empty() {
            return Err(ParseError::Unclosed);
        }
        root.ok_or(ParseError::Empty)
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self, ParseError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            name,
            attrs,
            children: Vec::new(),
        })
    }

    fn push_text(&mut self, text: &str) {
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(text);
        } else {
            self.children.push(Node::Text(text.to_string()));
        }
    }

    /// Qualified tag name, e.g. `stream:features`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Namespace declared directly on this element.
    pub fn xmlns(&self) -> Option<&str> {
        self.attr("xmlns")
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn first_child(&self) -> Option<&Element> {
        self.children().next()
    }

    /// First direct child with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.children().find(|c| c.local_name() == local_name)
    }

    /// First element in document order (excluding `self`) that declares a
    /// namespace.
    pub fn find_namespaced(&self) -> Option<&Element> {
        for child in self.children() {
            if child.xmlns().is_some() {
                return Some(child);
            }
            if let Some(found) = child.find_namespaced() {
                return Some(found);
            }
        }
        None
    }

    /// Concatenated text of this element and all its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn from(&self) -> Option<&str> {
        self.attr("from")
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.attr("type")
    }
}

/// Strip the resource part from an XMPP address.
pub fn bare(address: &str) -> &str {
    address.split_once('/').map_or(address, |(bare, _)| bare)
}

/// Escape `<` and `&` so user text can be embedded as character data.
pub fn escape_text(text: &str) -> Cow<'_, str> {
    quick_xml::escape::minimal_escape(text)
}

/// Escape text for use inside a single-quoted attribute value.
pub fn escape_attr(text: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_with_body() {
        let e = Element::parse(
            "<message from='a@b.c/res' to='me@b.c' type='chat'><body>hi &amp; bye</body><active xmlns='http://jabber.org/protocol/chatstates'/></message>",
        )
        .unwrap();
        assert_eq!(e.name(), "message");
        assert_eq!(e.from(), Some("a@b.c/res"));
        assert_eq!(e.stanza_type(), Some("chat"));
        assert_eq!(e.child("body").map(Element::text).as_deref(), Some("hi & bye"));
        assert_eq!(e.children().count(), 2);
    }

    #[test]
    fn test_parse_prefixed_root() {
        let e = Element::parse(
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>",
        )
        .unwrap();
        assert_eq!(e.name(), "stream:features");
        assert_eq!(e.local_name(), "features");
        let tls = e.child("starttls").unwrap();
        assert_eq!(tls.xmlns(), Some("urn:ietf:params:xml:ns:xmpp-tls"));
        assert!(tls.child("required").is_some());
    }

    #[test]
    fn test_cdata_is_text() {
        let e = Element::parse("<body>a <![CDATA[<b>]]> c</body>").unwrap();
        assert_eq!(e.text(), "a <b> c");
    }

    #[test]
    fn test_find_namespaced_descends() {
        let e = Element::parse(
            "<iq type='get' id='t1'><query xmlns='jabber:iq:version'/></iq>",
        )
        .unwrap();
        assert_eq!(e.find_namespaced().and_then(Element::xmlns), Some("jabber:iq:version"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Element::parse("").is_err());
        assert!(Element::parse("<a><b></a>").is_err());
        assert!(Element::parse("<a/><b/>").is_err());
        assert!(Element::parse("<a>").is_err());
    }

    #[test]
    fn test_bare_strips_resource() {
        assert_eq!(bare("a@b.c/res/with/slash"), "a@b.c");
        assert_eq!(bare("a@b.c"), "a@b.c");
    }

    #[test]
    fn test_escape_text_only_touches_lt_and_amp() {
        assert_eq!(escape_text("a < b & c > d"), "a &lt; b &amp; c > d");
    }
}
