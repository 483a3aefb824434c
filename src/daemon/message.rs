//! Chat transcripts: one `out` file per contact, plus the reverse path from
//! the contact's `in` pipe to the server.

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use super::{Contact, DaemonError, Roster, StanzaHandler};
use crate::mailbox::{self, HelperKind};
use crate::stanza::{bare, escape_attr, escape_text, Element};

const NS_CHATSTATES: &str = "http://jabber.org/protocol/chatstates";

/// `YYYY-mm-dd HH:MM <who> text`
pub fn transcript_line(at: DateTime<Local>, who: &str, text: &str) -> String {
    format!("{} <{}> {}", at.format("%Y-%m-%d %H:%M"), who, text)
}

/// Collapse line breaks and other control characters so one message is one
/// transcript line.
pub fn flatten(text: &str) -> String {
    text.trim()
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

pub struct MessageHandler {
    jid: String,
    id: String,
}

impl MessageHandler {
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            id: format!("messaged-{}", std::process::id()),
        }
    }

    /// Chat stanza carrying `text` to `to`.
    pub fn chat(&self, to: &str, text: &str) -> String {
        format!(
            "<message from='{}' to='{}' type='chat' id='{}'><active xmlns='{}'/><body>{}</body></message>",
            escape_attr(&self.jid),
            escape_attr(to),
            escape_attr(&self.id),
            NS_CHATSTATES,
            escape_text(text)
        )
    }
}

impl StanzaHandler for MessageHandler {
    const KIND: HelperKind = HelperKind::Message;
    const OUTPUT_FILE: &'static str = "out";
    const WATCH_INBOX: bool = true;

    async fn on_stanza(
        &mut self,
        roster: &mut Roster,
        stanza: &Element,
        _raw: &str,
    ) -> Result<(), DaemonError> {
        if stanza.name() != "message" {
            debug!(tag = stanza.name(), "Not a message, ignored");
            return Ok(());
        }
        let from = stanza.from().ok_or(DaemonError::Missing("from"))?;
        let Some(body) = stanza.child("body") else {
            debug!(from, "Message without body, ignored");
            return Ok(());
        };
        let text = flatten(&body.text());

        let contact = roster.ensure(from)?;
        mailbox::append_line(contact.output(), &transcript_line(Local::now(), bare(from), &text))?;
        info!(contact = contact.name(), "Message received");
        Ok(())
    }

    fn on_input(&mut self, contact: &Contact, text: &str) -> Result<Option<String>, DaemonError> {
        let text = text.trim_end_matches(|c: char| c.is_control() || c.is_whitespace());
        if text.is_empty() {
            return Ok(None);
        }
        let echo = transcript_line(Local::now(), &self.jid, &flatten(text));
        if let Err(e) = mailbox::append_line(contact.output(), &echo) {
            warn!(contact = contact.name(), error = %e, "Failed to echo message into transcript");
        }
        debug!(contact = contact.name(), "Sending message");
        Ok(Some(self.chat(contact.name(), text)))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeZone;

    use super::*;

    fn roster(root: &std::path::Path) -> Roster {
        Roster::new(root, MessageHandler::OUTPUT_FILE, MessageHandler::RESERVED)
    }

    async fn deliver(handler: &mut MessageHandler, roster: &mut Roster, xml: &str) {
        let stanza = Element::parse(xml).unwrap();
        handler.on_stanza(roster, &stanza, xml).await.unwrap();
    }

    #[test]
    fn test_transcript_line_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 0).unwrap();
        assert_eq!(transcript_line(at, "a@b.c", "hi there"), "2024-03-09 07:05 <a@b.c> hi there");
    }

    #[test]
    fn test_flatten_joins_lines() {
        assert_eq!(flatten("  one\ntwo\tthree  "), "one two three");
    }

    #[tokio::test]
    async fn test_message_creates_contact_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let mut roster = roster(tmp.path());
        let mut handler = MessageHandler::new("me@example.com");

        deliver(
            &mut handler,
            &mut roster,
            "<message from='a@b.c/phone' type='chat'><body>hi there</body></message>",
        )
        .await;

        let out = fs::read_to_string(tmp.path().join("a@b.c/out")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(" <a@b.c> hi there"), "{}", lines[0]);
        assert_eq!(lines[0].len(), "YYYY-mm-dd HH:MM <a@b.c> hi there".len());
    }

    #[tokio::test]
    async fn test_message_without_body_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut roster = roster(tmp.path());
        let mut handler = MessageHandler::new("me@example.com");

        deliver(
            &mut handler,
            &mut roster,
            "<message from='a@b.c'><composing xmlns='http://jabber.org/protocol/chatstates'/></message>",
        )
        .await;
        assert!(roster.is_empty());
    }

    #[tokio::test]
    async fn test_multiline_body_is_one_line() {
        let tmp = tempfile::tempdir().unwrap();
        let mut roster = roster(tmp.path());
        let mut handler = MessageHandler::new("me@example.com");

        deliver(
            &mut handler,
            &mut roster,
            "<message from='a@b.c'><body>first\nsecond</body></message>",
        )
        .await;
        let out = fs::read_to_string(tmp.path().join("a@b.c/out")).unwrap();
        assert_eq!(out.lines().count(), 1);
        assert!(out.trim_end().ends_with("<a@b.c> first second"));
    }

    #[test]
    fn test_input_becomes_chat_stanza_and_echo() {
        let tmp = tempfile::tempdir().unwrap();
        let mut roster = roster(tmp.path());
        let mut handler = MessageHandler::new("me@example.com");
        let contact = roster.ensure("a@b.c").unwrap().clone();

        let stanza = handler
            .on_input(&contact, "1 < 2 & 3\n")
            .unwrap()
            .unwrap();
        let parsed = Element::parse(&stanza).unwrap();
        assert_eq!(parsed.attr("to"), Some("a@b.c"));
        assert_eq!(parsed.attr("from"), Some("me@example.com"));
        assert_eq!(parsed.stanza_type(), Some("chat"));
        assert_eq!(parsed.child("body").map(Element::text).as_deref(), Some("1 < 2 & 3"));
        assert_eq!(
            parsed.child("active").and_then(Element::xmlns),
            Some(NS_CHATSTATES)
        );

        let out = fs::read_to_string(contact.output()).unwrap();
        assert!(out.trim_end().ends_with("<me@example.com> 1 < 2 & 3"));

        assert!(handler.on_input(&contact, "\n\r").unwrap().is_none());
    }

    #[test]
    fn test_input_is_sent_even_if_echo_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut roster = roster(tmp.path());
        let mut handler = MessageHandler::new("me@example.com");
        let contact = roster.ensure("a@b.c").unwrap().clone();
        // A directory where the transcript should be makes the append fail.
        fs::remove_file(contact.output()).unwrap();
        fs::create_dir(contact.output()).unwrap();

        let stanza = handler.on_input(&contact, "still sent").unwrap().unwrap();
        assert!(stanza.contains("<body>still sent</body>"));
    }
}
