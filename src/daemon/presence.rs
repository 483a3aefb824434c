//! Contact availability: one `status` file per contact, overwritten on every
//! presence update.

use tracing::{debug, info};

use super::{DaemonError, Roster, StanzaHandler};
use crate::mailbox::{self, HelperKind};
use crate::stanza::Element;

/// Status shown for an available contact without a `<show/>` child.
pub const ONLINE: &str = "online";

/// Status text for a presence stanza. Any `type` attribute (unavailable,
/// subscription requests, errors) yields an empty status.
pub fn status_of(presence: &Element) -> String {
    if presence.stanza_type().is_some() {
        return String::new();
    }
    presence
        .child("show")
        .map(|show| show.text().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| ONLINE.to_string())
}

#[derive(Debug, Default)]
pub struct PresenceHandler;

impl StanzaHandler for PresenceHandler {
    const KIND: HelperKind = HelperKind::Presence;
    const OUTPUT_FILE: &'static str = "status";

    async fn on_stanza(
        &mut self,
        roster: &mut Roster,
        stanza: &Element,
        _raw: &str,
    ) -> Result<(), DaemonError> {
        if stanza.name() != "presence" {
            debug!(tag = stanza.name(), "Not a presence, ignored");
            return Ok(());
        }
        let from = stanza.from().ok_or(DaemonError::Missing("from"))?;
        let status = status_of(stanza);
        let contact = roster.ensure(from)?;
        mailbox::overwrite(contact.output(), &status)?;
        info!(contact = contact.name(), status = %status, "Presence updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    async fn deliver(roster: &mut Roster, xml: &str) {
        let stanza = Element::parse(xml).unwrap();
        PresenceHandler.on_stanza(roster, &stanza, xml).await.unwrap();
    }

    #[tokio::test]
    async fn test_available_without_show_is_online() {
        let tmp = tempfile::tempdir().unwrap();
        let mut roster = Roster::new(tmp.path(), PresenceHandler::OUTPUT_FILE, &[]);
        deliver(&mut roster, "<presence from='a@b.c/res'/>").await;
        assert_eq!(fs::read_to_string(tmp.path().join("a@b.c/status")).unwrap(), "online");
        assert!(!tmp.path().join("a@b.c/res").exists());
    }

    #[tokio::test]
    async fn test_show_text_is_status() {
        let tmp = tempfile::tempdir().unwrap();
        let mut roster = Roster::new(tmp.path(), PresenceHandler::OUTPUT_FILE, &[]);
        deliver(&mut roster, "<presence from='a@b.c/res'><show>dnd</show></presence>").await;
        assert_eq!(fs::read_to_string(tmp.path().join("a@b.c/status")).unwrap(), "dnd");
    }

    #[tokio::test]
    async fn test_unavailable_truncates_status() {
        let tmp = tempfile::tempdir().unwrap();
        let mut roster = Roster::new(tmp.path(), PresenceHandler::OUTPUT_FILE, &[]);
        deliver(&mut roster, "<presence from='a@b.c/res'><show>away</show></presence>").await;
        deliver(&mut roster, "<presence from='a@b.c' type='unavailable'/>").await;
        assert_eq!(fs::read_to_string(tmp.path().join("a@b.c/status")).unwrap(), "");
    }

    #[test]
    fn test_any_type_means_empty_status() {
        let subscribe = Element::parse("<presence from='a@b.c' type='subscribe'/>").unwrap();
        assert_eq!(status_of(&subscribe), "");
    }
}
