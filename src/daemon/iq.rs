//! Generic IQ pass-through.
//!
//! Requests (`get`/`set`) go to an extension registered under
//! `DIR/ext/<namespace>`: an executable is run with `-d DIR` and the stanza
//! on stdin, any other file gets the stanza appended. Requests without an
//! extension land in the sender's `out`. Results are appended to `DIR/<id>`,
//! where a one-shot tool that sent the request may be waiting on a pipe.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::roster::valid_name;
use super::{DaemonError, Roster, StanzaHandler};
use crate::mailbox::{self, HelperKind};
use crate::stanza::Element;

/// Subdirectory holding namespace extensions.
pub const EXT_DIR: &str = "ext";

/// Namespaces served elsewhere and never looked up as extensions.
const IGNORED_NS_PREFIX: &str = "http://jabber.org/protocol/";

#[derive(Debug)]
pub struct IqHandler {
    dir: PathBuf,
}

impl IqHandler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Extension path for a request namespace, if one may exist for it.
    pub fn extension_path(&self, namespace: &str) -> Option<PathBuf> {
        if namespace.is_empty()
            || namespace.starts_with(IGNORED_NS_PREFIX)
            || namespace.contains("..")
        {
            return None;
        }
        Some(self.dir.join(EXT_DIR).join(namespace))
    }

    async fn on_request(
        &mut self,
        roster: &mut Roster,
        stanza: &Element,
        raw: &str,
    ) -> Result<(), DaemonError> {
        let namespace = stanza
            .find_namespaced()
            .and_then(Element::xmlns)
            .ok_or(DaemonError::Missing("a namespaced child"))?;
        let Some(path) = self.extension_path(namespace) else {
            debug!(namespace, "Namespace not handled by extensions, ignored");
            return Ok(());
        };

        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o100 != 0 => {
                run_extension(&path, &self.dir, raw)?;
                Ok(())
            }
            Ok(meta) if meta.is_dir() => Err(DaemonError::Io {
                path,
                source: io::Error::new(io::ErrorKind::Other, "extension is a directory"),
            }),
            Ok(_) => {
                mailbox::write_nonblocking_retry(&path, raw.as_bytes()).await?;
                debug!(namespace, "Request appended to extension file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let from = stanza.from().ok_or(DaemonError::Missing("from"))?;
                let contact = roster.ensure(from)?;
                mailbox::append_line(contact.output(), raw)?;
                info!(contact = contact.name(), namespace, "Unhandled request stored");
                Ok(())
            }
            Err(e) => Err(DaemonError::Io { path, source: e }),
        }
    }

    async fn on_result(&mut self, stanza: &Element, raw: &str) -> Result<(), DaemonError> {
        let id = stanza.id().ok_or(DaemonError::Missing("id"))?;
        if !valid_name(id) || id == EXT_DIR {
            return Err(DaemonError::InvalidContact(id.to_string()));
        }
        let path = self.dir.join(id);
        match mailbox::write_nonblocking_retry(&path, raw.as_bytes()).await {
            Ok(()) => {
                debug!(id, "Result delivered");
                Ok(())
            }
            Err(mailbox::MailboxError::NotListening(_)) => {
                warn!(id, "Nobody is waiting for this result, dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Start an extension and hand it the stanza. The process is reaped in the
/// background so a slow extension does not stall the daemon.
fn run_extension(program: &Path, dir: &Path, raw: &str) -> Result<(), DaemonError> {
    let mut child = Command::new(program)
        .arg("-d")
        .arg(dir)
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| DaemonError::Io {
            path: program.to_path_buf(),
            source: e,
        })?;
    let mut stdin = child.stdin.take();
    let stanza = raw.to_string();
    let name = program.display().to_string();
    info!(extension = %name, "Running extension");

    tokio::spawn(async move {
        if let Some(stdin) = stdin.as_mut() {
            if let Err(e) = stdin.write_all(stanza.as_bytes()).await {
                warn!(extension = %name, error = %e, "Failed to pass stanza to extension");
            }
        }
        drop(stdin);
        match child.wait().await {
            Ok(status) if status.success() => debug!(extension = %name, "Extension finished"),
            Ok(status) => warn!(extension = %name, %status, "Extension failed"),
            Err(e) => warn!(extension = %name, error = %e, "Failed to wait for extension"),
        }
    });
    Ok(())
}

impl StanzaHandler for IqHandler {
    const KIND: HelperKind = HelperKind::Iq;
    const OUTPUT_FILE: &'static str = "out";
    const RESERVED: &'static [&'static str] = &[EXT_DIR];

    async fn on_stanza(
        &mut self,
        roster: &mut Roster,
        stanza: &Element,
        raw: &str,
    ) -> Result<(), DaemonError> {
        if stanza.name() != "iq" {
            debug!(tag = stanza.name(), "Not an iq, ignored");
            return Ok(());
        }
        match stanza.stanza_type() {
            Some("get") | Some("set") => self.on_request(roster, stanza, raw).await,
            Some("result") => self.on_result(stanza, raw).await,
            Some("error") => {
                let from = stanza.from().ok_or(DaemonError::Missing("from"))?;
                let contact = roster.ensure(from)?;
                mailbox::append_line(contact.output(), raw)?;
                info!(contact = contact.name(), id = ?stanza.id(), "Error reply stored");
                Ok(())
            }
            other => {
                warn!(kind = ?other, "Iq without a valid type, ignored");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::eventually;
    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        dir: PathBuf,
        roster: Roster,
        handler: IqHandler,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("iq");
        fs::create_dir_all(dir.join(EXT_DIR)).unwrap();
        Fixture {
            roster: Roster::new(&dir, IqHandler::OUTPUT_FILE, IqHandler::RESERVED),
            handler: IqHandler::new(&dir),
            dir,
            _tmp: tmp,
        }
    }

    impl Fixture {
        async fn deliver(&mut self, xml: &str) -> Result<(), DaemonError> {
            let stanza = Element::parse(xml).unwrap();
            self.handler.on_stanza(&mut self.roster, &stanza, xml).await
        }
    }

    const VERSION_QUERY: &str = "<iq type='get' id='v1' from='a@b.c/res'><query xmlns='jabber:iq:version'/></iq>";

    #[test]
    fn test_extension_path_filters_namespaces() {
        let handler = IqHandler::new("/mail/iq");
        assert_eq!(
            handler.extension_path("urn:xmpp:time"),
            Some(PathBuf::from("/mail/iq/ext/urn:xmpp:time"))
        );
        assert_eq!(handler.extension_path("http://jabber.org/protocol/disco#info"), None);
        assert_eq!(handler.extension_path("urn:../../etc/passwd"), None);
        assert_eq!(handler.extension_path(""), None);
    }

    #[tokio::test]
    async fn test_request_without_extension_goes_to_sender() {
        let mut f = fixture();
        f.deliver(VERSION_QUERY).await.unwrap();
        let out = fs::read_to_string(f.dir.join("a@b.c/out")).unwrap();
        assert_eq!(out, format!("{VERSION_QUERY}\n"));
    }

    #[tokio::test]
    async fn test_request_appended_to_plain_extension_file() {
        let mut f = fixture();
        let ext = f.dir.join("ext/jabber:iq:version");
        fs::write(&ext, "").unwrap();
        f.deliver(VERSION_QUERY).await.unwrap();
        assert_eq!(fs::read_to_string(&ext).unwrap(), VERSION_QUERY);
        assert!(f.roster.is_empty());
    }

    #[tokio::test]
    async fn test_executable_extension_receives_stanza() {
        let mut f = fixture();
        let ext = f.dir.join("ext/urn:xmpp:time");
        fs::write(&ext, "#!/bin/sh\ncat > \"$2/ran.tmp\" && mv \"$2/ran.tmp\" \"$2/ran\"\n").unwrap();
        fs::set_permissions(&ext, fs::Permissions::from_mode(0o700)).unwrap();

        let query = "<iq type='get' id='t1' from='a@b.c/res'><time xmlns='urn:xmpp:time'/></iq>";
        f.deliver(query).await.unwrap();

        let ran = f.dir.join("ran");
        assert!(eventually(|| ran.exists()).await);
        assert_eq!(fs::read_to_string(ran).unwrap(), query);
    }

    #[tokio::test]
    async fn test_protocol_namespace_is_ignored() {
        let mut f = fixture();
        f.deliver("<iq type='get' id='d1' from='a@b.c'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>")
            .await
            .unwrap();
        assert!(f.roster.is_empty());
    }

    #[tokio::test]
    async fn test_result_written_to_id_file() {
        let mut f = fixture();
        let result = "<iq type='result' id='roster_1' from='example.com'/>";
        f.deliver(result).await.unwrap();
        assert_eq!(fs::read_to_string(f.dir.join("roster_1")).unwrap(), result);
    }

    #[tokio::test]
    async fn test_result_with_unsafe_id_is_rejected() {
        let mut f = fixture();
        assert!(f.deliver("<iq type='result' id='../escape' from='example.com'/>").await.is_err());
        assert!(f.deliver("<iq type='result' id='ext' from='example.com'/>").await.is_err());
    }

    #[tokio::test]
    async fn test_error_goes_to_sender() {
        let mut f = fixture();
        let error = "<iq type='error' id='x1' from='a@b.c'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>";
        f.deliver(error).await.unwrap();
        let out = fs::read_to_string(f.dir.join("a@b.c/out")).unwrap();
        assert_eq!(out.trim_end(), error);
    }
}
