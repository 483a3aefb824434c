//! Launching the helper daemons that consume routed stanzas.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::mailbox::HelperKind;

/// Writable end a helper reads stanzas from.
pub type HelperSink = Box<dyn AsyncWrite + Unpin + Send>;

/// Stanzas that may wait for one helper before new ones are dropped.
pub const HELPER_QUEUE_DEPTH: usize = 256;

/// Bounded queue in front of a helper's pipe, drained by a writer task of
/// its own. A helper that stops reading only loses its own stanzas.
#[derive(Debug)]
pub struct HelperQueue {
    kind: HelperKind,
    tx: mpsc::Sender<String>,
}

impl HelperQueue {
    pub fn start(kind: HelperKind, sink: HelperSink) -> Self {
        Self::with_depth(kind, sink, HELPER_QUEUE_DEPTH)
    }

    pub fn with_depth(kind: HelperKind, mut sink: HelperSink, depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(depth.max(1));
        tokio::spawn(async move {
            while let Some(stanza) = rx.recv().await {
                let written = async {
                    sink.write_all(stanza.as_bytes()).await?;
                    sink.flush().await
                }
                .await;
                match written {
                    Ok(()) => debug!(helper = %kind, bytes = stanza.len(), "Forwarded stanza"),
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        warn!(helper = %kind, "Helper stopped reading, its stanzas will be dropped");
                        break;
                    }
                    Err(e) => {
                        warn!(helper = %kind, error = %e, "Failed to forward stanza, its stanzas will be dropped");
                        break;
                    }
                }
            }
        });
        Self { kind, tx }
    }

    /// Queue a stanza without waiting. Returns false if it was dropped.
    pub fn offer(&self, stanza: String) -> bool {
        match self.tx.try_send(stanza) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(helper = %self.kind, "Helper is busy, stanza dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(helper = %self.kind, "Helper is not listening, stanza dropped");
                false
            }
        }
    }
}

/// Everything a helper needs to know about the session it serves.
#[derive(Debug, Clone)]
pub struct HelperSpec<'a> {
    pub kind: HelperKind,
    /// Mailbox subtree owned by the helper.
    pub dir: &'a Path,
    /// Bare address of the account.
    pub jid: &'a str,
    /// Control pipe of the session, for helpers that send stanzas back.
    pub outbound: &'a Path,
}

/// Starts helpers for an established session.
pub trait HelperLauncher: Send {
    fn launch(&mut self, spec: &HelperSpec<'_>) -> io::Result<HelperSink>;
}

/// Runs each helper as a child process fed through its stdin.
///
/// Children are killed when the launcher is dropped.
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    bin_dir: Option<PathBuf>,
    verbose: Option<String>,
    children: Vec<Child>,
}

impl ProcessLauncher {
    /// `bin_dir` overrides where helper executables are looked up. Without
    /// it, the directory of the running executable is tried, then `PATH`.
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self {
            bin_dir,
            verbose: None,
            children: Vec::new(),
        }
    }

    /// Pass `--verbose[=filter]` on to every helper.
    pub fn with_verbose(mut self, verbose: Option<String>) -> Self {
        self.verbose = verbose;
        self
    }

    fn program_path(&self, kind: HelperKind) -> PathBuf {
        if let Some(dir) = &self.bin_dir {
            return dir.join(kind.program());
        }
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.join(kind.program())));
        match sibling {
            Some(path) if path.is_file() => path,
            _ => PathBuf::from(kind.program()),
        }
    }
}

impl HelperLauncher for ProcessLauncher {
    fn launch(&mut self, spec: &HelperSpec<'_>) -> io::Result<HelperSink> {
        let program = self.program_path(spec.kind);
        let mut cmd = Command::new(&program);
        cmd.arg("-d").arg(spec.dir).arg("-j").arg(spec.jid);
        if spec.kind == HelperKind::Message {
            cmd.arg("--outbound").arg(spec.outbound);
        }
        if let Some(filter) = &self.verbose {
            if filter.is_empty() {
                cmd.arg("--verbose");
            } else {
                cmd.arg(format!("--verbose={}", filter));
            }
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        debug!(program = %program.display(), helper = %spec.kind, "Spawning helper");
        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "helper stdin not captured"))?;
        info!(helper = %spec.kind, pid = ?child.id(), dir = %spec.dir.display(), "Helper started");
        self.children.push(child);
        Ok(Box::new(stdin))
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        for child in &mut self.children {
            match child.try_wait() {
                Ok(Some(status)) => debug!(pid = ?child.id(), %status, "Helper already exited"),
                Ok(None) => {
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "Failed to stop helper");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to query helper"),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt};

    use super::*;

    #[tokio::test]
    async fn test_queue_delivers_in_order() {
        let (writer, mut reader) = duplex(1024);
        let queue = HelperQueue::start(HelperKind::Presence, Box::new(writer));
        assert!(queue.offer("<presence/>".to_string()));
        assert!(queue.offer("<presence type='unavailable'/>".to_string()));

        let expected = "<presence/><presence type='unavailable'/>";
        let mut got = vec![0u8; expected.len()];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected.as_bytes());
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_waiting() {
        let (writer, _reader) = duplex(16);
        let queue = HelperQueue::with_depth(HelperKind::Message, Box::new(writer), 1);
        let stanza = format!("<message><body>{}</body></message>", "x".repeat(64));
        let accepted = (0..3).filter(|_| queue.offer(stanza.clone())).count();
        assert!(accepted < 3);
    }

    #[tokio::test]
    async fn test_closed_helper_is_reported() {
        let (writer, reader) = duplex(16);
        drop(reader);
        let queue = HelperQueue::start(HelperKind::Iq, Box::new(writer));
        queue.offer("<iq/>".to_string());
        let mut dropped = false;
        for _ in 0..100 {
            if !queue.offer("<iq/>".to_string()) {
                dropped = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(dropped);
    }

    #[test]
    fn test_program_path_uses_bin_dir() {
        let launcher = ProcessLauncher::new(Some(PathBuf::from("/opt/sj/bin")));
        assert_eq!(
            launcher.program_path(HelperKind::Presence),
            PathBuf::from("/opt/sj/bin/presenced")
        );
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_launch() {
        let tmp = tempfile::tempdir().unwrap();
        let mut launcher = ProcessLauncher::new(Some(tmp.path().to_path_buf()));
        let spec = HelperSpec {
            kind: HelperKind::Iq,
            dir: tmp.path(),
            jid: "user@example.com",
            outbound: &tmp.path().join("in"),
        };
        assert!(launcher.launch(&spec).is_err());
    }
}
