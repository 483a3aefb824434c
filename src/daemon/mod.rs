//! Shared event loop of the helper daemons.
//!
//! Each daemon reads pre-classified stanzas from the session on stdin, keeps
//! a [`Roster`] of contacts under its directory and, for handlers that
//! watch contact inboxes, turns text written by the user into stanzas sent
//! back through the outbound sink. `SIGHUP` rescans the directory.

pub mod iq;
pub mod message;
pub mod presence;
pub mod roster;

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::framing::{Frame, FramingError, StanzaFramer};
use crate::mailbox::{self, HelperKind, MailboxError, PipeReader};
use crate::stanza::Element;

pub use roster::{Contact, Roster};

const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("{0:?} cannot be used as a contact name")]
    InvalidContact(String),
    #[error("stanza is missing {0}")]
    Missing(&'static str),
}

/// Per-category behaviour plugged into [`serve`].
#[allow(async_fn_in_trait)]
pub trait StanzaHandler {
    const KIND: HelperKind;
    /// File in each contact directory the handler writes to.
    const OUTPUT_FILE: &'static str;
    /// Whether contact inboxes carry user input for this handler.
    const WATCH_INBOX: bool = false;
    /// Subdirectories of the daemon directory that are not contacts.
    const RESERVED: &'static [&'static str] = &[];

    /// Apply one stanza from the session.
    async fn on_stanza(
        &mut self,
        roster: &mut Roster,
        stanza: &Element,
        raw: &str,
    ) -> Result<(), DaemonError>;

    /// Turn text the user wrote into a contact's inbox into a stanza for the
    /// server.
    fn on_input(&mut self, _contact: &Contact, _text: &str) -> Result<Option<String>, DaemonError> {
        Ok(None)
    }
}

/// Where stanzas produced by a daemon go.
#[derive(Debug)]
pub enum Outbound {
    Stdout(tokio::io::Stdout),
    /// A path opened per write; normally the session's control pipe.
    Path(PathBuf),
}

impl Outbound {
    pub fn new(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => Outbound::Path(path),
            None => Outbound::Stdout(tokio::io::stdout()),
        }
    }

    pub async fn send(&mut self, stanza: &str) -> Result<(), DaemonError> {
        match self {
            Outbound::Stdout(out) => {
                out.write_all(stanza.as_bytes()).await?;
                out.flush().await?;
            }
            Outbound::Path(path) => mailbox::write_nonblocking_retry(path, stanza.as_bytes()).await?,
        }
        Ok(())
    }
}

/// Command line shared by every helper daemon.
#[derive(Debug, Clone, clap::Args)]
pub struct DaemonArgs {
    /// Directory holding one subdirectory per contact
    #[arg(short = 'd', long = "dir", default_value = ".")]
    pub dir: PathBuf,

    /// Bare address of the local account
    #[arg(short = 'j', long = "jid")]
    pub jid: Option<String>,

    /// Write outgoing stanzas to this file or pipe instead of stdout
    #[arg(long)]
    pub outbound: Option<PathBuf>,

    /// Verbose logging; `--verbose=xmpp` also logs stanza text
    #[arg(short, long, num_args = 0..=1, default_missing_value = "", require_equals = true)]
    pub verbose: Option<String>,

    /// Also log to a daily-rotating file in this directory
    #[arg(long, value_name = "DIR", require_equals = true)]
    pub log_file: Option<PathBuf>,
}

/// Text read from one contact's inbox.
#[derive(Debug)]
struct Input {
    contact: String,
    text: String,
}

/// Run a daemon on a single-threaded runtime with stdin as control input.
pub fn run_daemon<H: StanzaHandler>(handler: H, args: &DaemonArgs) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let outbound = Outbound::new(args.outbound.clone());
    runtime.block_on(serve(handler, args.dir.clone(), tokio::io::stdin(), outbound))
}

/// Event loop: control input, contact inboxes and reload requests. Returns
/// once the control input reaches end-of-file.
pub async fn serve<H, R>(
    mut handler: H,
    dir: PathBuf,
    mut control: R,
    mut outbound: Outbound,
) -> Result<(), DaemonError>
where
    H: StanzaHandler,
    R: AsyncRead + Unpin,
{
    mailbox::create_dir(&dir)?;
    let mut roster = Roster::new(&dir, H::OUTPUT_FILE, H::RESERVED);
    roster.scan()?;
    info!(helper = %H::KIND, dir = %dir.display(), contacts = roster.len(), "Daemon started");

    let (tx, mut rx) = mpsc::channel::<Input>(64);
    let mut watchers = Watchers::new(tx);
    watchers.watch_fresh::<H>(&mut roster);

    let mut hangup = signal(SignalKind::hangup())?;
    let mut framer = StanzaFramer::bare();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        tokio::select! {
            read = control.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    info!(helper = %H::KIND, "Control input closed, exiting");
                    return Ok(());
                }
                framer.push(&buf[..n]);
                loop {
                    match framer.next_frame() {
                        Ok(Some(Frame::Stanza(text))) => {
                            dispatch(&mut handler, &mut roster, &text).await;
                        }
                        Ok(Some(other)) => debug!(frame = ?other, "Ignoring non-stanza frame"),
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "Malformed control input, discarding buffer");
                            framer.reset();
                            break;
                        }
                    }
                }
                watchers.watch_fresh::<H>(&mut roster);
            }
            Some(done) = watchers.tasks.join_next(), if !watchers.tasks.is_empty() => {
                watchers.stopped(done);
            }
            Some(input) = rx.recv() => {
                let Some(contact) = roster.get(&input.contact) else {
                    continue;
                };
                match handler.on_input(contact, &input.text) {
                    Ok(Some(stanza)) => {
                        debug!(target: crate::session::TRAFFIC_TARGET, data = %stanza, "OUTBOUND");
                        if let Err(e) = outbound.send(&stanza).await {
                            warn!(contact = %input.contact, error = %e, "Failed to send stanza");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(contact = %input.contact, error = %e, "Failed to handle input"),
                }
            }
            _ = hangup.recv() => {
                info!(helper = %H::KIND, "Reload requested, rescanning roster");
                if let Err(e) = roster.scan() {
                    error!(error = %e, "Roster scan failed");
                }
                watchers.watch_fresh::<H>(&mut roster);
                watchers.rearm(&roster);
            }
        }
    }
}

async fn dispatch<H: StanzaHandler>(handler: &mut H, roster: &mut Roster, text: &str) {
    debug!(target: crate::session::TRAFFIC_TARGET, data = %text, "RECV");
    let stanza = match Element::parse(text) {
        Ok(stanza) => stanza,
        Err(e) => {
            warn!(error = %e, "Unparsable stanza from session");
            return;
        }
    };
    if let Err(e) = handler.on_stanza(roster, &stanza, text).await {
        warn!(helper = %H::KIND, error = %e, "Failed to handle stanza");
    }
}

/// Inbox readers, one task per contact. A reader that fails is parked
/// until the next reload.
struct Watchers {
    tasks: JoinSet<Option<String>>,
    dormant: Vec<String>,
    tx: mpsc::Sender<Input>,
}

impl Watchers {
    fn new(tx: mpsc::Sender<Input>) -> Self {
        Self {
            tasks: JoinSet::new(),
            dormant: Vec::new(),
            tx,
        }
    }

    /// Start readers for contacts added since the last call.
    fn watch_fresh<H: StanzaHandler>(&mut self, roster: &mut Roster) {
        let fresh = roster.take_fresh();
        if H::WATCH_INBOX {
            self.watch(roster, fresh);
        }
    }

    /// Restart readers that failed since the last reload.
    fn rearm(&mut self, roster: &Roster) {
        let dormant = std::mem::take(&mut self.dormant);
        if !dormant.is_empty() {
            info!(count = dormant.len(), "Re-arming inbox readers");
        }
        self.watch(roster, dormant);
    }

    fn watch(&mut self, roster: &Roster, names: Vec<String>) {
        for name in names {
            let Some(contact) = roster.get(&name) else {
                continue;
            };
            let inbox = contact.inbox();
            self.tasks.spawn(watch_inbox(name, inbox, self.tx.clone()));
        }
    }

    fn stopped(&mut self, done: Result<Option<String>, tokio::task::JoinError>) {
        match done {
            Ok(Some(contact)) => self.dormant.push(contact),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Inbox reader task failed"),
        }
    }
}

/// Forward everything written to `path`. Returns the contact name if the
/// reader failed and should be restarted later.
async fn watch_inbox(contact: String, path: PathBuf, tx: mpsc::Sender<Input>) -> Option<String> {
    let opened = mailbox::make_fifo(&path).and_then(|()| PipeReader::open(&path));
    let mut reader = match opened {
        Ok(reader) => reader,
        Err(e) => {
            warn!(contact = %contact, error = %e, "Cannot watch contact inbox until next reload");
            return Some(contact);
        }
    };
    debug!(contact = %contact, "Watching inbox");
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(n) => {
                let input = Input {
                    contact: contact.clone(),
                    text: String::from_utf8_lossy(&buf[..n]).into_owned(),
                };
                if tx.send(input).await.is_err() {
                    return None;
                }
            }
            Err(e) => {
                warn!(contact = %contact, error = %e, "Inbox read failed, watching again after next reload");
                return Some(contact);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    /// Poll `check` until it holds or a few seconds pass.
    pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }
}
