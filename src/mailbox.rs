//! Filesystem mailbox: the directory tree and named pipes shared by the
//! session and its helper daemons.
//!
//! # Layout
//!
//! ```text
//! {dir}/
//!   in                   # FIFO, stanza text forwarded verbatim to the server
//!   message/{bare}/      # owned by messaged: in (FIFO), out (transcript)
//!   presence/{bare}/     # owned by presenced: in (FIFO), status
//!   iq/{bare}/           # owned by iqd: in (FIFO), out; plus ext/ and {id}
//! ```

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::{debug, info, warn};

/// Name of the control pipe inside the mailbox root and inside each contact.
pub const INBOX: &str = "in";

/// Attempts made to open a FIFO that has no reader yet.
pub const OPEN_RETRIES: u32 = 10;

/// Pause between attempts when the target FIFO has no reader.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} exists and is not a named pipe")]
    NotAPipe(PathBuf),
    #[error("no reader is listening on {0}")]
    NotListening(PathBuf),
}

impl MailboxError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which helper owns a mailbox subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HelperKind {
    Message,
    Presence,
    Iq,
}

impl HelperKind {
    pub const ALL: [HelperKind; 3] = [HelperKind::Message, HelperKind::Presence, HelperKind::Iq];

    /// Subdirectory of the mailbox owned by this helper.
    pub fn subdir(self) -> &'static str {
        match self {
            HelperKind::Message => "message",
            HelperKind::Presence => "presence",
            HelperKind::Iq => "iq",
        }
    }

    /// Executable name of the helper daemon.
    pub fn program(self) -> &'static str {
        match self {
            HelperKind::Message => "messaged",
            HelperKind::Presence => "presenced",
            HelperKind::Iq => "iqd",
        }
    }

    /// Category for a stanza root tag, if it is one the helpers handle.
    pub fn for_tag(tag: &str) -> Option<Self> {
        match tag {
            "message" => Some(HelperKind::Message),
            "presence" => Some(HelperKind::Presence),
            "iq" => Some(HelperKind::Iq),
            _ => None,
        }
    }
}

impl std::fmt::Display for HelperKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.subdir())
    }
}

/// Root of a session's mailbox tree.
#[derive(Debug, Clone)]
pub struct Mailbox {
    root: PathBuf,
}

impl Mailbox {
    /// Create the mailbox root, its control pipe and one subtree per helper.
    /// Existing pieces are reused.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, MailboxError> {
        let root = root.into();
        create_dir(&root)?;
        make_fifo(&root.join(INBOX))?;
        for kind in HelperKind::ALL {
            create_dir(&root.join(kind.subdir()))?;
        }
        info!(dir = %root.display(), "Mailbox ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the control pipe read by the session.
    pub fn inbox(&self) -> PathBuf {
        self.root.join(INBOX)
    }

    /// Subtree managed by one helper.
    pub fn helper_dir(&self, kind: HelperKind) -> PathBuf {
        self.root.join(kind.subdir())
    }

    /// Remove the control pipe so writers fail fast once the session is gone.
    /// Helper subtrees are left for the operator.
    pub fn remove_control_pipe(&self) -> Result<(), MailboxError> {
        let path = self.inbox();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed control pipe");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MailboxError::io(&path, e)),
        }
    }
}

/// `mkdir -p` with owner-only permissions.
pub fn create_dir(path: &Path) -> Result<(), MailboxError> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|e| MailboxError::io(path, e))
}

/// Create a named pipe at `path`. An existing FIFO is accepted as is.
pub fn make_fifo(path: &Path) -> Result<(), MailboxError> {
    let c_path =
        CString::new(path.as_os_str().as_bytes()).map_err(|e| MailboxError::io(path, e.into()))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == 0 {
        debug!(path = %path.display(), "Created named pipe");
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EEXIST) {
        return Err(MailboxError::io(path, err));
    }
    let meta = fs::metadata(path).map_err(|e| MailboxError::io(path, e))?;
    if meta.file_type().is_fifo() {
        Ok(())
    } else {
        Err(MailboxError::NotAPipe(path.to_path_buf()))
    }
}

/// Create `path` as an empty regular file if it does not exist yet.
pub fn touch(path: &Path) -> Result<(), MailboxError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map(drop)
        .map_err(|e| MailboxError::io(path, e))
}

/// Append `line` plus a newline to a regular file, creating it if needed.
pub fn append_line(path: &Path, line: &str) -> Result<(), MailboxError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| MailboxError::io(path, e))?;
    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');
    file.write_all(record.as_bytes())
        .map_err(|e| MailboxError::io(path, e))
}

/// Replace the whole content of a regular file.
pub fn overwrite(path: &Path, content: &str) -> Result<(), MailboxError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| MailboxError::io(path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| MailboxError::io(path, e))
}

/// Append `data` to `path`, which may be a regular file or a FIFO.
///
/// The open is non-blocking, so a FIFO without a reader reports `ENXIO`; that
/// is retried [`OPEN_RETRIES`] times, [`OPEN_RETRY_DELAY`] apart, before giving
/// up with [`MailboxError::NotListening`]. A reader that goes away mid-write
/// (`EPIPE`) is reported the same way.
pub async fn write_nonblocking_retry(path: &Path, data: &[u8]) -> Result<(), MailboxError> {
    let mut attempt = 0;
    let mut file = loop {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => break file,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                attempt += 1;
                if attempt >= OPEN_RETRIES {
                    warn!(path = %path.display(), attempts = attempt, "No reader on pipe, giving up");
                    return Err(MailboxError::NotListening(path.to_path_buf()));
                }
                tokio::time::sleep(OPEN_RETRY_DELAY).await;
            }
            Err(e) => return Err(MailboxError::io(path, e)),
        }
    };

    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(0) => return Err(MailboxError::NotListening(path.to_path_buf())),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                return Err(MailboxError::NotListening(path.to_path_buf()));
            }
            Err(e) => return Err(MailboxError::io(path, e)),
        }
    }
    Ok(())
}

/// Reader side of a named pipe that survives writers coming and going.
///
/// A FIFO reports end-of-file once its last writer disconnects, and keeps
/// doing so until it is reopened; `read` reopens transparently and waits for
/// the next writer.
#[derive(Debug)]
pub struct PipeReader {
    path: PathBuf,
    rx: pipe::Receiver,
}

impl PipeReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MailboxError> {
        let path = path.into();
        let rx = open_receiver(&path)?;
        Ok(Self { path, rx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next available chunk. Never returns 0.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MailboxError> {
        loop {
            match self.rx.read(buf).await {
                Ok(0) => {
                    debug!(path = %self.path.display(), "Pipe writer disconnected, reopening");
                    self.rx = open_receiver(&self.path)?;
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(MailboxError::io(&self.path, e)),
            }
        }
    }
}

fn open_receiver(path: &Path) -> Result<pipe::Receiver, MailboxError> {
    pipe::OpenOptions::new()
        .open_receiver(path)
        .map_err(|e| MailboxError::io(path, e))
}
