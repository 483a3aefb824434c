//! A minimal XMPP client whose parts talk through the filesystem.
//!
//! The `sj` binary owns the server connection ([`session`]) and routes
//! stanzas to three helper daemons (`messaged`, `presenced`, `iqd`, see
//! [`daemon`]) that mirror them into a per-contact directory tree
//! ([`mailbox`]).

pub mod daemon;
pub mod framing;
pub mod logging;
pub mod mailbox;
pub mod session;
pub mod stanza;

/// Version string shown by `--version`.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (build ", env!("GIT_HASH"), ")");
