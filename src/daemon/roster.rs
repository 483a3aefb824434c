//! Contacts known to a helper daemon, mirrored one-to-one onto directories.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::DaemonError;
use crate::mailbox::{self, INBOX};
use crate::stanza::bare;

/// One peer, keyed by bare address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    name: String,
    dir: PathBuf,
    output: PathBuf,
}

impl Contact {
    /// Create (or reuse) the contact directory with its inbox pipe and
    /// output file.
    fn create(root: &Path, name: &str, output_file: &str) -> Result<Self, DaemonError> {
        let dir = root.join(name);
        mailbox::create_dir(&dir)?;
        mailbox::make_fifo(&dir.join(INBOX))?;
        let output = dir.join(output_file);
        mailbox::touch(&output)?;
        Ok(Self {
            name: name.to_string(),
            dir,
            output,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn inbox(&self) -> PathBuf {
        self.dir.join(INBOX)
    }

    /// `out` or `status`, depending on the daemon.
    pub fn output(&self) -> &Path {
        &self.output
    }
}

/// Whether `name` can be used as a contact directory name.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && !name.contains('/') && !name.contains("..") && !name.contains('\0')
}

#[derive(Debug)]
pub struct Roster {
    root: PathBuf,
    output_file: &'static str,
    reserved: &'static [&'static str],
    contacts: BTreeMap<String, Contact>,
    fresh: Vec<String>,
}

impl Roster {
    /// `reserved` names subdirectories of `root` that are never contacts.
    pub fn new(
        root: impl Into<PathBuf>,
        output_file: &'static str,
        reserved: &'static [&'static str],
    ) -> Self {
        Self {
            root: root.into(),
            output_file,
            reserved,
            contacts: BTreeMap::new(),
            fresh: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Add every subdirectory of the root not known yet. Known contacts are
    /// never removed. A contact that cannot be set up is skipped and logged.
    pub fn scan(&mut self) -> Result<usize, DaemonError> {
        let entries = fs::read_dir(&self.root).map_err(|e| DaemonError::Io {
            path: self.root.clone(),
            source: e,
        })?;

        let mut added = 0;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %self.root.display(), error = %e, "Failed to read roster entry");
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.reserved.contains(&name.as_str()) || self.contacts.contains_key(&name) {
                continue;
            }
            if !valid_name(&name) {
                debug!(name, "Skipping directory that is not a contact");
                continue;
            }
            match self.insert(&name) {
                Ok(_) => added += 1,
                Err(e) => warn!(contact = %name, error = %e, "Failed to set up contact"),
            }
        }
        info!(dir = %self.root.display(), added, total = self.contacts.len(), "Roster scanned");
        Ok(added)
    }

    /// Contact for `address` (resource stripped), created on first use.
    pub fn ensure(&mut self, address: &str) -> Result<&Contact, DaemonError> {
        let name = bare(address);
        if !valid_name(name) || self.reserved.contains(&name) {
            return Err(DaemonError::InvalidContact(address.to_string()));
        }
        if !self.contacts.contains_key(name) {
            self.insert(name)?;
        }
        self.contacts
            .get(name)
            .ok_or_else(|| DaemonError::InvalidContact(address.to_string()))
    }

    fn insert(&mut self, name: &str) -> Result<&Contact, DaemonError> {
        let contact = Contact::create(&self.root, name, self.output_file)?;
        info!(contact = %name, "Added contact");
        self.fresh.push(name.to_string());
        Ok(self.contacts.entry(name.to_string()).or_insert(contact))
    }

    /// Contacts added since the last call.
    pub fn take_fresh(&mut self) -> Vec<String> {
        std::mem::take(&mut self.fresh)
    }

    pub fn get(&self, name: &str) -> Option<&Contact> {
        self.contacts.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contacts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
