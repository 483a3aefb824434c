//! Stream negotiation and stanza routing, free of any I/O.
//!
//! The [`Negotiator`] consumes parsed stanzas and answers with [`Action`]s
//! for the session to carry out. It owns the protocol state and the table of
//! requests the session issued itself, so replies to those are consumed here
//! and never reach a helper.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};

use super::SessionError;
use crate::mailbox::HelperKind;
use crate::stanza::{escape_attr, escape_text, Element};

pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const NS_PING: &str = "urn:xmpp:ping";

/// Normal progression of a session. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolState {
    Open,
    Authenticating,
    BoundPending,
    Bound,
    Established,
}

/// What a request issued by the session expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Bind,
    Session,
    Ping,
}

impl RequestKind {
    fn prefix(self) -> &'static str {
        match self {
            RequestKind::Bind => "bind",
            RequestKind::Session => "sess",
            RequestKind::Ping => "ping",
        }
    }
}

/// Ids of in-flight requests issued by the session.
#[derive(Debug, Default)]
pub struct RequestTable {
    next: u64,
    pending: HashMap<String, RequestKind>,
}

impl RequestTable {
    pub fn issue(&mut self, kind: RequestKind) -> String {
        self.next += 1;
        let id = format!("{}_{}", kind.prefix(), self.next);
        self.pending.insert(id.clone(), kind);
        id
    }

    /// Remove and return the request a reply correlates to.
    pub fn take(&mut self, id: &str) -> Option<RequestKind> {
        self.pending.remove(id)
    }

    /// Drop every outstanding request of `kind`, returning how many there were.
    pub fn forget(&mut self, kind: RequestKind) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, k| *k != kind);
        before - self.pending.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Account the session logs into.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub domain: String,
    pub password: String,
    pub resource: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &"<redacted>")
            .field("resource", &self.resource)
            .finish()
    }
}

impl Credentials {
    /// Split `user@domain[/resource]`.
    pub fn from_jid(jid: &str, password: impl Into<String>) -> Result<Self, SessionError> {
        let (bare, resource) = match jid.split_once('/') {
            Some((bare, res)) if !res.is_empty() => (bare, Some(res.to_string())),
            Some((bare, _)) => (bare, None),
            None => (jid, None),
        };
        let (username, domain) = bare
            .split_once('@')
            .filter(|(u, d)| !u.is_empty() && !d.is_empty())
            .ok_or_else(|| SessionError::InvalidJid(jid.to_string()))?;
        Ok(Self {
            username: username.to_string(),
            domain: domain.to_string(),
            password: password.into(),
            resource,
        })
    }

    pub fn bare_jid(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }
}

/// Side effect requested by the negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write this text to the server.
    Send(String),
    /// Reset the framer and send a fresh stream header.
    RestartStream,
    /// Hand the transport to TLS, then restart the stream.
    StartTls,
    /// Launch the helper daemons and start accepting mailbox input.
    SpawnHelpers,
    /// Pass the stanza text to one helper.
    Forward(HelperKind, String),
}

/// Opening of the client stream.
pub fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xml:lang='en' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        escape_attr(domain)
    )
}

pub const STREAM_CLOSE: &str = "</stream:stream>";

#[derive(Debug)]
pub struct Negotiator {
    state: ProtocolState,
    requests: RequestTable,
    credentials: Credentials,
    secured: bool,
    tls_requested: bool,
    authenticated: bool,
    bound_jid: Option<String>,
}

impl Negotiator {
    pub fn new(credentials: Credentials, secured: bool) -> Self {
        Self {
            state: ProtocolState::Open,
            requests: RequestTable::default(),
            credentials,
            secured,
            tls_requested: false,
            authenticated: false,
            bound_jid: None,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_secured(&self) -> bool {
        self.secured
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Full address assigned by the server, once bound.
    pub fn bound_jid(&self) -> Option<&str> {
        self.bound_jid.as_deref()
    }

    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    /// The transport now runs over TLS.
    pub fn mark_secured(&mut self) {
        self.secured = true;
        self.tls_requested = false;
    }

    fn advance(&mut self, next: ProtocolState) -> Result<(), SessionError> {
        if next < self.state {
            return Err(SessionError::Regression {
                from: self.state,
                to: next,
            });
        }
        if next != self.state {
            info!(from = ?self.state, to = ?next, "Protocol state change");
        }
        self.state = next;
        Ok(())
    }

    /// Keepalive ping, only once established.
    pub fn keepalive(&mut self) -> Option<String> {
        if self.state != ProtocolState::Established {
            return None;
        }
        let unanswered = self.requests.forget(RequestKind::Ping);
        if unanswered > 0 {
            warn!(unanswered, "Previous keepalive ping got no reply");
        }
        let id = self.requests.issue(RequestKind::Ping);
        Some(format!(
            "<iq type='get' id='{}' to='{}'><ping xmlns='{}'/></iq>",
            id,
            escape_attr(&self.credentials.domain),
            NS_PING
        ))
    }

    /// React to one stanza from the server.
    pub fn on_stanza(&mut self, stanza: &Element, raw: &str) -> Result<Vec<Action>, SessionError> {
        match stanza.local_name() {
            "features" => self.on_features(stanza),
            "proceed" => {
                if !self.tls_requested {
                    return Err(SessionError::UnexpectedProceed);
                }
                info!("Server accepted STARTTLS");
                Ok(vec![Action::StartTls])
            }
            "success" if stanza.xmlns() == Some(NS_SASL) => {
                if self.state != ProtocolState::Authenticating || self.authenticated {
                    return Err(SessionError::Unexpected(raw.to_string()));
                }
                info!(user = %self.credentials.bare_jid(), "Authenticated");
                self.authenticated = true;
                Ok(vec![Action::RestartStream])
            }
            "failure" => Err(SessionError::Failure(condition(stanza))),
            "error" if stanza.name() == "stream:error" || stanza.xmlns().is_some_and(|ns| ns.contains("etherx")) => {
                Err(SessionError::StreamError(condition(stanza)))
            }
            "iq" => self.on_iq(stanza, raw),
            tag => match HelperKind::for_tag(tag) {
                Some(kind) if self.state == ProtocolState::Established => {
                    Ok(vec![Action::Forward(kind, raw.to_string())])
                }
                Some(kind) => {
                    debug!(helper = %kind, state = ?self.state, "Dropping stanza received before establishment");
                    Ok(Vec::new())
                }
                None => {
                    warn!(tag, "Ignoring unknown stanza");
                    Ok(Vec::new())
                }
            },
        }
    }

    fn on_features(&mut self, features: &Element) -> Result<Vec<Action>, SessionError> {
        if self.authenticated {
            if self.state != ProtocolState::Authenticating {
                debug!(state = ?self.state, "Ignoring repeated stream features");
                return Ok(Vec::new());
            }
            let id = self.requests.issue(RequestKind::Bind);
            let resource = match &self.credentials.resource {
                Some(r) => format!("<resource>{}</resource>", escape_text(r)),
                None => String::new(),
            };
            self.advance(ProtocolState::BoundPending)?;
            return Ok(vec![Action::Send(format!(
                "<iq type='set' id='{}'><bind xmlns='{}'>{}</bind></iq>",
                id, NS_BIND, resource
            ))]);
        }

        if self.state != ProtocolState::Open {
            debug!(state = ?self.state, "Ignoring stream features while authenticating");
            return Ok(Vec::new());
        }

        let offers_tls = features
            .children()
            .any(|c| c.local_name() == "starttls" && c.xmlns() == Some(NS_TLS));
        if offers_tls && !self.secured {
            info!("Server offers STARTTLS, requesting upgrade");
            self.tls_requested = true;
            return Ok(vec![Action::Send(format!("<starttls xmlns='{}'/>", NS_TLS))]);
        }

        let plain_offered = features
            .child("mechanisms")
            .map(|m| {
                m.children()
                    .filter(|c| c.local_name() == "mechanism")
                    .any(|c| c.text().trim() == "PLAIN")
            })
            .unwrap_or(false);
        if !plain_offered {
            return Err(SessionError::NoSupportedMechanism);
        }
        if !self.secured {
            warn!("Authenticating over an unencrypted connection");
        }

        let token = format!(
            "\0{}\0{}",
            self.credentials.username, self.credentials.password
        );
        self.advance(ProtocolState::Authenticating)?;
        Ok(vec![Action::Send(format!(
            "<auth xmlns='{}' mechanism='PLAIN'>{}</auth>",
            NS_SASL,
            BASE64.encode(token.as_bytes())
        ))])
    }

    fn on_iq(&mut self, iq: &Element, raw: &str) -> Result<Vec<Action>, SessionError> {
        let correlated = iq.id().and_then(|id| self.requests.take(id));
        let Some(kind) = correlated else {
            if self.state == ProtocolState::Established {
                return Ok(vec![Action::Forward(HelperKind::Iq, raw.to_string())]);
            }
            debug!(state = ?self.state, "Dropping iq received before establishment");
            return Ok(Vec::new());
        };

        let is_error = iq.stanza_type() == Some("error");
        match kind {
            RequestKind::Bind => {
                if is_error || iq.stanza_type() != Some("result") {
                    return Err(SessionError::BindFailed(condition_of_error(iq)));
                }
                let jid = iq
                    .child("bind")
                    .and_then(|b| b.child("jid"))
                    .map(|j| j.text().trim().to_string());
                info!(jid = ?jid, "Resource bound");
                self.bound_jid = jid;
                self.advance(ProtocolState::Bound)?;

                let id = self.requests.issue(RequestKind::Session);
                Ok(vec![Action::Send(format!(
                    "<iq type='set' id='{}' to='{}'><session xmlns='{}'/></iq>",
                    id,
                    escape_attr(&self.credentials.domain),
                    NS_SESSION
                ))])
            }
            RequestKind::Session => {
                if is_error || iq.stanza_type() != Some("result") {
                    return Err(SessionError::SessionRejected(condition_of_error(iq)));
                }
                self.advance(ProtocolState::Established)?;
                Ok(vec![
                    Action::SpawnHelpers,
                    Action::Send("<presence/>".to_string()),
                ])
            }
            RequestKind::Ping => {
                if is_error {
                    warn!(condition = %condition_of_error(iq), "Keepalive ping answered with an error");
                } else {
                    debug!("Keepalive pong");
                }
                Ok(Vec::new())
            }
        }
    }
}

/// Name of the first child, which carries the condition in `<failure/>` and
/// `<stream:error/>`.
fn condition(stanza: &Element) -> String {
    stanza
        .first_child()
        .map(|c| c.local_name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string())
}

fn condition_of_error(iq: &Element) -> String {
    iq.child("error")
        .map(condition)
        .unwrap_or_else(|| format!("unexpected type {:?}", iq.stanza_type()))
}
