//! The XMPP session: one client stream to the server, negotiated up to an
//! established session, then multiplexed between the server, the mailbox
//! control pipe and the helper daemons.
//!
//! # Flow
//!
//! 1. [`connect`] resolves the server and opens TCP (or direct TLS)
//! 2. [`Session::run`] drives negotiation through the [`Negotiator`]
//! 3. STARTTLS ends `run` with [`Outcome::StartTls`]; [`Session::secure`]
//!    upgrades the transport and `run` is called again
//! 4. Once established, stanzas are routed to helpers and the mailbox control
//!    pipe is forwarded verbatim to the server

pub mod dns;
pub mod helpers;
pub mod negotiator;
pub mod tls;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::client::TlsStream;
use tracing::{debug, error, info, warn};

use crate::framing::{Frame, FramingError, StanzaFramer};
use crate::mailbox::{HelperKind, Mailbox, MailboxError, PipeReader};
use crate::stanza::{Element, ParseError};

use dns::{parse_server_input, resolve_server, ConnectionMode, Endpoint, ParsedServer};
use helpers::{HelperLauncher, HelperQueue, HelperSpec};
pub use negotiator::{Action, Credentials, Negotiator, ProtocolState};
use negotiator::{stream_header, STREAM_CLOSE};

/// Timeout for each TCP connect attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default idle time before a keepalive ping.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

const READ_BUF_SIZE: usize = 8192;

/// Log target for raw protocol traffic, enabled with `--verbose=xmpp`.
pub const TRAFFIC_TARGET: &str = "sj::xmpp";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid address {0:?}, expected user@domain[/resource]")]
    InvalidJid(String),
    #[error("failed to connect to {server}: {reason}")]
    Connect { server: String, reason: String },
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("unparsable stanza: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error("server does not offer SASL PLAIN")]
    NoSupportedMechanism,
    #[error("server sent <proceed/> without a STARTTLS request")]
    UnexpectedProceed,
    #[error("server requested STARTTLS on an already secured stream")]
    AlreadySecured,
    #[error("authentication failed: {0}")]
    Failure(String),
    #[error("resource binding failed: {0}")]
    BindFailed(String),
    #[error("session establishment rejected: {0}")]
    SessionRejected(String),
    #[error("stream error from server: {0}")]
    StreamError(String),
    #[error("unexpected stanza: {0}")]
    Unexpected(String),
    #[error("protocol state cannot go from {from:?} back to {to:?}")]
    Regression {
        from: ProtocolState,
        to: ProtocolState,
    },
    #[error("server closed the connection")]
    Disconnected,
}

/// Settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Credentials,
    /// Server input: domain, `host:port`, `tls://host[:port]` or `tcp://...`.
    /// Empty means the domain of the address.
    pub server: String,
    pub mailbox_dir: PathBuf,
    pub keepalive: Duration,
    pub insecure_tls: bool,
}

/// Byte stream the session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// How a call to [`Session::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The stream was closed, by the server or by a shutdown request.
    Finished,
    /// The server accepted STARTTLS; call [`Session::secure`] and run again.
    StartTls,
}

enum Flow {
    Continue,
    StartTls,
    Closed,
}

/// A freshly connected server transport.
pub enum Connection {
    Plain(TcpStream),
    Secured(TlsStream<TcpStream>),
}

/// Resolve the server and connect to the first endpoint that answers.
pub async fn connect(
    server: &str,
    domain: &str,
    insecure_tls: bool,
) -> Result<Connection, SessionError> {
    let input = if server.trim().is_empty() { domain } else { server };
    let resolve_started = std::time::Instant::now();
    let endpoints = match parse_server_input(input) {
        ParsedServer::Direct(endpoint) => {
            info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode, "Using explicit endpoint");
            vec![endpoint]
        }
        ParsedServer::Domain(d) => resolve_server(&d).await,
    };
    debug!(
        candidates = endpoints.len(),
        dns_resolve_ms = resolve_started.elapsed().as_millis() as u64,
        "Resolved endpoints"
    );

    let mut last_error = String::from("no endpoints");
    for endpoint in &endpoints {
        match connect_endpoint(endpoint, domain, insecure_tls).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(host = %endpoint.host, port = endpoint.port, error = %e, "Endpoint failed, trying next");
                last_error = e.to_string();
            }
        }
    }
    Err(SessionError::Connect {
        server: input.to_string(),
        reason: last_error,
    })
}

async fn connect_endpoint(
    endpoint: &Endpoint,
    domain: &str,
    insecure_tls: bool,
) -> Result<Connection, SessionError> {
    let tcp = tokio::time::timeout(
        TCP_CONNECT_TIMEOUT,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| {
        error!(
            host = %endpoint.host, port = endpoint.port,
            timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(),
            "TCP connect timed out"
        );
        SessionError::Connect {
            server: format!("{}:{}", endpoint.host, endpoint.port),
            reason: format!("timed out after {}s", TCP_CONNECT_TIMEOUT.as_secs()),
        }
    })?
    .map_err(|e| {
        error!(
            host = %endpoint.host, port = endpoint.port,
            error = %e, error_kind = ?e.kind(),
            "TCP connect failed"
        );
        SessionError::Connect {
            server: format!("{}:{}", endpoint.host, endpoint.port),
            reason: e.to_string(),
        }
    })?;

    match endpoint.mode {
        ConnectionMode::Tcp => {
            info!(host = %endpoint.host, port = endpoint.port, "Connected (TCP)");
            Ok(Connection::Plain(tcp))
        }
        ConnectionMode::DirectTls => {
            // SNI carries the XMPP domain, not the SRV target host
            let tls = tls::upgrade_to_tls(tcp, domain, insecure_tls).await?;
            info!(host = %endpoint.host, port = endpoint.port, tls_name = domain, "Connected (direct TLS)");
            Ok(Connection::Secured(tls))
        }
    }
}

/// One client stream and everything attached to it.
pub struct Session<S> {
    stream: S,
    framer: StanzaFramer,
    negotiator: Negotiator,
    mailbox: Mailbox,
    inbox: Option<PipeReader>,
    helpers: BTreeMap<HelperKind, HelperQueue>,
    launcher: Box<dyn HelperLauncher>,
    keepalive: Duration,
    insecure_tls: bool,
    shutdown_rx: broadcast::Receiver<()>,
    shutdown_armed: bool,
}

impl<S: Transport> Session<S> {
    /// Wrap a connected transport. `secured` tells whether it already runs
    /// over TLS, in which case STARTTLS is never requested.
    pub fn new(
        stream: S,
        config: &SessionConfig,
        mailbox: Mailbox,
        launcher: Box<dyn HelperLauncher>,
        secured: bool,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stream,
            framer: StanzaFramer::stream(),
            negotiator: Negotiator::new(config.credentials.clone(), secured),
            mailbox,
            inbox: None,
            helpers: BTreeMap::new(),
            launcher,
            keepalive: config.keepalive,
            insecure_tls: config.insecure_tls,
            shutdown_rx: shutdown,
            shutdown_armed: true,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.negotiator.state()
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    /// Open the stream and process traffic until the stream ends or the
    /// transport has to be upgraded.
    pub async fn run(&mut self) -> Result<Outcome, SessionError> {
        self.send_header().await?;

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut inbox_buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let established = self.negotiator.state() == ProtocolState::Established;
            let armed = self.shutdown_armed;
            tokio::select! {
                read = self.stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        info!("Server closed the connection");
                        return Err(SessionError::Disconnected);
                    }
                    debug!(bytes = n, "Received from server");
                    self.framer.push(&buf[..n]);
                    while let Some(frame) = self.framer.next_frame()? {
                        match self.handle_frame(frame).await? {
                            Flow::Continue => {}
                            Flow::StartTls => return Ok(Outcome::StartTls),
                            Flow::Closed => return Ok(Outcome::Finished),
                        }
                    }
                }
                read = read_inbox(&mut self.inbox, &mut inbox_buf) => {
                    let n = read?;
                    debug!(target: TRAFFIC_TARGET, data = %String::from_utf8_lossy(&inbox_buf[..n]), "MAILBOX->SERVER");
                    self.stream.write_all(&inbox_buf[..n]).await?;
                    self.stream.flush().await?;
                }
                _ = tokio::time::sleep(self.keepalive), if established => {
                    if let Some(ping) = self.negotiator.keepalive() {
                        self.send(&ping).await?;
                    }
                }
                signal = self.shutdown_rx.recv(), if armed => {
                    if let Err(broadcast::error::RecvError::Closed) = signal {
                        debug!("Shutdown channel closed");
                        self.shutdown_armed = false;
                        continue;
                    }
                    info!("Shutdown requested");
                    self.shutdown().await?;
                    return Ok(Outcome::Finished);
                }
            }
        }
    }

    /// Close the stream, stop accepting mailbox input and release helpers.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        let result = self.send(STREAM_CLOSE).await;
        self.inbox = None;
        self.helpers.clear();
        if let Err(e) = self.mailbox.remove_control_pipe() {
            warn!(error = %e, "Failed to remove control pipe");
        }
        result
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        match frame {
            Frame::Header(header) => {
                debug!(target: TRAFFIC_TARGET, data = %header, "Stream header");
                Ok(Flow::Continue)
            }
            Frame::Close => {
                info!("Server closed the stream");
                self.shutdown().await?;
                Ok(Flow::Closed)
            }
            Frame::Stanza(text) => {
                debug!(target: TRAFFIC_TARGET, data = %text, "RECV");
                let element = Element::parse(&text)?;
                let actions = self.negotiator.on_stanza(&element, &text)?;
                for action in actions {
                    match action {
                        Action::Send(out) => self.send(&out).await?,
                        Action::RestartStream => {
                            self.framer.reset();
                            self.send_header().await?;
                        }
                        Action::StartTls => return Ok(Flow::StartTls),
                        Action::SpawnHelpers => self.spawn_helpers(),
                        Action::Forward(kind, stanza) => self.forward(kind, stanza),
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn send_header(&mut self) -> Result<(), SessionError> {
        let header = stream_header(&self.negotiator.credentials().domain);
        self.send(&header).await
    }

    async fn send(&mut self, data: &str) -> Result<(), SessionError> {
        debug!(target: TRAFFIC_TARGET, data = %data, "SEND");
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Launch every helper once and open the control pipe. A helper that
    /// fails to start is logged and its stanzas are dropped from then on.
    fn spawn_helpers(&mut self) {
        let jid = self.negotiator.credentials().bare_jid();
        let outbound = self.mailbox.inbox();
        for kind in HelperKind::ALL {
            if self.helpers.contains_key(&kind) {
                continue;
            }
            let dir = self.mailbox.helper_dir(kind);
            let spec = HelperSpec {
                kind,
                dir: &dir,
                jid: &jid,
                outbound: &outbound,
            };
            match self.launcher.launch(&spec) {
                Ok(sink) => {
                    self.helpers.insert(kind, HelperQueue::start(kind, sink));
                }
                Err(e) => {
                    error!(helper = %kind, error = %e, "Failed to launch helper, its stanzas will be dropped");
                }
            }
        }

        match PipeReader::open(&outbound) {
            Ok(reader) => {
                info!(path = %outbound.display(), "Accepting mailbox input");
                self.inbox = Some(reader);
            }
            Err(e) => error!(error = %e, "Failed to open control pipe, mailbox input disabled"),
        }
    }

    fn forward(&self, kind: HelperKind, stanza: String) {
        match self.helpers.get(&kind) {
            Some(queue) => {
                queue.offer(stanza);
            }
            None => debug!(helper = %kind, "No helper running, dropping stanza"),
        }
    }
}

impl<S: Transport> Session<S> {
    /// Upgrade the transport to TLS after the server's `<proceed/>`.
    pub async fn secure(self) -> Result<Session<TlsStream<S>>, SessionError> {
        let Session {
            stream,
            mut framer,
            mut negotiator,
            mailbox,
            inbox,
            helpers,
            launcher,
            keepalive,
            insecure_tls,
            shutdown_rx,
            shutdown_armed,
        } = self;

        let domain = negotiator.credentials().domain.clone();
        let stream = tls::upgrade_to_tls(stream, &domain, insecure_tls).await?;
        info!(domain = %domain, "STARTTLS upgrade complete");
        framer.reset();
        negotiator.mark_secured();

        Ok(Session {
            stream,
            framer,
            negotiator,
            mailbox,
            inbox,
            helpers,
            launcher,
            keepalive,
            insecure_tls,
            shutdown_rx,
            shutdown_armed,
        })
    }
}

async fn read_inbox(inbox: &mut Option<PipeReader>, buf: &mut [u8]) -> Result<usize, MailboxError> {
    match inbox {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Drive a session over `stream` to completion, upgrading to TLS once if the
/// server asks for it.
pub async fn drive<S: Transport>(
    stream: S,
    config: &SessionConfig,
    mailbox: Mailbox,
    launcher: Box<dyn HelperLauncher>,
    secured: bool,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), SessionError> {
    let mut session = Session::new(stream, config, mailbox, launcher, secured, shutdown);
    match session.run().await? {
        Outcome::Finished => Ok(()),
        Outcome::StartTls => {
            let mut secured = session.secure().await?;
            match secured.run().await? {
                Outcome::Finished => Ok(()),
                Outcome::StartTls => Err(SessionError::AlreadySecured),
            }
        }
    }
}

/// Connect to the server and run the session until it ends.
pub async fn run_client(
    config: &SessionConfig,
    launcher: Box<dyn HelperLauncher>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), SessionError> {
    let mailbox = Mailbox::create(&config.mailbox_dir)?;
    let domain = config.credentials.domain.clone();
    match connect(&config.server, &domain, config.insecure_tls).await? {
        Connection::Plain(tcp) => drive(tcp, config, mailbox, launcher, false, shutdown).await,
        Connection::Secured(tls) => drive(tls, config, mailbox, launcher, true, shutdown).await,
    }
}
