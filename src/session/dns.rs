//! Server resolution: input parsing and SRV record lookup.
//!
//! Converts a server input string (bare domain, `host:port`, `tls://host:port`,
//! ...) into candidate endpoints ordered for connection attempts.

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Standard client port, plain TCP upgraded with STARTTLS.
pub const DEFAULT_PORT: u16 = 5222;
/// Conventional port for TLS from the first byte.
pub const DIRECT_TLS_PORT: u16 = 5223;

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// How the transport is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP; the session negotiates STARTTLS if the server offers it.
    Tcp,
    /// TLS handshake immediately after connecting.
    DirectTls,
}

/// Resolved endpoint from SRV records or explicit input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
}

/// Result of parsing the server input string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedServer {
    /// Explicit endpoint, no SRV lookup.
    Direct(Endpoint),
    /// Domain only, resolve through SRV.
    Domain(String),
}

fn split_host_port(input: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port_str)) = input.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return (host.trim_matches(['[', ']']).to_string(), port);
        }
    }
    (input.to_string(), default_port)
}

/// Parse the server input string.
///
/// Supported formats:
/// - `tls://host[:port]` → direct TLS, default port 5223
/// - `tcp://host[:port]` → STARTTLS, default port 5222
/// - `host:port`         → port 5223 means direct TLS, anything else STARTTLS
/// - `domain`            → SRV resolution
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    if let Some(rest) = trimmed.strip_prefix("tls://") {
        let (host, port) = split_host_port(rest, DIRECT_TLS_PORT);
        return ParsedServer::Direct(Endpoint {
            host,
            port,
            mode: ConnectionMode::DirectTls,
        });
    }

    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        let (host, port) = split_host_port(rest, DEFAULT_PORT);
        return ParsedServer::Direct(Endpoint {
            host,
            port,
            mode: ConnectionMode::Tcp,
        });
    }

    // rsplit_once keeps IPv6 literals intact
    if let Some((host, port_str)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            let mode = if port == DIRECT_TLS_PORT {
                ConnectionMode::DirectTls
            } else {
                ConnectionMode::Tcp
            };
            return ParsedServer::Direct(Endpoint {
                host: host.trim_matches(['[', ']']).to_string(),
                port,
                mode,
            });
        }
    }

    ParsedServer::Domain(trimmed.to_string())
}

/// Resolve a domain through SRV records (RFC 6120 §3.2).
///
/// Direct TLS records (`_xmpps-client._tcp`) come first, then STARTTLS records
/// (`_xmpp-client._tcp`), each sorted by priority ascending then weight
/// descending. Without any record the domain itself is used on port 5222.
pub async fn resolve_server(domain: &str) -> Vec<Endpoint> {
    let resolve_started = std::time::Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to load system DNS config: {}, falling back to default resolver", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints = Vec::new();
    for (service, mode) in [
        ("_xmpps-client._tcp", ConnectionMode::DirectTls),
        ("_xmpp-client._tcp", ConnectionMode::Tcp),
    ] {
        let srv_name = format!("{}.{}", service, domain);
        let lookup_started = std::time::Instant::now();
        match resolver.srv_lookup(&srv_name).await {
            Ok(lookup) => {
                let mut records: Vec<_> = lookup.iter().collect();
                records.sort_by(|a, b| {
                    a.priority()
                        .cmp(&b.priority())
                        .then(b.weight().cmp(&a.weight()))
                });
                for r in records {
                    let target = r.target().to_string().trim_end_matches('.').to_string();
                    // RFC 2782: target "." means the service is not available
                    if target.is_empty() {
                        continue;
                    }
                    info!(domain, host = %target, port = r.port(), mode = ?mode, "SRV record");
                    endpoints.push(Endpoint {
                        host: target,
                        port: r.port(),
                        mode,
                    });
                }
            }
            Err(e) => {
                info!(
                    domain,
                    srv = %srv_name,
                    lookup_ms = elapsed_ms(lookup_started),
                    error = %e,
                    "SRV lookup failed"
                );
            }
        }
    }

    if endpoints.is_empty() {
        warn!(
            domain,
            resolve_total_ms = elapsed_ms(resolve_started),
            "No SRV records found, using fallback {}:{}",
            domain,
            DEFAULT_PORT
        );
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: DEFAULT_PORT,
            mode: ConnectionMode::Tcp,
        });
    }

    endpoints
}
