//! Tracing setup shared by the session binary and the helper daemons.
//!
//! Diagnostics go to stderr (helpers inherit the session's). `RUST_LOG`
//! overrides everything; otherwise `--verbose` raises the crate to debug and
//! `--verbose=xmpp` additionally logs raw protocol traffic. `--log-file=DIR`
//! adds a daily-rotating file in `DIR`.

use std::path::Path;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::session::TRAFFIC_TARGET;

/// Filter directives for `bin` at the requested verbosity.
///
/// `verbose` is `None` without the flag, `Some("")` for a bare `--verbose`
/// and `Some(level)` for `--verbose=level`.
pub fn directives(bin: &str, verbose: Option<&str>) -> String {
    match verbose {
        None => format!("sj=info,{bin}=info,{TRAFFIC_TARGET}=info,warn"),
        Some("xmpp") => format!("sj=debug,{bin}=debug,{TRAFFIC_TARGET}=debug,info"),
        Some(_) => format!("sj=debug,{bin}=debug,{TRAFFIC_TARGET}=info,info"),
    }
}

fn filter(bin: &str, verbose: Option<&str>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(directives(bin, verbose))
    }
}

/// Install the global subscriber. Call once, first thing in `main`.
pub fn init(bin: &str, verbose: Option<&str>, log_dir: Option<&Path>) {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter(bin, verbose));

    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: could not create log directory '{}': {}", dir.display(), e);
            return None;
        }
        let appender = tracing_appender::rolling::daily(dir, format!("{bin}.log"));
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        // The background writer must outlive every log call until exit.
        std::mem::forget(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter(bin, verbose)),
        )
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traffic_hidden_unless_requested() {
        assert!(directives("sj", None).contains("sj::xmpp=info"));
        assert!(directives("iqd", Some("")).contains("sj::xmpp=info"));
        assert!(directives("iqd", Some("")).contains("iqd=debug"));
        assert!(directives("sj", Some("xmpp")).contains("sj::xmpp=debug"));
    }

    #[test]
    fn test_directives_parse() {
        for verbose in [None, Some(""), Some("xmpp")] {
            assert!(EnvFilter::try_new(directives("messaged", verbose)).is_ok());
        }
    }
}
