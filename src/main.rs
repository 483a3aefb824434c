use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{info, warn};

use sj::session::helpers::ProcessLauncher;
use sj::session::{self, Credentials, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "sj", version = sj::VERSION, about = "Minimal XMPP client speaking through a mailbox directory")]
struct Args {
    /// Account address, user@domain[/resource]
    #[arg(short = 'j', long)]
    jid: String,

    /// Server: domain (SRV lookup), host:port, tls://host[:port] or
    /// tcp://host[:port]. Defaults to the domain of the address.
    #[arg(short = 's', long, default_value = "")]
    server: String,

    /// Account password
    #[arg(long, env = "SJ_PASSWORD", hide_env_values = true)]
    password: String,

    /// Resource to bind when the address has none
    #[arg(short = 'r', long, default_value = "sj")]
    resource: String,

    /// Mailbox directory [default: <data dir>/sj/<user@domain>]
    #[arg(short = 'd', long)]
    dir: Option<PathBuf>,

    /// Seconds of silence before a keepalive ping
    #[arg(short = 'k', long, default_value_t = 60)]
    keepalive: u64,

    /// Where to find messaged, presenced and iqd
    #[arg(long, value_name = "DIR")]
    helper_dir: Option<PathBuf>,

    /// Disable TLS certificate verification (INSECURE!)
    #[arg(long)]
    dangerous_insecure_tls: bool,

    /// Verbose logging; `--verbose=xmpp` also logs protocol traffic
    #[arg(short, long, num_args = 0..=1, default_missing_value = "", require_equals = true)]
    verbose: Option<String>,

    /// Also log to a daily-rotating file in this directory
    #[arg(long, value_name = "DIR", require_equals = true)]
    log_file: Option<PathBuf>,
}

fn default_mailbox_dir(bare_jid: &str) -> anyhow::Result<PathBuf> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| anyhow!("no local data directory on this platform, pass --dir"))?;
    Ok(base.join("sj").join(bare_jid))
}

async fn wait_for_shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = term.recv() => info!("Terminated"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    sj::logging::init("sj", args.verbose.as_deref(), args.log_file.as_deref());

    if args.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    let mut credentials = Credentials::from_jid(&args.jid, args.password)?;
    if credentials.resource.is_none() {
        credentials.resource = Some(args.resource);
    }
    let mailbox_dir = match args.dir {
        Some(dir) => dir,
        None => default_mailbox_dir(&credentials.bare_jid())?,
    };

    let config = SessionConfig {
        credentials,
        server: args.server,
        mailbox_dir,
        keepalive: Duration::from_secs(args.keepalive.max(1)),
        insecure_tls: args.dangerous_insecure_tls,
    };
    info!(
        version = sj::VERSION,
        jid = %config.credentials.bare_jid(),
        dir = %config.mailbox_dir.display(),
        "Starting session"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let launcher = ProcessLauncher::new(args.helper_dir).with_verbose(args.verbose);
    session::run_client(&config, Box::new(launcher), shutdown_rx)
        .await
        .context("session ended")?;
    info!("Session closed");
    Ok(())
}
