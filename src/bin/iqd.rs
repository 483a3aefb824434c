use clap::Parser;

use sj::daemon::iq::IqHandler;
use sj::daemon::{run_daemon, DaemonArgs};

/// Hands iq requests to namespace extensions and delivers results.
#[derive(Parser, Debug)]
#[command(name = "iqd", version = sj::VERSION)]
struct Args {
    #[command(flatten)]
    daemon: DaemonArgs,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    sj::logging::init("iqd", args.daemon.verbose.as_deref(), args.daemon.log_file.as_deref());
    run_daemon(IqHandler::new(&args.daemon.dir), &args.daemon)?;
    Ok(())
}
