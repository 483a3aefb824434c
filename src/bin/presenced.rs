use clap::Parser;

use sj::daemon::presence::PresenceHandler;
use sj::daemon::{run_daemon, DaemonArgs};

/// Keeps the current status of every contact in its `status` file.
#[derive(Parser, Debug)]
#[command(name = "presenced", version = sj::VERSION)]
struct Args {
    #[command(flatten)]
    daemon: DaemonArgs,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    sj::logging::init("presenced", args.daemon.verbose.as_deref(), args.daemon.log_file.as_deref());
    run_daemon(PresenceHandler, &args.daemon)?;
    Ok(())
}
