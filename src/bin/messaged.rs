use anyhow::Context;
use clap::Parser;

use sj::daemon::message::MessageHandler;
use sj::daemon::{run_daemon, DaemonArgs};

/// Keeps one chat transcript per contact and sends what is written to a
/// contact's `in` pipe.
#[derive(Parser, Debug)]
#[command(name = "messaged", version = sj::VERSION)]
struct Args {
    #[command(flatten)]
    daemon: DaemonArgs,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    sj::logging::init("messaged", args.daemon.verbose.as_deref(), args.daemon.log_file.as_deref());

    let jid = args
        .daemon
        .jid
        .clone()
        .context("messaged needs the account address (-j)")?;
    run_daemon(MessageHandler::new(jid), &args.daemon)?;
    Ok(())
}
