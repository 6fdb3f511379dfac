//! refsync command line entry point

mod refsync_cmd;

use clap::Parser;
use refsync_cmd::RefSyncCli;

fn main() {
    let cli = RefSyncCli::parse();

    // Logs go to stderr so `--json` output stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("refsync v{} starting", refsync_core::VERSION);
    std::process::exit(run(cli));
}

#[tokio::main]
async fn run(cli: RefSyncCli) -> i32 {
    cli.run().await
}
