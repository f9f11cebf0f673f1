//! The uniqued daemon.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uniqued::bus::{default_socket_path, Server, BUS_NAME};

/// Session-wide deduplication daemon for in-memory byte blobs.
#[derive(Parser)]
#[command(name = "uniqued", version, about)]
struct Options {
    /// Replace a running daemon.
    #[arg(short, long)]
    replace: bool,

    /// Enable debug output.
    #[arg(short, long)]
    verbose: bool,
}

fn run(options: &Options) -> uniqued::Result<()> {
    let path = default_socket_path();
    let mut server = Server::bind(&path, options.replace)?;
    info!(name = BUS_NAME, socket = %path.display(), "listening");
    server.run()
}

fn main() {
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let default_level = if options.verbose {
        "uniqued=debug"
    } else {
        "uniqued=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&options) {
        eprintln!("uniqued: {e}");
        std::process::exit(1);
    }
}
