use std::sync::Arc;

use clap::Parser;
use truffler::{server, Sniffer, SnifferConfig};

/// Media-URL sniffer: drives headless Chrome and serves the sniff API
#[derive(Debug, Parser)]
#[command(name = "truffler", version, about)]
struct Cli {
    /// Server port (scans from 57573 when omitted)
    #[arg(long)]
    port: Option<u16>,

    /// Chatty per-request logging
    #[arg(long)]
    debug: bool,

    /// Run the browser with a visible window
    #[arg(long)]
    headed: bool,

    /// Explicit browser binary instead of discovery
    #[arg(long)]
    browser: Option<String>,
}

#[tokio::main]
async fn main() -> truffler::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "truffler=debug"
    } else {
        "truffler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config = SnifferConfig {
        debug: cli.debug,
        headless: !cli.headed,
        browser_path: cli.browser,
        ..SnifferConfig::default()
    };

    let sniffer = Arc::new(Sniffer::new(config));
    server::run(sniffer, cli.port).await
}
