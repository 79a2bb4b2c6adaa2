// CLI host for the Deshi Knowledge Collector
// Run with: cargo run --bin collector

use std::io::IsTerminal;
use std::process;

use dotenv::dotenv;
use tracing::{error, info};

use deshi_collector::config::RuntimeConfig;
use deshi_collector::run_collector;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    // On a terminal, prompt for anything missing from the environment; when
    // run non-interactively (service, pipe), missing configuration is fatal
    // before any client is constructed.
    let config = if std::io::stdin().is_terminal() {
        RuntimeConfig::resolve_interactive()
    } else {
        RuntimeConfig::from_env()
    };

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Configuration is incomplete. Exiting.");
            process::exit(1);
        }
    };

    info!("Initializing Deshi Knowledge Collector...");

    if let Err(err) = run_collector(config).await {
        error!(error = %err, "Listener terminated");
        process::exit(1);
    }
}
