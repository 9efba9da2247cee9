use anyhow::Result;
use clap::Parser;
use sinkd::cli::Cli;
use sinkd::daemon;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let cfg = cli.to_config();

    let serve = async {
        match cli.listen {
            Some(addr) => daemon::run_server(cfg, addr).await,
            None => {
                let addr = cli.peer_addr()?;
                daemon::run_client(cfg, addr).await
            }
        }
    };

    tokio::select! {
        result = serve => {
            result?;
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}
