use clap::Parser;
use tracing_subscriber::EnvFilter;
use usip::cli::{self, Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.debug { "usip=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = cli.load_config()?;

    match &cli.command {
        Command::Register => cli::run_register(&config).await?,
        Command::Call { number } => cli::run_call(&config, number).await?,
        Command::Status => cli::run_status(&config)?,
    }

    Ok(())
}
