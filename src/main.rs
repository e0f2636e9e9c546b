use clap::Parser;
use ssds::cli::execute_args;
use ssds::error::Result;
use ssds::Command;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    execute_args(Command::parse()).await
}
