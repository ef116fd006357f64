use anyhow::Context;
use clap::Parser;
use conveyor_agent::cli::{Cli, Command};
use conveyor_agent::pool::WorkerPool;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

fn init_tracing(debug: bool) {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("CONVEYOR_AGENT_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start(args) => {
            init_tracing(args.debug);
            let config = args.into_config().context("invalid configuration")?;
            WorkerPool::new(config)
                .run()
                .await
                .context("agent stopped with an error")?;
        }
    }
    Ok(())
}
