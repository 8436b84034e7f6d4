use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use vm_orchestrator::{JobQueue, LogNotifier};
use vm_provisiond::cli::{Args, Command};
use vm_provisiond::{execute, open_database, serve, Config, Services};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = vm_logging::init_subscriber();

    let config = Config::from_env();

    if let Command::Serve = args.command {
        return serve(config).await;
    }

    let pool = open_database(&config).await?;
    // One-shot commands never run jobs; approved requests wait for the daemon's sweeper.
    let services = Services::new(
        pool,
        JobQueue::detached(),
        Arc::new(config.executor()),
        Arc::new(LogNotifier),
        config.pipeline_settings(),
    );

    let output = execute(&services, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
