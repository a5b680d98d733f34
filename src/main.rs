mod cli;
mod control;
mod engine;
mod error;
mod logging;
mod model;
mod orchestrator;
mod preview;
mod text_summary;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init_logging(args.verbose)?;

    match cli::run(args).await {
        Ok(()) => {
            // Exit explicitly: the stdin reader may still be parked in a
            // blocking read that would hold up runtime shutdown.
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!("{e:#}");
            Err(e)
        }
    }
}
