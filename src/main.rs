//! logrelay entry point: parses CLI, installs logging and starts the async runtime.
//! The main function stays thin and delegates to the runtime in `app`.

mod agent;
mod app;
mod cli;
mod collector;
mod db;
mod delivery;
mod logging;
mod manager;
mod message;
mod protocol;
mod sink;
mod tail;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config = cli::parse();
    logging::init(config.verbose)?;
    app::run(config).await
}
