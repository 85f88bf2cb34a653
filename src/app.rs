use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent;
use crate::cli::{CollectorConfig, Config, ConsumerMode, Mode};
use crate::collector::{self, Collector};
use crate::db::DatabaseSink;
use crate::sink::{consume, ConsoleSink};

/// Application runtime: runs whichever side of the pipeline was asked for.
pub async fn run(config: Config) -> Result<()> {
    match config.mode {
        Mode::Collect(collect) => run_collector(collect).await,
        Mode::Send(send) => agent::run(send).await,
    }
}

async fn run_collector(config: CollectorConfig) -> Result<()> {
    let (collector, queue) = Collector::new(config.queue_capacity);

    // The sink is ready before the first agent can connect.
    let mut consumer = match config.consumer {
        ConsumerMode::Cli => tokio::spawn(consume(queue, ConsoleSink::stdout())),
        ConsumerMode::Database => {
            let sink = DatabaseSink::open(&config.database)
                .await
                .context("failed to open database sink")?;
            tokio::spawn(consume(queue, sink))
        }
    };

    let listener = collector::bind(&config.listen).await?;
    let cancel = CancellationToken::new();
    let server = tokio::spawn(collector::serve(listener, collector, cancel.clone()));

    let consumer_finished = tokio::select! {
        joined = &mut consumer => {
            joined.context("consumer task failed")?;
            warn!("consumer stopped before shutdown");
            true
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for interrupt")?;
            info!("interrupted, shutting down");
            false
        }
    };

    cancel.cancel();
    server.await.context("collector server task failed")?;
    if !consumer_finished {
        // Every producer is gone now, so this returns once the queue is drained.
        consumer.await.context("consumer task failed")?;
    }
    info!("collector stopped");
    Ok(())
}
