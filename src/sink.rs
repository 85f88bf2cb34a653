//! Sinks and the loop that drains the collector queue into one.

use std::io::{self, Write};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::collector::MessageQueue;
use crate::message::LogMessage;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Final destination of a message.
#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &'static str;

    async fn write(&mut self, msg: &LogMessage) -> Result<(), SinkError>;
}

/// Prints one rendered line per message.
pub struct ConsoleSink<W> {
    out: W,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

#[async_trait]
impl<W: Write + Send> Sink for ConsoleSink<W> {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn write(&mut self, msg: &LogMessage) -> Result<(), SinkError> {
        // A closed stdout is not worth stopping the consumer for.
        if let Err(e) = writeln!(self.out, "{msg}").and_then(|_| self.out.flush()) {
            debug!(error = %e, "console write failed");
        }
        Ok(())
    }
}

/// Drains `queue` into `sink` until every producer is gone. A failed write
/// drops that message and moves on to the next one.
pub async fn consume<S: Sink>(mut queue: MessageQueue, mut sink: S) {
    info!(sink = sink.name(), "draining queue");
    while let Some(msg) = queue.recv().await {
        debug!(server = %msg.server, "consumed queue message");
        if let Err(e) = sink.write(&msg).await {
            warn!(sink = sink.name(), error = %e, message = %msg, "Failed to insert message");
        }
    }
    info!(sink = sink.name(), "queue closed, consumer stopped");
}
