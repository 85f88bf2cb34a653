//! Collector service: accepts messages from agents and pushes them onto the
//! bounded queue drained by the sink consumer.
//!
//! The queue is the only backpressure mechanism in the system. When it is
//! full, `send` suspends the calling connection task until the consumer frees
//! a slot, so a slow sink stalls the remote caller instead of losing data.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::LogMessage;
use crate::protocol::{encode_line, Request, Response};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9494";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("message queue is closed")]
    QueueClosed,
}

/// Producer side of the queue. Cheap to clone; one clone per connection.
#[derive(Clone)]
pub struct Collector {
    tx: mpsc::Sender<LogMessage>,
}

/// Consumer side of the queue. Not clonable: exactly one consumer drains it.
pub struct MessageQueue {
    rx: mpsc::Receiver<LogMessage>,
}

impl MessageQueue {
    pub async fn recv(&mut self) -> Option<LogMessage> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<LogMessage> {
        self.rx.try_recv().ok()
    }
}

impl Collector {
    pub fn new(capacity: usize) -> (Self, MessageQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, MessageQueue { rx })
    }

    /// Enqueues one message, waiting for a free slot if the queue is full.
    pub async fn send(&self, msg: LogMessage) -> Result<(), CollectorError> {
        debug!(server = %msg.server, "send called");
        self.tx
            .send(msg)
            .await
            .map_err(|_| CollectorError::QueueClosed)?;
        debug!("message written to queue");
        Ok(())
    }

    /// Enqueues every message in order, one slot at a time.
    pub async fn send_batch(&self, msgs: Vec<LogMessage>) -> Result<(), CollectorError> {
        let count = msgs.len();
        for msg in msgs {
            self.tx
                .send(msg)
                .await
                .map_err(|_| CollectorError::QueueClosed)?;
        }
        debug!(count, "messages written to queue");
        Ok(())
    }

    pub async fn handle(&self, request: Request) -> Response {
        let method = request.method();
        let result = match request {
            Request::Send(msg) => self.send(msg).await,
            Request::SendMultiple(msgs) => self.send_batch(msgs).await,
        };
        match result {
            Ok(()) => Response::ok(),
            Err(e) => {
                warn!(method, error = %e, "rejecting request");
                Response::error(e.to_string())
            }
        }
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener, CollectorError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| CollectorError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(addr, "bound");
    Ok(listener)
}

/// Accepts connections until `cancel` fires, serving each on its own task.
pub async fn serve(listener: TcpListener, collector: Collector, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "collector listening");
    }
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                let collector = collector.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, collector, cancel).await {
                        warn!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "failed to accept connection"),
        }
    }
    debug!("collector stopped accepting");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    collector: Collector,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    debug!(%peer, "agent connected");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = cancel.cancelled() => break,
        };
        if read == 0 {
            debug!(%peer, "agent disconnected");
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => collector.handle(request).await,
            Err(e) => {
                warn!(%peer, error = %e, "malformed request");
                Response::error(format!("malformed request: {e}"))
            }
        };
        let encoded = encode_line(&response).map_err(std::io::Error::other)?;
        write_half.write_all(&encoded).await?;
        write_half.flush().await?;
    }
    Ok(())
}
