//! Agent-side delivery: one connection to the collector, shared by every
//! tailer, with a fixed-interval retry around each send.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::message::LogMessage;
use crate::protocol::{encode_line, Request, Response};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error talking to collector: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("collector closed the connection")]
    ConnectionClosed,

    #[error("collector rejected the request: {0}")]
    Rejected(String),

    #[error("failed to send after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<DeliveryError>,
    },
}

/// A request/response channel to the collector.
///
/// Implementors are not required to be safe for concurrent use; the
/// [`DeliveryClient`] serializes every call.
#[async_trait]
pub trait Transport: Send {
    async fn call(&mut self, request: &Request) -> Result<(), DeliveryError>;
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, DeliveryError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| DeliveryError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    async fn roundtrip(&mut self, payload: &[u8]) -> Result<Response, DeliveryError> {
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(DeliveryError::ConnectionClosed);
        }
        Ok(serde_json::from_str(&line)?)
    }
}

/// TCP transport to a collector. A broken connection is dropped and redialed
/// on the next call.
pub struct TcpTransport {
    addr: String,
    conn: Option<Connection>,
}

impl TcpTransport {
    /// Dials `addr` immediately; failure here is a startup error.
    pub async fn connect(addr: &str) -> Result<Self, DeliveryError> {
        let conn = Connection::open(addr).await?;
        info!(addr, "connected to collector");
        Ok(Self {
            addr: addr.to_string(),
            conn: Some(conn),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&mut self, request: &Request) -> Result<(), DeliveryError> {
        let payload = encode_line(request)?;
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                debug!(addr = %self.addr, "reconnecting to collector");
                Connection::open(&self.addr).await?
            }
        };
        // A failed roundtrip drops the connection so the next call redials.
        let response = conn.roundtrip(&payload).await?;
        self.conn = Some(conn);
        if response.ok {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(
                response.error.unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }
}

/// Shared handle over one transport. Clones share the same connection and
/// the same lock around each network call.
pub struct DeliveryClient<T> {
    transport: Arc<Mutex<T>>,
    retry_interval: Duration,
}

impl<T> Clone for DeliveryClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            retry_interval: self.retry_interval,
        }
    }
}

impl<T: Transport> DeliveryClient<T> {
    pub fn new(transport: T, retry_interval: Duration) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            retry_interval,
        }
    }

    pub async fn deliver(&self, msg: &LogMessage, max_attempts: u32) -> Result<(), DeliveryError> {
        self.call_with_retry(&Request::Send(msg.clone()), max_attempts)
            .await
    }

    pub async fn deliver_batch(
        &self,
        msgs: &[LogMessage],
        max_attempts: u32,
    ) -> Result<(), DeliveryError> {
        self.call_with_retry(&Request::SendMultiple(msgs.to_vec()), max_attempts)
            .await
    }

    async fn call_with_retry(
        &self,
        request: &Request,
        max_attempts: u32,
    ) -> Result<(), DeliveryError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            // Only the network call is serialized, not the backoff.
            let result = {
                let mut transport = self.transport.lock().await;
                transport.call(request).await
            };
            match result {
                Ok(()) => {
                    debug!(method = request.method(), attempt, "sent");
                    return Ok(());
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(DeliveryError::Exhausted {
                        attempts: max_attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(method = request.method(), attempt, max_attempts, error = %e, "failed to send");
                    sleep(self.retry_interval).await;
                    attempt += 1;
                }
            }
        }
    }
}
