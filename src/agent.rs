//! Sender agent: tails a directory into the collector, or sends one message.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::cli::{AgentConfig, OneShot, WatchConfig};
use crate::delivery::{DeliveryClient, DeliveryError, TcpTransport, Transport};
use crate::manager::{self, LineHandler, TailManager, TailSettings};
use crate::message::{LogLevel, LogMessage};

/// Stamps each tailed line and hands it to the shared delivery client.
pub struct Forwarder<T> {
    client: DeliveryClient<T>,
    server: String,
    level: LogLevel,
    max_attempts: u32,
}

impl<T: Transport> Forwarder<T> {
    pub fn new(client: DeliveryClient<T>, server: String, level: LogLevel, max_attempts: u32) -> Self {
        Self {
            client,
            server,
            level,
            max_attempts,
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> LineHandler for Forwarder<T> {
    async fn handle(&self, path: &Path, line: String) -> Result<(), DeliveryError> {
        debug!(path = %path.display(), "forwarding line");
        let msg = LogMessage::new(self.server.clone(), self.level, Utc::now(), line);
        self.client.deliver(&msg, self.max_attempts).await
    }
}

pub async fn run(config: AgentConfig) -> Result<()> {
    let transport = TcpTransport::connect(&config.collector)
        .await
        .with_context(|| format!("failed to connect to collector at {}", config.collector))?;
    let client = DeliveryClient::new(transport, config.retry_interval);

    if let Some(one_shot) = &config.one_shot {
        return send_once(&client, &config, one_shot).await;
    }
    match &config.watch {
        Some(watch) => watch_and_forward(client, &config, watch).await,
        None => {
            info!("Nothing to do; exiting");
            Ok(())
        }
    }
}

async fn send_once<T: Transport>(
    client: &DeliveryClient<T>,
    config: &AgentConfig,
    one_shot: &OneShot,
) -> Result<()> {
    let msgs: Vec<LogMessage> = if one_shot.messages.is_empty() {
        vec![LogMessage::new(config.server.clone(), config.level, one_shot.time, "")]
    } else {
        one_shot
            .messages
            .iter()
            .map(|text| LogMessage::new(config.server.clone(), config.level, one_shot.time, text.clone()))
            .collect()
    };
    match msgs.as_slice() {
        [msg] => client.deliver(msg, config.max_attempts).await,
        batch => client.deliver_batch(batch, config.max_attempts).await,
    }
    .context("one-shot send failed")?;
    info!(count = msgs.len(), "sent");
    Ok(())
}

async fn watch_and_forward<T: Transport + 'static>(
    client: DeliveryClient<T>,
    config: &AgentConfig,
    watch: &WatchConfig,
) -> Result<()> {
    let dir = tokio::fs::canonicalize(&watch.dir)
        .await
        .with_context(|| format!("failed to open watch directory {}", watch.dir.display()))?;
    let forwarder = Forwarder::new(client, config.server.clone(), config.level, config.max_attempts);
    let settings = TailSettings {
        dir: dir.clone(),
        suffix: watch.suffix.clone(),
        poll_interval: watch.poll_interval,
    };
    let (tail_manager, handle) = TailManager::new(settings, Arc::new(forwarder));

    // Subscribe before scanning. A create reported for a file the scan
    // already found makes the manager reread that file from the start.
    let _watcher = manager::watch_directory(&dir, handle.clone())?;
    let mut task = tokio::spawn(tail_manager.run());

    let result = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            if let Ok(paths) = handle.tracked().await {
                info!(files = paths.len(), "interrupted, stopping tailers");
            }
            // The manager only goes away by returning, which `task` reports.
            let _ = handle.shutdown();
            task.await
        }
    };
    result
        .context("tail manager task failed")?
        .context("tailing stopped")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{self, Collector};
    use crate::delivery::tests::FlakyTransport;
    use std::io::Write;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn agent_config(collector: String) -> AgentConfig {
        AgentConfig {
            collector,
            server: "agent-host".to_string(),
            level: LogLevel::Info,
            max_attempts: 3,
            retry_interval: Duration::from_millis(5),
            one_shot: None,
            watch: None,
        }
    }

    #[tokio::test]
    async fn forwarder_stamps_lines() {
        let (collector, mut queue) = Collector::new(4);
        let transport = FlakyTransport {
            failures: 1,
            calls: Arc::new(AtomicU32::new(0)),
            collector,
        };
        let client = DeliveryClient::new(transport, Duration::from_millis(1));
        let forwarder = Forwarder::new(client, "web-3".to_string(), LogLevel::Warn, 2);

        forwarder
            .handle(Path::new("/logs/a.txt"), "retried once".to_string())
            .await
            .unwrap();

        let msg = queue.recv().await.unwrap();
        assert_eq!(msg.server, "web-3");
        assert_eq!(msg.log_level, LogLevel::Warn);
        assert_eq!(msg.message, "retried once");
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn one_shot_sends_batch_in_order() {
        let listener = collector::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (collector, mut queue) = Collector::new(1);
        let cancel = CancellationToken::new();
        tokio::spawn(collector::serve(listener, collector, cancel.clone()));

        let mut config = agent_config(addr);
        let time = Utc::now();
        config.one_shot = Some(OneShot {
            messages: vec!["one".to_string(), "two".to_string(), "three".to_string()],
            time,
        });
        let sender = tokio::spawn(run(config));

        for expected in ["one", "two", "three"] {
            let msg = queue.recv().await.unwrap();
            assert_eq!(msg.message, expected);
            assert_eq!(msg.time, time);
            assert_eq!(msg.server, "agent-host");
        }
        sender.await.unwrap().unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn unreachable_collector_is_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = run(agent_config(addr)).await.unwrap_err();
        assert!(err.to_string().contains("failed to connect to collector"));
    }

    #[tokio::test]
    async fn lines_flow_from_files_to_the_queue() {
        let listener = collector::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (collector, mut queue) = Collector::new(1);
        let cancel = CancellationToken::new();
        tokio::spawn(collector::serve(listener, collector, cancel.clone()));

        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("existing.txt");
        std::fs::write(&existing, "already there\n").unwrap();

        let mut config = agent_config(addr);
        config.watch = Some(WatchConfig {
            dir: dir.path().to_path_buf(),
            suffix: ".txt".to_string(),
            poll_interval: Duration::from_millis(10),
        });
        let agent = tokio::spawn(run(config));

        // Give the agent time to scan before appending.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut file = std::fs::OpenOptions::new().append(true).open(&existing).unwrap();
        file.write_all(b"appended later\n").unwrap();

        let msg = timeout(Duration::from_secs(5), queue.recv()).await.unwrap().unwrap();
        assert_eq!(msg.message, "appended later");
        assert_eq!(msg.server, "agent-host");

        std::fs::write(dir.path().join("fresh.txt"), "brand new\n").unwrap();
        let msg = timeout(Duration::from_secs(5), queue.recv()).await.unwrap().unwrap();
        assert_eq!(msg.message, "brand new");

        agent.abort();
        cancel.cancel();
    }

    #[tokio::test]
    async fn exhausted_delivery_stops_watch_mode() {
        // Accepts connections and hangs up on every one of them.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let mut config = agent_config(addr);
        config.max_attempts = 2;
        config.watch = Some(WatchConfig {
            dir: dir.path().to_path_buf(),
            suffix: ".txt".to_string(),
            poll_interval: Duration::from_millis(10),
        });
        let agent = tokio::spawn(run(config));

        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(dir.path().join("doomed.txt"), "nobody is listening\n").unwrap();

        let err = timeout(Duration::from_secs(5), agent)
            .await
            .expect("agent kept running after delivery failed")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.to_string(), "tailing stopped");
        let chain = format!("{err:#}");
        assert!(chain.contains("failed to send after 2 attempts"), "{chain}");
    }
}
