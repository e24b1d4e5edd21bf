//! Telemetry stream over TCP
//!
//! Each client gets one JSON object per line, starting with the first
//! message published after it connected. Nothing is read from the client;
//! it may disconnect at any time.

use super::{TelemetryAggregator, TelemetryMessage};
use crate::error::{Result, TunerError};
use crate::events::Subscription;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

pub struct TelemetryServer {
    listener: TcpListener,
    aggregator: Arc<TelemetryAggregator>,
}

impl TelemetryServer {
    pub async fn bind(addr: &str, aggregator: Arc<TelemetryAggregator>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TunerError::Configuration(format!("Failed to bind to {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            aggregator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        log::info!("telemetry stream listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("accept error: {}", e);
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let subscription = self.aggregator.subscribe();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                log::debug!("telemetry client {} connected", peer);
                match stream_to(stream, subscription, stop).await {
                    Ok(dropped) if dropped > 0 => {
                        log::warn!("telemetry client {} lost {} message(s)", peer, dropped)
                    }
                    Ok(_) => {}
                    Err(e) => log::debug!("telemetry client {}: {}", peer, e),
                }
                log::debug!("telemetry client {} disconnected", peer);
            });
        }
        log::info!("telemetry stream stopped");
        Ok(())
    }
}

/// Forward messages until the client goes away, the bus closes or shutdown.
/// Returns how many messages this client missed under backpressure.
async fn stream_to(
    mut stream: TcpStream,
    mut subscription: Subscription<TelemetryMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64> {
    loop {
        let message = tokio::select! {
            message = subscription.recv() => message,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    None
                } else {
                    continue;
                }
            }
        };
        let Some(message) = message else {
            break;
        };
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        stream.write_all(&line).await?;
    }
    let _ = stream.shutdown().await;
    Ok(subscription.dropped())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunerConfig;
    use crate::telemetry::testing::FakeSampler;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_client_receives_ndjson_snapshots() {
        let aggregator = Arc::new(TelemetryAggregator::new(
            &TunerConfig::default(),
            Box::new(FakeSampler::new()),
            None,
        ));
        let server = TelemetryServer::bind("127.0.0.1:0", Arc::clone(&aggregator))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(stop_rx));

        let client = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(client).lines();

        // the server subscribes after accept, so keep sampling until a line lands
        let mut received = None;
        for _ in 0..100 {
            aggregator.sample_once().await.unwrap();
            if let Ok(line) = tokio::time::timeout(Duration::from_millis(50), lines.next_line()).await {
                received = line.unwrap();
                break;
            }
        }
        let line = received.expect("no telemetry line received");
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["cpu"]["brand"], "Test CPU");

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let aggregator = Arc::new(TelemetryAggregator::new(
            &TunerConfig::default(),
            Box::new(FakeSampler::new()),
            None,
        ));
        let first = TelemetryServer::bind("127.0.0.1:0", Arc::clone(&aggregator))
            .await
            .unwrap();
        let taken = first.local_addr().unwrap().to_string();
        assert!(matches!(
            TelemetryServer::bind(&taken, aggregator).await,
            Err(TunerError::Configuration(_))
        ));
    }
}
