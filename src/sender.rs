use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::SenderConfig;
use crate::errors::TrapperError;
use crate::item::TrapperItem;
use crate::protocol::{self, Acknowledgement};
use crate::transport::TransportClient;

/// Destination for items produced by scheduled tasks.
#[async_trait]
pub trait ItemSender: Send + Sync {
    async fn send_items(&self, items: &[TrapperItem]) -> Result<String, TrapperError>;
}

/// Pushes trapper items to the server, one connection per call.
#[derive(Debug)]
pub struct Sender {
    config: Arc<SenderConfig>,
    transport: TransportClient,
}

impl Sender {
    pub fn new(config: Arc<SenderConfig>) -> Result<Self, TrapperError> {
        let transport = TransportClient::new(&config)?;
        Ok(Self { config, transport })
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Send a single key/value pair and return the server acknowledgement.
    pub async fn send(&self, key: &str, value: &str) -> Result<String, TrapperError> {
        let response = self.transmit(&[TrapperItem::new(key, value)]).await?;
        if self.config.debug {
            info!("Sent: {key} = {value}");
            info!("Received: {response}");
        }
        Ok(response)
    }

    pub async fn send_item(&self, item: &TrapperItem) -> Result<String, TrapperError> {
        self.send(item.key(), item.value()).await
    }

    /// Send all `items` in one frame and return the server acknowledgement.
    pub async fn send_items(&self, items: &[TrapperItem]) -> Result<String, TrapperError> {
        if self.config.debug {
            for item in items {
                info!("Sending: {} = {}", item.key(), item.value());
            }
        }

        let response = self.transmit(items).await?;
        if self.config.debug {
            info!("Sent multiple items: {}", serde_json::to_string(items)?);
            info!("Received: {response}");
        }
        Ok(response)
    }

    async fn transmit(&self, items: &[TrapperItem]) -> Result<String, TrapperError> {
        if self.config.host_name.trim().is_empty() {
            return Err(TrapperError::MissingHostName);
        }
        let packet = protocol::encode(&self.config.host_name, items)?;

        let raw = self.transport.exchange(&packet).await.map_err(|e| {
            error!(error = %e, "Error sending data to trapper server");
            TrapperError::Send(e)
        })?;

        let Some(response) = protocol::decode(&raw) else {
            error!(bytes_read = raw.len(), "Invalid response from trapper server");
            return Err(TrapperError::Protocol);
        };

        report_acknowledgement(&response, items.len());
        Ok(response)
    }
}

fn report_acknowledgement(response: &str, sent: usize) {
    let Some(ack) = Acknowledgement::parse(response) else {
        return;
    };
    if !ack.is_success() {
        warn!(response = %ack.response, info = ?ack.info, "trapper server did not accept the data");
        return;
    }
    if let Some(summary) = ack.summary().filter(|s| s.failed > 0) {
        warn!(
            sent,
            processed = summary.processed,
            failed = summary.failed,
            "trapper server rejected some items"
        );
    }
}

#[async_trait]
impl ItemSender for Sender {
    async fn send_items(&self, items: &[TrapperItem]) -> Result<String, TrapperError> {
        Sender::send_items(self, items).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one connection, capture the request frame, reply with `reply`.
    async fn one_shot_server(reply: Vec<u8>) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; protocol::HEADER_LEN];
            socket.read_exact(&mut header).await.unwrap();
            let len = protocol::declared_len(&header).unwrap();
            let mut payload = vec![0u8; len];
            socket.read_exact(&mut payload).await.unwrap();
            socket.write_all(&reply).await.unwrap();
            socket.shutdown().await.unwrap();
            payload
        });
        (port, handle)
    }

    fn sender_for(port: u16) -> Sender {
        let mut config = SenderConfig::new("127.0.0.1", port, "test-host");
        config.debug = true;
        Sender::new(Arc::new(config)).expect("Should build sender")
    }

    #[tokio::test]
    async fn test_send_returns_acknowledgement() {
        let ack = r#"{"response":"success","info":"processed: 1; failed: 0; total: 1; seconds spent: 0.000055"}"#;
        let (port, server) = one_shot_server(protocol::frame(ack.as_bytes()).unwrap()).await;

        let response = sender_for(port).send("cpu.usage", "12.5").await.expect("Should send");
        assert_eq!(response, ack);

        let payload = server.await.unwrap();
        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#"{"request":"sender data","data":[{"host":"test-host","key":"cpu.usage","value":"12.5"}]}"#
        );
    }

    #[tokio::test]
    async fn test_send_items_in_one_frame() {
        let ack = r#"{"response":"success","info":"processed: 1; failed: 1; total: 2; seconds spent: 0.0001"}"#;
        let (port, server) = one_shot_server(protocol::frame(ack.as_bytes()).unwrap()).await;

        let items = vec![
            TrapperItem::new("ram.usage", "100"),
            TrapperItem::new("thread.count", "9"),
        ];
        let response = sender_for(port).send_items(&items).await.expect("Should send");
        assert_eq!(response, ack);

        let json: serde_json::Value = serde_json::from_slice(&server.await.unwrap()).unwrap();
        assert_eq!(json["data"].as_array().unwrap().len(), 2);
        assert_eq!(json["data"][1]["key"], "thread.count");
    }

    #[tokio::test]
    async fn test_bad_magic_is_protocol_failure() {
        let (port, _server) = one_shot_server(b"ZBXD\x02\x02\x00\x00\x00\x00\x00\x00\x00{}".to_vec()).await;
        let err = sender_for(port).send("k", "v").await.unwrap_err();
        assert!(matches!(err, TrapperError::Protocol));
    }

    #[tokio::test]
    async fn test_short_response_is_protocol_failure() {
        let (port, _server) = one_shot_server(b"ZBXD\x01".to_vec()).await;
        let err = sender_for(port).send("k", "v").await.unwrap_err();
        assert!(matches!(err, TrapperError::Protocol));
    }

    #[tokio::test]
    async fn test_connection_refused_is_send_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = sender_for(port).send("k", "v").await.unwrap_err();
        assert!(matches!(err, TrapperError::Send(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_missing_host_name_is_rejected_before_connecting() {
        let config = SenderConfig::new("127.0.0.1", 1, "");
        let sender = Sender::new(Arc::new(config)).unwrap();
        assert!(matches!(
            sender.send("k", "v").await,
            Err(TrapperError::MissingHostName)
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let sender = sender_for(1);
        assert!(matches!(sender.send_items(&[]).await, Err(TrapperError::EmptyBatch)));
    }
}
