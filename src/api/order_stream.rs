use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::models::OrderEvent;

const INITIAL_RECONNECT_DELAY_SECS: u64 = 2;
const MAX_RECONNECT_DELAY_SECS: u64 = 60;
const PING_INTERVAL: Duration = Duration::from_secs(20);
const ORDER_TOPIC: &str = "order";

/// Push message on the private order topic
#[derive(Debug, Deserialize)]
struct TopicMessage {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    data: Vec<OrderEvent>,
}

/// Extract order events from a raw stream message
///
/// Subscription acks, pongs and other topics yield nothing.
pub fn parse_order_message(text: &str) -> Vec<OrderEvent> {
    match serde_json::from_str::<TopicMessage>(text) {
        Ok(msg) if msg.topic == ORDER_TOPIC => msg.data,
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::debug!("Ignoring unparsable stream message: {}", e);
            Vec::new()
        }
    }
}

/// WebSocket client for order updates
///
/// Events are forwarded to the receiver returned by [`OrderStream::new`].
/// Dropped connections are re-established with exponential backoff until the
/// shutdown token fires.
pub struct OrderStream {
    url: String,
    tx: mpsc::Sender<OrderEvent>,
}

impl OrderStream {
    pub fn new(url: impl Into<String>, buffer: usize) -> (Self, mpsc::Receiver<OrderEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                url: url.into(),
                tx,
            },
            rx,
        )
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("📡 Order stream: {}", self.url);
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY_SECS;

        loop {
            match self.connect_and_stream(&shutdown).await {
                Ok(()) if shutdown.is_cancelled() => break,
                Ok(()) => {
                    tracing::warn!("Order stream closed, reconnecting...");
                    reconnect_delay = INITIAL_RECONNECT_DELAY_SECS;
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Order stream error: {:#} - reconnecting in {}s",
                        e,
                        reconnect_delay
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(reconnect_delay)) => {}
                    }
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY_SECS);
                }
            }

            if self.tx.is_closed() {
                tracing::info!("Order event consumer gone, stopping stream");
                break;
            }
        }

        tracing::info!("Order stream stopped");
    }

    async fn connect_and_stream(&self, shutdown: &CancellationToken) -> Result<()> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .context("Failed to connect to order stream")?;
        tracing::info!("✅ Connected to order stream");

        let (mut write, mut read) = ws_stream.split();

        let subscribe = json!({ "op": "subscribe", "args": [ORDER_TOPIC] });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("Failed to send order subscription")?;

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    write
                        .send(Message::Text(json!({ "op": "ping" }).to_string()))
                        .await
                        .context("Failed to send ping")?;
                }
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            for event in parse_order_message(&text) {
                                if self.tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .context("Failed to send pong")?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("Order stream closed by server");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e).context("Order stream read failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const FILL: &str = r#"{
        "topic": "order",
        "data": [{
            "orderId": "1",
            "orderLinkId": "prta-abc",
            "symbol": "BTCUSDT",
            "side": "Sell",
            "qty": "0.01",
            "price": "65000",
            "avgPrice": "65010",
            "orderStatus": "Filled",
            "stopOrderType": "",
            "tpslMode": ""
        }]
    }"#;

    #[test]
    fn test_parse_order_topic() {
        let events = parse_order_message(FILL);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].order_link_id, "prta-abc");
        assert!(events[0].is_filled());
    }

    #[test]
    fn test_parse_ignores_other_messages() {
        assert!(parse_order_message(r#"{"op":"pong","success":true}"#).is_empty());
        assert!(parse_order_message(r#"{"topic":"position","data":[]}"#).is_empty());
        assert!(parse_order_message("not json").is_empty());
    }

    #[tokio::test]
    async fn test_stream_forwards_events_and_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            // Subscription request first
            let sub = ws.next().await.unwrap().unwrap();
            assert!(sub.into_text().unwrap().contains("subscribe"));

            ws.send(Message::Text(FILL.to_string())).await.unwrap();
            // Hold the connection until the client closes it
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let (stream, mut rx) = OrderStream::new(format!("ws://{}", addr), 8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(stream.run(shutdown.clone()));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.order_id, "1");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        server.await.unwrap();
    }
}
