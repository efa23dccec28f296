//! Hermes WebSocket streaming source

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use pusher_core::{FeedId, HermesConfig, PricePoint, SourceError, SourceResult, UpdateData};

use crate::offchain::{OffChainPriceSource, UpdateCallback};

/// Message pushed by Hermes over the WebSocket
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Response {
        status: String,
        #[serde(default)]
        error: Option<String>,
    },
    PriceUpdate {
        price_feed: RawPriceFeed,
    },
}

#[derive(Debug, Deserialize)]
struct RawPriceFeed {
    id: String,
    price: RawPrice,
    /// Base64 binary update, present when subscribed with `binary: true`
    #[serde(default)]
    vaa: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPrice {
    price: String,
    conf: String,
    expo: i32,
    publish_time: i64,
}

#[derive(Debug, Deserialize)]
struct FeedListing {
    id: String,
}

/// Decoded price update
#[derive(Debug, Clone, PartialEq)]
pub struct HermesUpdate {
    pub id: FeedId,
    pub point: PricePoint,
    pub update_data: UpdateData,
}

/// Streaming client for the Hermes price service
#[derive(Clone)]
pub struct HermesStream {
    config: HermesConfig,
    http: reqwest::Client,
    known_feeds: Arc<RwLock<Option<HashSet<FeedId>>>>,
}

impl HermesStream {
    pub fn new(config: HermesConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            known_feeds: Arc::new(RwLock::new(None)),
        }
    }

    /// Reconnecting read loop, until `shutdown` flips to true.
    ///
    /// Every session end (error or close) triggers a reconnect. Only `max_reconnects`
    /// consecutive sessions that delivered no update end the loop.
    pub async fn run(&self, feed_ids: Vec<FeedId>, callback: UpdateCallback, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0;
        let reconnect_delay = Duration::from_millis(self.config.reconnect_delay_ms);

        while !*shutdown.borrow() {
            let mut received = 0u64;
            let session = tokio::select! {
                result = self.connect_and_listen(&feed_ids, &callback, &mut received) => result,
                _ = shutdown.changed() => break,
            };

            match session {
                Ok(()) => info!(received, "Hermes session ended"),
                Err(e) => error!(received, "Hermes stream error: {}", e),
            }

            if received > 0 {
                failures = 0;
            } else {
                failures += 1;
                if failures >= self.config.max_reconnects {
                    error!("Max reconnects reached for Hermes stream, off-chain prices are frozen");
                    return;
                }
            }

            warn!(
                "Reconnecting to Hermes in {:?} (attempt {}/{})",
                reconnect_delay, failures + 1, self.config.max_reconnects
            );

            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Hermes stream stopped");
    }

    async fn connect_and_listen(
        &self,
        feed_ids: &[FeedId],
        callback: &UpdateCallback,
        received: &mut u64,
    ) -> anyhow::Result<()> {
        info!("Connecting to Hermes at {}", self.config.ws_url);

        let (ws_stream, _) = connect_async(self.config.ws_url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(subscribe_message(feed_ids).to_string()))
            .await?;
        info!(feeds = feed_ids.len(), "Subscribed to Hermes price updates");

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match parse_message(&text) {
                    Ok(Some(update)) => {
                        *received += 1;
                        callback(update.id, update.point, update.update_data);
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Skipping Hermes message: {}", e),
                },
                Ok(Message::Ping(data)) => {
                    write.send(Message::Pong(data)).await?;
                }
                Ok(Message::Close(_)) => {
                    info!("Hermes closed the connection");
                    return Ok(());
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    return Err(e.into());
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn fetch_known_feeds(&self) -> SourceResult<HashSet<FeedId>> {
        let url = format!("{}/v2/price_feeds", self.config.http_url.trim_end_matches('/'));

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SourceError::Rpc(format!("GET {url} returned {}", response.status())));
        }

        let listing: Vec<FeedListing> = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        Ok(listing.iter().filter_map(|f| f.id.parse().ok()).collect())
    }
}

#[async_trait]
impl OffChainPriceSource for HermesStream {
    async fn is_feed_id_valid(&self, id: &FeedId) -> SourceResult<bool> {
        let cached = self.known_feeds.read().as_ref().map(|known| known.contains(id));
        if let Some(valid) = cached {
            return Ok(valid);
        }

        let known = self.fetch_known_feeds().await?;
        let valid = known.contains(id);
        *self.known_feeds.write() = Some(known);
        Ok(valid)
    }

    async fn subscribe(
        &self,
        feed_ids: Vec<FeedId>,
        callback: UpdateCallback,
        shutdown: watch::Receiver<bool>,
    ) -> SourceResult<()> {
        if feed_ids.is_empty() {
            return Ok(());
        }

        let stream = self.clone();
        tokio::spawn(async move {
            stream.run(feed_ids, callback, shutdown).await;
        });

        Ok(())
    }
}

fn subscribe_message(feed_ids: &[FeedId]) -> serde_json::Value {
    serde_json::json!({
        "type": "subscribe",
        "ids": feed_ids.iter().map(|id| id.to_hex()).collect::<Vec<_>>(),
        "verbose": false,
        "binary": true,
        "allow_out_of_order": false,
    })
}

/// Parse a Hermes message. `Ok(None)` for messages that carry no price.
fn parse_message(text: &str) -> SourceResult<Option<HermesUpdate>> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| SourceError::Decode(e.to_string()))?;

    let feed = match message {
        ServerMessage::Response { status, error } => {
            if status != "success" {
                warn!("Hermes subscription error: {}", error.unwrap_or_default());
            }
            return Ok(None);
        }
        ServerMessage::PriceUpdate { price_feed } => price_feed,
    };

    let id: FeedId = feed
        .id
        .parse()
        .map_err(|e: pusher_core::CoreError| SourceError::Decode(e.to_string()))?;

    let vaa = feed
        .vaa
        .ok_or_else(|| SourceError::Decode(format!("update for {id} has no binary payload")))?;
    let update_data = base64::engine::general_purpose::STANDARD
        .decode(vaa)
        .map_err(|e| SourceError::Decode(e.to_string()))?;

    let decode_int = |field: &str, value: &str| {
        SourceError::Decode(format!("{field} {value:?} is not an integer"))
    };
    let price: i64 = feed.price.price.parse().map_err(|_| decode_int("price", &feed.price.price))?;
    let confidence: u64 = feed.price.conf.parse().map_err(|_| decode_int("conf", &feed.price.conf))?;
    let publish_time = u64::try_from(feed.price.publish_time)
        .map_err(|_| SourceError::Decode("negative publish_time".into()))?;

    Ok(Some(HermesUpdate {
        id,
        point: PricePoint::new(price, confidence, feed.price.expo, publish_time),
        update_data: UpdateData::from(update_data),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTC: &str = "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43";

    #[test]
    fn test_parse_price_update() {
        let text = format!(
            r#"{{
                "type": "price_update",
                "price_feed": {{
                    "id": "{BTC}",
                    "price": {{ "price": "6163260000000", "conf": "3298327895", "expo": -8, "publish_time": 1700000000 }},
                    "ema_price": {{ "price": "6160000000000", "conf": "3000000000", "expo": -8, "publish_time": 1700000000 }},
                    "vaa": "AQID"
                }}
            }}"#
        );

        let update = parse_message(&text).unwrap().unwrap();
        assert_eq!(update.id.to_hex(), BTC);
        assert_eq!(update.point.price, 6_163_260_000_000);
        assert_eq!(update.point.confidence, 3_298_327_895);
        assert_eq!(update.point.exponent, -8);
        assert_eq!(update.point.publish_time, 1_700_000_000);
        assert_eq!(&*update.update_data, &[1u8, 2, 3][..]);
    }

    #[test]
    fn test_subscription_response_carries_no_price() {
        let parsed = parse_message(r#"{"type":"response","status":"success"}"#).unwrap();
        assert!(parsed.is_none());

        let failed = parse_message(r#"{"type":"response","status":"error","error":"unknown ids"}"#).unwrap();
        assert!(failed.is_none());
    }

    #[test]
    fn test_update_without_payload_is_an_error() {
        let text = format!(
            r#"{{"type":"price_update","price_feed":{{"id":"{BTC}","price":{{"price":"1","conf":"1","expo":0,"publish_time":1}}}}}}"#
        );
        assert!(matches!(parse_message(&text), Err(SourceError::Decode(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_message("not json").is_err());
        assert!(parse_message(r#"{"type":"unknown"}"#).is_err());
    }

    fn stream_config(ws_url: String, max_reconnects: u32) -> HermesConfig {
        HermesConfig {
            ws_url,
            http_url: "http://127.0.0.1:1".into(),
            reconnect_delay_ms: 10,
            max_reconnects,
        }
    }

    fn price_update(publish_time: u64) -> String {
        format!(
            r#"{{"type":"price_update","price_feed":{{"id":"{BTC}","price":{{"price":"100","conf":"1","expo":-2,"publish_time":{publish_time}}},"vaa":"AQID"}}}}"#
        )
    }

    #[derive(Clone, Copy)]
    enum Session {
        /// Send one update, then close
        UpdateThenClose,
        /// Close without sending anything
        Close,
        /// Send one update, then keep the connection open
        UpdateThenHold,
    }

    /// Local Hermes stand-in serving `sessions` connections in order
    async fn serve(sessions: Vec<Session>) -> (String, Arc<std::sync::atomic::AtomicUsize>, tokio::task::JoinHandle<()>) {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        let handle = tokio::spawn(async move {
            for (n, session) in sessions.into_iter().enumerate() {
                let (tcp, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                let _subscription = ws.next().await;

                if !matches!(session, Session::Close) {
                    ws.send(Message::Text(price_update(1_000 + n as u64))).await.unwrap();
                }
                if matches!(session, Session::UpdateThenHold) {
                    while let Some(Ok(_)) = ws.next().await {}
                    continue;
                }
                let _ = ws.close(None).await;
                while let Some(Ok(_)) = ws.next().await {}
            }
        });

        (url, accepted, handle)
    }

    fn recording_callback() -> (UpdateCallback, Arc<parking_lot::Mutex<Vec<u64>>>) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: UpdateCallback = Arc::new(move |_id: FeedId, point: PricePoint, _data: UpdateData| {
            sink.lock().push(point.publish_time);
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn test_reconnects_after_every_productive_session() {
        let (url, _, server) = serve(vec![Session::UpdateThenClose; 5]).await;
        let stream = HermesStream::new(stream_config(url, 2));
        let (callback, seen) = recording_callback();
        let (_tx, rx) = watch::channel(false);

        // five server-side closes, more than max_reconnects; the loop only ends once the
        // listener is gone and two connects in a row fail
        tokio::time::timeout(Duration::from_secs(10), stream.run(vec![BTC.parse().unwrap()], callback, rx))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![1_000, 1_001, 1_002, 1_003, 1_004]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_consecutive_empty_sessions() {
        use std::sync::atomic::Ordering;

        let (url, accepted, server) = serve(vec![Session::Close; 10]).await;
        let stream = HermesStream::new(stream_config(url, 3));
        let (callback, seen) = recording_callback();
        let (_tx, rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(10), stream.run(vec![BTC.parse().unwrap()], callback, rx))
            .await
            .unwrap();

        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert!(seen.lock().is_empty());
        server.abort();
    }

    #[tokio::test]
    async fn test_shutdown_stops_open_session() {
        let (url, _, server) = serve(vec![Session::UpdateThenHold]).await;
        let stream = HermesStream::new(stream_config(url, 3));
        let (callback, seen) = recording_callback();
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn(async move { stream.run(vec![BTC.parse().unwrap()], callback, rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        server.abort();
    }

    #[test]
    fn test_subscribe_message_shape() {
        let msg = subscribe_message(&[BTC.parse().unwrap()]);
        assert_eq!(msg["type"], "subscribe");
        assert_eq!(msg["binary"], true);
        assert_eq!(msg["ids"][0], BTC);
    }
}
