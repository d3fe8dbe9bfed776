//! Realtime change feed over the backend's websocket channel.
//!
//! The backend pushes row changes as Phoenix channel frames. Each frame is
//! reduced to a [`ChangeNotice`] and published on a [`ChangeHub`]; the
//! payload itself is not trusted, subscribers re-fetch.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::{ChangeHub, ChangeKind, ChangeNotice, RemoteError};

/// Interval between channel heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Drop the connection if nothing arrives for this long.
const READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Websocket listener that turns backend change frames into notices.
pub struct ChangeFeed {
    url: String,
    tables: Vec<String>,
    hub: ChangeHub,
}

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

impl ChangeFeed {
    pub fn new(url: impl Into<String>, tables: Vec<String>, hub: ChangeHub) -> Self {
        Self {
            url: url.into(),
            tables,
            hub,
        }
    }

    /// Realtime endpoint for a project base URL.
    pub fn url_for(base_url: &str, api_key: &str) -> String {
        let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base_url.to_string()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base.trim_end_matches('/'),
            api_key
        )
    }

    /// Connect and publish notices until shutdown.
    ///
    /// Runs in a reconnection loop with exponential backoff.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), RemoteError> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(60))
            .with_max_elapsed_time(None)
            .build();

        loop {
            if *shutdown_rx.borrow() {
                info!("change feed shutting down");
                return Ok(());
            }

            info!(tables = ?self.tables, "connecting to change feed");

            match self.connect_and_process(&mut shutdown_rx, &mut backoff).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(error = %e, "change feed connection error, reconnecting");

                    // Anything may have changed while disconnected
                    for table in &self.tables {
                        self.hub
                            .publish(ChangeNotice::new(table.clone(), ChangeKind::Unknown, None));
                    }

                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return Ok(());
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    fn join_frame(table: &str, msg_ref: u64) -> String {
        json!({
            "topic": format!("realtime:public:{}", table),
            "event": "phx_join",
            "payload": {
                "config": {
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": table }
                    ]
                }
            },
            "ref": msg_ref.to_string(),
        })
        .to_string()
    }

    fn heartbeat_frame(msg_ref: u64) -> String {
        json!({
            "topic": "phoenix",
            "event": "heartbeat",
            "payload": {},
            "ref": msg_ref.to_string(),
        })
        .to_string()
    }

    async fn connect_and_process(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), RemoteError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RemoteError::WebSocket(format!("connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        let mut msg_ref = 0u64;

        for table in &self.tables {
            msg_ref += 1;
            write
                .send(Message::Text(Self::join_frame(table, msg_ref)))
                .await
                .map_err(|e| RemoteError::WebSocket(format!("join failed: {}", e)))?;
        }

        info!("change feed connected");
        backoff.reset();

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("change feed received shutdown signal");
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }

                _ = heartbeat.tick() => {
                    msg_ref += 1;
                    write
                        .send(Message::Text(Self::heartbeat_frame(msg_ref)))
                        .await
                        .map_err(|e| RemoteError::WebSocket(format!("heartbeat failed: {}", e)))?;
                }

                result = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                    match result {
                        Ok(Some(Ok(Message::Text(text)))) => match parse_frame(&text) {
                            Ok(Some(notice)) => {
                                trace!(collection = %notice.collection, kind = ?notice.kind, "change notice");
                                self.hub.publish(notice);
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "failed to handle change frame"),
                        },
                        Ok(Some(Ok(Message::Close(_)))) => {
                            info!("change feed closed by server");
                            return Err(RemoteError::WebSocket("connection closed".to_string()));
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Err(RemoteError::WebSocket(format!("read error: {}", e)));
                        }
                        Ok(None) => {
                            return Err(RemoteError::WebSocket("stream ended".to_string()));
                        }
                        Err(_) => {
                            warn!("change feed read timeout after {}s", READ_TIMEOUT.as_secs());
                            return Err(RemoteError::WebSocket("read timeout".to_string()));
                        }
                    }
                }
            }
        }
    }
}

/// Reduce one channel frame to a change notice.
///
/// Replies, heartbeats and presence frames yield `Ok(None)`.
pub fn parse_frame(text: &str) -> Result<Option<ChangeNotice>, RemoteError> {
    let frame: Frame = serde_json::from_str(text)?;

    let data = match frame.event.as_str() {
        "postgres_changes" => frame.payload.get("data").cloned().unwrap_or(Value::Null),
        "INSERT" | "UPDATE" | "DELETE" => frame.payload,
        "phx_reply" | "phx_close" | "presence_state" | "presence_diff" | "system" => {
            return Ok(None);
        }
        "phx_error" => {
            return Err(RemoteError::WebSocket(format!(
                "channel error on {}",
                frame.topic
            )));
        }
        other => {
            debug!(event = other, "ignoring unknown change frame");
            return Ok(None);
        }
    };

    let table = data
        .get("table")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| frame.topic.rsplit(':').next().map(str::to_string))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RemoteError::InvalidResponse("change frame without table".into()))?;

    let kind = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(Value::as_str)
        .map(ChangeKind::from_wire)
        .unwrap_or(ChangeKind::Unknown);

    let row_id = ["record", "old_record"]
        .iter()
        .filter_map(|field| data.get(*field))
        .filter_map(|record| record.get("id"))
        .find_map(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    Ok(Some(ChangeNotice::new(table, kind, row_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_url_for() {
        assert_eq!(
            ChangeFeed::url_for("https://proj.example.test/", "anon"),
            "wss://proj.example.test/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert_eq!(
            ChangeFeed::url_for("http://localhost:54321", "k"),
            "ws://localhost:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
    }

    #[test]
    fn test_parse_postgres_change() {
        let frame = r#"{
            "topic": "realtime:public:posts",
            "event": "postgres_changes",
            "payload": {"data": {"table": "posts", "type": "INSERT", "record": {"id": 17}}},
            "ref": null
        }"#;
        let notice = parse_frame(frame).unwrap().unwrap();
        assert_eq!(notice, ChangeNotice::new("posts", ChangeKind::Insert, Some("17".into())));
    }

    #[test]
    fn test_parse_delete_uses_old_record() {
        let frame = r#"{
            "topic": "realtime:public:comments",
            "event": "DELETE",
            "payload": {"type": "DELETE", "old_record": {"id": "c-9"}}
        }"#;
        let notice = parse_frame(frame).unwrap().unwrap();
        assert_eq!(notice.collection, "comments");
        assert_eq!(notice.kind, ChangeKind::Delete);
        assert_eq!(notice.row_id.as_deref(), Some("c-9"));
    }

    #[test]
    fn test_parse_ignores_replies() {
        let frame = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"}}"#;
        assert!(parse_frame(frame).unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_frame("not json").is_err());
        let frame = r#"{"topic":"realtime:public:posts","event":"phx_error","payload":{}}"#;
        assert!(parse_frame(frame).is_err());
    }
}
