//! 实时推送（Phoenix channel over WebSocket）
//!
//! 连接托管后端的实时服务，加入 `realtime:<topic>` 频道并订阅某张表的 INSERT 事件。
//! 每 25 秒发送一次 phoenix 心跳；连接断开后订阅结束，由轮询兜底。

use crate::im::message::models::MessageRow;
use crate::im::store::{InsertFilter, InsertSubscription};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const PUSH_CHANNEL_CAPACITY: usize = 256;

/// Phoenix 协议帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<Value>,
}

impl PhoenixFrame {
    /// 加入频道，订阅 `table` 的 INSERT 事件
    pub fn join(
        topic: &str,
        table: &str,
        filter: Option<&InsertFilter>,
        access_token: &str,
        reference: u64,
    ) -> Self {
        let mut change = json!({
            "event": "INSERT",
            "schema": "public",
            "table": table,
        });
        if let Some(f) = filter {
            change["filter"] = Value::String(f.to_realtime_expr());
        }
        PhoenixFrame {
            topic: format!("realtime:{}", topic),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [change],
                },
                "access_token": access_token,
            }),
            reference: Some(Value::String(reference.to_string())),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        PhoenixFrame {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(Value::String(reference.to_string())),
        }
    }
}

/// 从推送帧中取出新插入的记录，其他帧返回 `None`
///
/// 兼容两种格式：`postgres_changes`（`payload.data.type == "INSERT"`，记录在 `payload.data.record`）
/// 与旧版的 `INSERT` 事件（记录在 `payload.record`）。
pub fn extract_inserted_record(frame: &PhoenixFrame) -> Option<MessageRow> {
    let record = match frame.event.as_str() {
        "postgres_changes" => {
            let data = frame.payload.get("data")?;
            if data.get("type").and_then(Value::as_str) != Some("INSERT") {
                return None;
            }
            data.get("record")?
        }
        "INSERT" => frame.payload.get("record")?,
        _ => return None,
    };
    match serde_json::from_value::<MessageRow>(record.clone()) {
        Ok(row) => Some(row),
        Err(e) => {
            warn!("[Realtime] ⚠️ 推送记录解析失败: {}, 原始记录: {}", e, record);
            None
        }
    }
}

/// 实时推送连接参数
#[derive(Debug, Clone)]
pub struct RealtimeFeed {
    realtime_url: String,
    api_key: String,
    access_token: String,
}

impl RealtimeFeed {
    pub fn new(
        realtime_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            realtime_url: realtime_url.into(),
            api_key: api_key.into(),
            access_token: access_token.into(),
        }
    }

    fn build_url(&self) -> String {
        format!(
            "{}/websocket?apikey={}&vsn=1.0.0",
            self.realtime_url.trim_end_matches('/'),
            self.api_key
        )
    }

    /// 订阅 `table` 的插入事件
    pub async fn subscribe(
        &self,
        topic: &str,
        table: &str,
        filter: Option<InsertFilter>,
    ) -> Result<InsertSubscription> {
        let url = self.build_url();
        info!("[Realtime] 🔗 连接实时服务, topic={}, table={}", topic, table);

        let (ws_stream, response) = connect_async(&url)
            .await
            .context("连接实时服务失败")?;
        info!("[Realtime] ✅ WebSocket 连接成功, 状态: {}", response.status());

        let (mut write, mut read) = ws_stream.split();
        let join = PhoenixFrame::join(topic, table, filter.as_ref(), &self.access_token, 1);
        write
            .send(WsMessage::Text(serde_json::to_string(&join)?))
            .await
            .context("发送 phx_join 失败")?;

        let (tx, rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let channel_topic = join.topic.clone();
        let guard = tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            // interval 的第一次 tick 立即完成，跳过
            ticker.tick().await;
            let mut next_ref: u64 = 2;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let beat = PhoenixFrame::heartbeat(next_ref);
                        next_ref += 1;
                        let text = match serde_json::to_string(&beat) {
                            Ok(t) => t,
                            Err(_) => continue,
                        };
                        if write.send(WsMessage::Text(text)).await.is_err() {
                            warn!("[Realtime] 💔 心跳发送失败，连接已断开");
                            break;
                        }
                        debug!("[Realtime] 💓 心跳 ref={}", next_ref - 1);
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                let frame = match serde_json::from_str::<PhoenixFrame>(&text) {
                                    Ok(f) => f,
                                    Err(e) => {
                                        debug!("[Realtime] 忽略无法解析的帧: {}, 原始: {}", e, text);
                                        continue;
                                    }
                                };
                                match frame.event.as_str() {
                                    "phx_reply" => {
                                        let status = frame.payload.get("status").and_then(Value::as_str);
                                        if status == Some("ok") {
                                            debug!("[Realtime] 📥 {} 回复 ok", frame.topic);
                                        } else {
                                            warn!("[Realtime] ⚠️ {} 回复异常: {}", frame.topic, frame.payload);
                                        }
                                    }
                                    "phx_error" | "phx_close" if frame.topic == channel_topic => {
                                        warn!("[Realtime] 👋 频道关闭: {}", frame.event);
                                        break;
                                    }
                                    _ => {
                                        if let Some(row) = extract_inserted_record(&frame) {
                                            debug!("[Realtime] 📨 收到插入事件: id={}", row.id);
                                            if tx.send(row).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                warn!("[Realtime] 👋 连接关闭: {:?}", frame);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("[Realtime] WebSocket 错误: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            info!("[Realtime] 📴 订阅结束: {}", channel_topic);
        });

        Ok(InsertSubscription::new(rx, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_carries_postgres_changes_config() {
        let filter = InsertFilter::eq("receiver_id", "me");
        let frame = PhoenixFrame::join("chat:me:friend", "messages", Some(&filter), "jwt", 1);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["topic"], "realtime:chat:me:friend");
        assert_eq!(json["event"], "phx_join");
        assert_eq!(json["ref"], "1");
        let change = &json["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "INSERT");
        assert_eq!(change["table"], "messages");
        assert_eq!(change["filter"], "receiver_id=eq.me");
        assert_eq!(json["payload"]["access_token"], "jwt");

        let unfiltered = PhoenixFrame::join("t", "messages", None, "jwt", 1);
        assert!(unfiltered.payload["config"]["postgres_changes"][0]
            .get("filter")
            .is_none());
    }

    #[test]
    fn heartbeat_frame_shape() {
        let json = serde_json::to_value(PhoenixFrame::heartbeat(7)).unwrap();
        assert_eq!(json["topic"], "phoenix");
        assert_eq!(json["event"], "heartbeat");
        assert_eq!(json["payload"], json!({}));
    }

    #[test]
    fn extracts_insert_record() {
        let text = r#"{
            "topic":"realtime:chat","event":"postgres_changes","ref":null,
            "payload":{"data":{"type":"INSERT","table":"messages","schema":"public",
              "record":{"id":"m1","sender_id":"a","receiver_id":"b","original_text":"hi",
                        "status":"SENT","sent_at":"2024-05-01T10:00:00"}}}
        }"#;
        let frame: PhoenixFrame = serde_json::from_str(text).unwrap();
        let row = extract_inserted_record(&frame).unwrap();
        assert_eq!(row.id, "m1");
        assert_eq!(row.payload, "hi");
    }

    #[test]
    fn ignores_non_insert_frames() {
        let update: PhoenixFrame = serde_json::from_value(json!({
            "topic": "realtime:chat", "event": "postgres_changes",
            "payload": {"data": {"type": "UPDATE", "record": {"id": "m1"}}}
        }))
        .unwrap();
        assert!(extract_inserted_record(&update).is_none());

        let reply: PhoenixFrame = serde_json::from_value(json!({
            "topic": "phoenix", "event": "phx_reply", "ref": "2",
            "payload": {"status": "ok", "response": {}}
        }))
        .unwrap();
        assert!(extract_inserted_record(&reply).is_none());
    }

    #[test]
    fn websocket_url_includes_key() {
        let feed = RealtimeFeed::new("wss://demo.example/realtime/v1/", "anon", "jwt");
        assert_eq!(
            feed.build_url(),
            "wss://demo.example/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }
}
