//! 消息存储模型定义

use crate::im::message::types::DeliveryStatus;
use crate::im::serialization::{deserialize_string_or_number, parse_timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 远端消息行（对应 `messages` 表）
///
/// `payload` 存放序列化后的信封（列名 `original_text`），
/// `sent_at` 由发送方在发送时赋值，决定会话内的排序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MessageRecord")]
pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(rename = "original_text")]
    pub payload: String,
    /// 状态列，缺失时以信封中的状态为准
    pub status: Option<DeliveryStatus>,
    pub sent_at: DateTime<Utc>,
}

/// 线上记录的宽松形态：各列都可能为 null 或缺失（不同 schema 版本）
#[derive(Debug, Deserialize)]
struct MessageRecord {
    #[serde(deserialize_with = "deserialize_string_or_number")]
    id: String,
    #[serde(default, deserialize_with = "deserialize_string_or_number")]
    sender_id: String,
    #[serde(default, deserialize_with = "deserialize_string_or_number")]
    receiver_id: String,
    #[serde(default)]
    original_text: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    sent_at: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

impl From<MessageRecord> for MessageRow {
    fn from(r: MessageRecord) -> Self {
        let sent_at = r
            .sent_at
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| r.created_at.as_deref().and_then(parse_timestamp))
            .unwrap_or_default();
        MessageRow {
            id: r.id,
            sender_id: r.sender_id,
            receiver_id: r.receiver_id,
            payload: r.original_text.or(r.text).unwrap_or_default(),
            status: r.status.as_deref().map(DeliveryStatus::parse_loose),
            sent_at,
        }
    }
}

/// 待插入的消息（id 由存储分配）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(rename = "original_text")]
    pub payload: String,
    pub status: DeliveryStatus,
    pub sent_at: DateTime<Utc>,
}
