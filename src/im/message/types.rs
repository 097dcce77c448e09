//! 消息类型定义
//!
//! 定义了消息信封（打包进单个文本列的元数据）及其枚举字段。
//! 枚举的反序列化都是宽松的：未知取值回落到默认值，而不是让整个信封解析失败。

use crate::im::serialization::{default_points, deserialize_points, deserialize_vec_or_null};
use serde::{Deserialize, Serialize};

/// 当前信封版本
pub const ENVELOPE_VERSION: u32 = 1;

/// 题目难度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", from = "String")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl From<String> for Difficulty {
    fn from(s: String) -> Self {
        Difficulty::parse_loose(&s)
    }
}

impl Difficulty {
    /// 只认 EASY / HARD（不区分大小写），其余一律视为 MEDIUM
    pub fn parse_loose(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "EASY" => Difficulty::Easy,
            "HARD" => Difficulty::Hard,
            _ => Difficulty::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "EASY",
            Difficulty::Medium => "MEDIUM",
            Difficulty::Hard => "HARD",
        }
    }

    /// 结果页展示的星级
    pub fn stars(&self) -> u8 {
        match self {
            Difficulty::Easy => 1,
            Difficulty::Medium => 2,
            Difficulty::Hard => 3,
        }
    }
}

/// 消息投递状态
///
/// `Sending` 与 `Failed` 只存在于本地视图中，不会写入存储。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", from = "String")]
pub enum DeliveryStatus {
    Sending,
    #[default]
    Sent,
    Read,
    Failed,
}

impl From<String> for DeliveryStatus {
    fn from(s: String) -> Self {
        DeliveryStatus::parse_loose(&s)
    }
}

impl DeliveryStatus {
    pub fn parse_loose(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "SENDING" => DeliveryStatus::Sending,
            "READ" => DeliveryStatus::Read,
            "FAILED" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Sent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "SENDING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Read => "READ",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    /// 仅存在于本地的状态
    pub fn is_local_only(&self) -> bool {
        matches!(self, DeliveryStatus::Sending | DeliveryStatus::Failed)
    }
}

/// 消息在会话中的呈现类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", from = "String")]
pub enum MessageKind {
    #[default]
    IncomingUnsolved,
    IncomingSolved,
    Outgoing,
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "INCOMING_SOLVED" | "SOLVED" => MessageKind::IncomingSolved,
            "OUTGOING" => MessageKind::Outgoing,
            _ => MessageKind::IncomingUnsolved,
        }
    }
}

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

/// 消息信封：原文与全部游戏元数据，序列化后存入消息行的单个文本列
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VibeEnvelope {
    /// 信封版本，旧数据没有该字段时按 1 处理
    #[serde(rename = "v", default = "default_version")]
    pub version: u32,
    pub text: String,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub emojis: Vec<String>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub hint: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default = "default_points", deserialize_with = "deserialize_points")]
    pub points: i64,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_parse_loosely() {
        assert_eq!(Difficulty::parse_loose("hard"), Difficulty::Hard);
        assert_eq!(Difficulty::parse_loose("medium-ish"), Difficulty::Medium);
        assert_eq!(DeliveryStatus::parse_loose("read"), DeliveryStatus::Read);
        assert_eq!(DeliveryStatus::parse_loose("delivered"), DeliveryStatus::Sent);
        assert_eq!(
            serde_json::from_str::<MessageKind>("\"OUTGOING\"").unwrap(),
            MessageKind::Outgoing
        );
        assert_eq!(
            serde_json::to_string(&MessageKind::IncomingUnsolved).unwrap(),
            "\"INCOMING_UNSOLVED\""
        );
        assert_eq!(serde_json::to_string(&Difficulty::Easy).unwrap(), "\"EASY\"");
    }

    #[test]
    fn stars_follow_difficulty() {
        assert_eq!(Difficulty::Easy.stars(), 1);
        assert_eq!(Difficulty::Hard.stars(), 3);
        assert!(DeliveryStatus::Failed.is_local_only());
        assert!(!DeliveryStatus::Read.is_local_only());
    }
}
