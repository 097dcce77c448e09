//! 信封编解码
//!
//! 远端 schema 没有稳定的元数据列，所有元数据打包进一个文本列。
//! `encode_payload` 与 `decode_payload` 互为逆运算；读取永不失败，
//! 无法解析的内容按“纯文本、无元数据”处理（兼容信封出现之前的旧数据）。

use crate::im::message::types::{
    DeliveryStatus, Difficulty, MessageKind, VibeEnvelope, ENVELOPE_VERSION,
};
use crate::im::serialization::DEFAULT_POINTS;
use crate::im::vibe::VibeAnalysis;
use tracing::debug;

/// 解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    pub text: String,
    pub envelope: Option<VibeEnvelope>,
}

/// 序列化信封
pub fn encode_payload(envelope: &VibeEnvelope) -> serde_json::Result<String> {
    serde_json::to_string(envelope)
}

/// 反序列化信封，失败时回落为原始文本
pub fn decode_payload(raw: &str) -> DecodedPayload {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') {
        match serde_json::from_str::<VibeEnvelope>(raw) {
            Ok(envelope) => {
                if envelope.version > ENVELOPE_VERSION {
                    debug!(
                        "[Envelope] 信封版本 {} 高于当前版本 {}，按已知字段读取",
                        envelope.version, ENVELOPE_VERSION
                    );
                }
                return DecodedPayload {
                    text: envelope.text.clone(),
                    envelope: Some(envelope),
                };
            }
            Err(e) => debug!("[Envelope] 信封解析失败，按纯文本处理: {}", e),
        }
    }
    DecodedPayload {
        text: raw.to_string(),
        envelope: None,
    }
}

/// 由原文与生成的元数据构造待发送的信封
pub fn build_envelope(text: &str, analysis: &VibeAnalysis) -> VibeEnvelope {
    VibeEnvelope {
        version: ENVELOPE_VERSION,
        text: text.to_string(),
        emojis: analysis.emojis.clone(),
        topic: analysis.topic.clone(),
        hint: analysis.hint.clone(),
        difficulty: analysis.difficulty,
        points: analysis.points,
        status: DeliveryStatus::Sent,
        kind: MessageKind::IncomingUnsolved,
    }
}

/// 没有元数据时的最小信封
pub fn plain_envelope(text: &str) -> VibeEnvelope {
    VibeEnvelope {
        version: ENVELOPE_VERSION,
        text: text.to_string(),
        emojis: Vec::new(),
        topic: String::new(),
        hint: String::new(),
        difficulty: Difficulty::Medium,
        points: DEFAULT_POINTS,
        status: DeliveryStatus::Sent,
        kind: MessageKind::IncomingUnsolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VibeEnvelope {
        build_envelope(
            "running late",
            &VibeAnalysis {
                emojis: vec!["🏃".into(), "⏰".into()],
                topic: "TIME".into(),
                hint: "HURRY".into(),
                difficulty: Difficulty::Hard,
                points: 300,
            },
        )
    }

    #[test]
    fn encode_is_inverse_of_decode() {
        let envelope = sample();
        let raw = encode_payload(&envelope).unwrap();
        let decoded = decode_payload(&raw);
        assert_eq!(decoded.text, "running late");
        assert_eq!(decoded.envelope, Some(envelope));
    }

    #[test]
    fn wire_format_uses_expected_field_names() {
        let json: serde_json::Value = serde_json::from_str(&encode_payload(&sample()).unwrap()).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["type"], "INCOMING_UNSOLVED");
        assert_eq!(json["difficulty"], "HARD");
        assert_eq!(json["status"], "SENT");
    }

    #[test]
    fn legacy_envelope_without_version_decodes() {
        let raw = r#"{"text":"pizza party","emojis":["🍕","🎉"],"topic":"FOOD","hint":"yum","difficulty":"EASY","points":100,"status":"SENT","type":"INCOMING_UNSOLVED"}"#;
        let decoded = decode_payload(raw);
        let env = decoded.envelope.unwrap();
        assert_eq!(env.version, 1);
        assert_eq!(env.difficulty, Difficulty::Easy);
        assert_eq!(decoded.text, "pizza party");
    }

    #[test]
    fn malformed_payloads_fall_back_to_raw_text() {
        for raw in ["just words", "{not json", "[1,2,3]", r#"{"emojis":["x"]}"#, ""] {
            let decoded = decode_payload(raw);
            assert_eq!(decoded.text, raw);
            assert!(decoded.envelope.is_none(), "{}", raw);
        }
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let decoded = decode_payload(r#"{"text":"hi","difficulty":"weird","points":null}"#);
        let env = decoded.envelope.unwrap();
        assert_eq!(env.difficulty, Difficulty::Medium);
        assert_eq!(env.points, DEFAULT_POINTS);
        assert_eq!(env.kind, MessageKind::IncomingUnsolved);
        assert!(env.emojis.is_empty());
    }
}
