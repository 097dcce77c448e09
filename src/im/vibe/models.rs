//! 生成结果模型

use crate::im::message::types::Difficulty;
use crate::im::serialization::{deserialize_points, deserialize_vec_or_null, strip_code_fences, DEFAULT_POINTS};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HINT: &str = "GUESS THE VIBE!";
pub const DEFAULT_TOPIC: &str = "MYSTERY";
pub const FALLBACK_HINT: &str = "TRY TO GUESS!";
pub const FALLBACK_EMOJIS: [&str; 3] = ["❓", "👋", "✨"];

/// 一条消息的表情与游戏元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VibeAnalysis {
    pub emojis: Vec<String>,
    pub topic: String,
    pub hint: String,
    pub difficulty: Difficulty,
    pub points: i64,
}

impl VibeAnalysis {
    /// 生成失败时使用的固定结果
    pub fn fallback() -> Self {
        Self {
            emojis: FALLBACK_EMOJIS.iter().map(|e| e.to_string()).collect(),
            topic: DEFAULT_TOPIC.to_string(),
            hint: FALLBACK_HINT.to_string(),
            difficulty: Difficulty::Medium,
            points: DEFAULT_POINTS,
        }
    }
}

/// 模型原始输出，各字段都可能缺失
#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    emojis: Vec<String>,
    #[serde(default)]
    hint: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default, deserialize_with = "deserialize_points")]
    points: i64,
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    match value {
        Some(s) if !s.trim().is_empty() => s,
        _ => default.to_string(),
    }
}

/// 解析模型输出并归一化
///
/// 去掉代码块标记后按 JSON 解析；没有表情的输出视为格式错误。
pub fn parse_analysis(output: &str) -> Result<VibeAnalysis> {
    let cleaned = strip_code_fences(output);
    let raw: RawAnalysis = serde_json::from_str(if cleaned.is_empty() { "{}" } else { cleaned.as_str() })
        .context("生成结果不是合法 JSON")?;

    let emojis: Vec<String> = raw
        .emojis
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    if emojis.is_empty() {
        bail!("生成结果缺少表情");
    }

    Ok(VibeAnalysis {
        emojis,
        topic: non_empty_or(raw.topic, DEFAULT_TOPIC),
        hint: non_empty_or(raw.hint, DEFAULT_HINT),
        difficulty: raw
            .difficulty
            .as_deref()
            .map(Difficulty::parse_loose)
            .unwrap_or_default(),
        points: if raw.points > 0 { raw.points } else { DEFAULT_POINTS },
    })
}
