//! 表情与线索生成器
//!
//! `GeminiVibeGenerator` 调用生成式语言模型的 `generateContent` 接口，
//! 要求以 JSON 返回（带 response schema）。调用方一般使用 `analyze_or_fallback`，
//! 任何失败都会退回固定结果，不阻塞发送。

use crate::im::types::handle_http_response;
use crate::im::vibe::models::{parse_analysis, VibeAnalysis};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_GENERATOR_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GENERATOR_MODEL: &str = "gemini-2.5-flash";

/// 表情生成器
#[async_trait]
pub trait VibeGenerator: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<VibeAnalysis>;
}

/// 生成元数据，失败时返回固定结果
pub async fn analyze_or_fallback(generator: &dyn VibeGenerator, text: &str) -> VibeAnalysis {
    match generator.analyze(text).await {
        Ok(analysis) => analysis,
        Err(e) => {
            warn!("[VibeGen] ⚠️ 生成失败，使用默认表情: {:#}", e);
            VibeAnalysis::fallback()
        }
    }
}

/// 固定返回同一结果的生成器（离线模式与测试使用）
#[derive(Debug, Clone)]
pub struct StaticVibeGenerator {
    analysis: VibeAnalysis,
}

impl StaticVibeGenerator {
    pub fn new(analysis: VibeAnalysis) -> Self {
        Self { analysis }
    }
}

impl Default for StaticVibeGenerator {
    fn default() -> Self {
        Self::new(VibeAnalysis::fallback())
    }
}

#[async_trait]
impl VibeGenerator for StaticVibeGenerator {
    async fn analyze(&self, _text: &str) -> Result<VibeAnalysis> {
        Ok(self.analysis.clone())
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResp {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateContentResp {
    fn first_text(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .find_map(|p| p.text.as_deref())
    }
}

fn build_prompt(text: &str) -> String {
    format!(
        r#"Analyze this message for an emoji guessing game:

Message: "{text}"

Return JSON with:
{{
  "emojis": ["emoji1", "emoji2", "emoji3"],
  "hint": "brief hint about the topic",
  "difficulty": "easy|medium|hard",
  "topic": "category"
}}

Rules:
1. Use 3-5 emojis that represent the key words or concepts
2. Emojis should be guessable but fun
3. Hint should NOT reveal the answer directly
4. For greetings use gesture emojis (👋, 🙋, etc.)
5. For objects use the object emoji directly
6. NO PHONETIC MATCHING (e.g. don't use Eye for I)"#
    )
}

fn build_request(text: &str) -> serde_json::Value {
    json!({
        "contents": [{ "parts": [{ "text": build_prompt(text) }] }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "OBJECT",
                "properties": {
                    "emojis": { "type": "ARRAY", "items": { "type": "STRING" } },
                    "hint": { "type": "STRING" },
                    "topic": { "type": "STRING" },
                    "difficulty": { "type": "STRING" },
                    "points": { "type": "NUMBER" }
                }
            }
        }
    })
}

/// 基于生成式语言模型 HTTP 接口的生成器
pub struct GeminiVibeGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiVibeGenerator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl VibeGenerator for GeminiVibeGenerator {
    async fn analyze(&self, text: &str) -> Result<VibeAnalysis> {
        let operation_id = Uuid::new_v4().to_string();
        let url = self.endpoint();
        info!("[VibeGen] 📡 请求生成表情, model={}", self.model);
        debug!("[VibeGen]   请求URL: {}, 操作ID: {}", url, operation_id);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .header("operationID", &operation_id)
            .json(&build_request(text))
            .send()
            .await
            .context("生成请求失败")?;

        let resp: GenerateContentResp = handle_http_response(response, "生成表情").await?;
        let output = resp.first_text().unwrap_or("{}");
        let analysis = parse_analysis(output)?;
        info!(
            "[VibeGen] ✅ 生成完成: {} ({})",
            analysis.emojis.join(""),
            analysis.difficulty.as_str()
        );
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::types::Difficulty;

    struct FailingGenerator;

    #[async_trait]
    impl VibeGenerator for FailingGenerator {
        async fn analyze(&self, _text: &str) -> Result<VibeAnalysis> {
            anyhow::bail!("quota exceeded")
        }
    }

    #[tokio::test]
    async fn failures_fall_back_to_fixed_analysis() {
        let got = analyze_or_fallback(&FailingGenerator, "hello").await;
        assert_eq!(got, VibeAnalysis::fallback());
    }

    #[tokio::test]
    async fn static_generator_returns_its_analysis() {
        let analysis = VibeAnalysis {
            emojis: vec!["🐱".into()],
            topic: "PETS".into(),
            hint: "meow".into(),
            difficulty: Difficulty::Easy,
            points: 50,
        };
        let generator = StaticVibeGenerator::new(analysis.clone());
        assert_eq!(analyze_or_fallback(&generator, "cat").await, analysis);
    }

    #[test]
    fn extracts_first_candidate_text() {
        let resp: GenerateContentResp = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"emojis\":[\"👋\"]}"}],"role":"model"}}]}"#,
        )
        .unwrap();
        assert_eq!(resp.first_text(), Some("{\"emojis\":[\"👋\"]}"));

        let empty: GenerateContentResp = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.first_text(), None);
    }

    #[test]
    fn request_asks_for_json_with_schema() {
        let body = build_request("pizza party");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(
            body["generationConfig"]["responseSchema"]["properties"]["emojis"]["type"],
            "ARRAY"
        );
        let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("Message: \"pizza party\""));

        let generator = GeminiVibeGenerator::new("k", DEFAULT_GENERATOR_MODEL, DEFAULT_GENERATOR_BASE_URL);
        assert_eq!(
            generator.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}
