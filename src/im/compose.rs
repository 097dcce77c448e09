//! 发送前的编辑与打包
//!
//! 校验草稿、生成（或沿用预览的）元数据、打包信封并写入消息表。

use crate::im::errors::VibeError;
use crate::im::message::envelope::{build_envelope, encode_payload};
use crate::im::message::models::{MessageRow, NewMessage};
use crate::im::message::types::DeliveryStatus;
use crate::im::serialization::now_millis;
use crate::im::store::MessageRecordStore;
use crate::im::vibe::{analyze_or_fallback, VibeAnalysis, VibeGenerator};
use anyhow::{Context, Result};
use tracing::info;

/// 单条消息的最大字符数
pub const MAX_MESSAGE_CHARS: usize = 50;

/// 通过校验的待发送文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeDraft {
    text: String,
}

impl ComposeDraft {
    /// 去掉首尾空白后不能为空，总长度不超过 50 个字符
    pub fn new(text: impl Into<String>) -> std::result::Result<Self, VibeError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(VibeError::EmptyMessage);
        }
        let len = text.chars().count();
        if len > MAX_MESSAGE_CHARS {
            return Err(VibeError::MessageTooLong {
                len,
                max: MAX_MESSAGE_CHARS,
            });
        }
        Ok(Self { text })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 还可输入的字符数
    pub fn remaining(&self) -> usize {
        MAX_MESSAGE_CHARS.saturating_sub(self.text.chars().count())
    }

    /// 有预览结果时沿用预览，否则现场生成
    pub async fn resolve_analysis(
        &self,
        generator: &dyn VibeGenerator,
        preview: Option<VibeAnalysis>,
    ) -> VibeAnalysis {
        match preview {
            Some(analysis) => analysis,
            None => analyze_or_fallback(generator, &self.text).await,
        }
    }

    /// 生成待插入的消息
    pub fn to_new_message(&self, me: &str, friend: &str, analysis: &VibeAnalysis) -> Result<NewMessage> {
        let payload = encode_payload(&build_envelope(&self.text, analysis)).context("打包消息失败")?;
        Ok(NewMessage {
            sender_id: me.to_string(),
            receiver_id: friend.to_string(),
            payload,
            status: DeliveryStatus::Sent,
            sent_at: now_millis(),
        })
    }
}

/// 编辑页的一次性发送（不经过会话视图）
pub async fn compose_and_send(
    store: &dyn MessageRecordStore,
    generator: &dyn VibeGenerator,
    me: &str,
    friend: &str,
    draft: &ComposeDraft,
    preview: Option<VibeAnalysis>,
) -> Result<MessageRow> {
    let analysis = draft.resolve_analysis(generator, preview).await;
    let message = draft.to_new_message(me, friend, &analysis)?;
    let row = store.insert_message(&message).await?;
    info!(
        "[Compose] 📤 已发送 {} → {}: {}",
        me,
        friend,
        analysis.emojis.join("")
    );
    Ok(row)
}
