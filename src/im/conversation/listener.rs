//! 会话监听器回调接口

use crate::im::message::view::LocalMessage;
use async_trait::async_trait;

/// 会话监听器回调接口
#[async_trait]
pub trait ConversationListener: Send + Sync {
    /// 消息视图变更，参数为变更后的完整快照
    async fn on_messages_changed(&self, friend_id: String, messages: Vec<LocalMessage>);

    /// 收到对方新消息，界面应滚动到底部
    async fn on_scroll_to_latest(&self, friend_id: String);

    /// 发送失败（条目已标记为 FAILED）
    async fn on_send_failed(&self, friend_id: String, local_id: String, error: String);

    /// 已读回执写入成功
    async fn on_messages_read(&self, friend_id: String, count: u64);
}

/// 空实现（默认监听器）
pub struct EmptyConversationListener;

#[async_trait]
impl ConversationListener for EmptyConversationListener {
    async fn on_messages_changed(&self, _friend_id: String, _messages: Vec<LocalMessage>) {}
    async fn on_scroll_to_latest(&self, _friend_id: String) {}
    async fn on_send_failed(&self, _friend_id: String, _local_id: String, _error: String) {}
    async fn on_messages_read(&self, _friend_id: String, _count: u64) {}
}
