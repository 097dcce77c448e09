//! 记录存储抽象
//!
//! 托管后端提供三张表（messages / profiles / friendships）与插入事件推送。
//! 上层服务只依赖这里的 trait，具体实现有两种：
//! - `SqliteRecordStore`：本地 SQLite（离线模式与测试使用），插入事件进程内广播；
//! - `RestRecordStore`：托管后端的 REST 数据接口，插入事件来自 `RealtimeFeed`。

pub mod realtime;
pub mod rest;
pub mod sqlite;

use crate::im::friend::models::Friendship;
use crate::im::message::models::{MessageRow, NewMessage};
use crate::im::profile::models::Profile;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use realtime::RealtimeFeed;
pub use rest::RestRecordStore;
pub use sqlite::SqliteRecordStore;

/// 会话双方（有序：`me` 为当前用户）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationPair {
    pub me: String,
    pub friend: String,
}

impl ConversationPair {
    pub fn new(me: impl Into<String>, friend: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            friend: friend.into(),
        }
    }

    /// 记录是否属于这两人之间（任一方向）
    pub fn contains(&self, row: &MessageRow) -> bool {
        (row.sender_id == self.me && row.receiver_id == self.friend)
            || (row.sender_id == self.friend && row.receiver_id == self.me)
    }
}

/// 插入事件过滤条件（单列等值）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertFilter {
    pub column: String,
    pub value: String,
}

impl InsertFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// 本地匹配（远端过滤不可用或实现进程内广播时使用）
    pub fn matches(&self, row: &MessageRow) -> bool {
        match self.column.as_str() {
            "id" => row.id == self.value,
            "sender_id" => row.sender_id == self.value,
            "receiver_id" => row.receiver_id == self.value,
            _ => false,
        }
    }

    /// 实时订阅使用的过滤表达式，如 `receiver_id=eq.<id>`
    pub fn to_realtime_expr(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }
}

/// 插入事件订阅
///
/// drop 时终止后台转发任务（同时关闭底层连接）。
pub struct InsertSubscription {
    rx: mpsc::Receiver<MessageRow>,
    guard: Option<JoinHandle<()>>,
}

impl InsertSubscription {
    pub fn new(rx: mpsc::Receiver<MessageRow>, guard: JoinHandle<()>) -> Self {
        Self {
            rx,
            guard: Some(guard),
        }
    }

    /// 等待下一条插入的记录；订阅结束时返回 `None`
    pub async fn recv(&mut self) -> Option<MessageRow> {
        self.rx.recv().await
    }
}

impl Drop for InsertSubscription {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.abort();
        }
    }
}

/// 用户名查询方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsernameMatch {
    /// 不区分大小写的完全匹配
    Exact,
    /// 不区分大小写的子串匹配
    Contains,
}

/// 消息表操作
#[async_trait]
pub trait MessageRecordStore: Send + Sync {
    /// 插入一条消息，返回带存储分配 ID 的完整记录
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow>;

    /// 查询两人之间（任一方向）的全部消息，按 `sent_at` 升序
    async fn select_conversation(&self, pair: &ConversationPair) -> Result<Vec<MessageRow>>;

    /// 查询发给 `receiver_id` 且未读的消息的发送者 ID（每条消息一项）
    async fn select_unread_senders(&self, receiver_id: &str) -> Result<Vec<String>>;

    /// 将 `sender_id → receiver_id` 方向的未读消息标记为 READ，返回更新条数
    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64>;

    /// 删除两人之间的全部消息
    async fn delete_conversation(&self, pair: &ConversationPair) -> Result<u64>;

    /// 删除某用户收发的全部消息
    async fn delete_messages_for_user(&self, user_id: &str) -> Result<u64>;

    /// 订阅新插入的消息
    async fn subscribe_inserts(&self, filter: Option<InsertFilter>) -> Result<InsertSubscription>;
}

/// 资料表操作
#[async_trait]
pub trait ProfileRecordStore: Send + Sync {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    async fn fetch_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>>;

    async fn upsert_profile(&self, profile: &Profile) -> Result<()>;

    async fn update_username(&self, user_id: &str, username: &str) -> Result<()>;

    async fn update_avatar(&self, user_id: &str, avatar_seed: &str, bg_color: &str) -> Result<()>;

    async fn find_profiles_by_username(
        &self,
        query: &str,
        mode: UsernameMatch,
        limit: usize,
    ) -> Result<Vec<Profile>>;
}

/// 好友关系表操作
#[async_trait]
pub trait FriendshipRecordStore: Send + Sync {
    /// 查询包含该用户的全部关系（任一方向）
    async fn fetch_friendships(&self, user_id: &str) -> Result<Vec<Friendship>>;

    /// 两人之间是否已有关系（任一方向）
    async fn friendship_exists(&self, a: &str, b: &str) -> Result<bool>;

    async fn insert_friendship(&self, user_id: &str, friend_id: &str) -> Result<()>;

    /// 删除两人之间的关系（任一方向）
    async fn delete_friendship(&self, a: &str, b: &str) -> Result<u64>;

    /// 删除包含该用户的全部关系
    async fn delete_friendships_for_user(&self, user_id: &str) -> Result<u64>;
}

/// 完整的记录存储
pub trait RecordStore: MessageRecordStore + ProfileRecordStore + FriendshipRecordStore {}

impl<T> RecordStore for T where T: MessageRecordStore + ProfileRecordStore + FriendshipRecordStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::serialization::from_millis;

    fn row(from: &str, to: &str) -> MessageRow {
        MessageRow {
            id: "1".into(),
            sender_id: from.into(),
            receiver_id: to.into(),
            payload: String::new(),
            status: None,
            sent_at: from_millis(0),
        }
    }

    #[test]
    fn pair_matches_both_directions() {
        let pair = ConversationPair::new("a", "b");
        assert!(pair.contains(&row("a", "b")));
        assert!(pair.contains(&row("b", "a")));
        assert!(!pair.contains(&row("a", "c")));
        assert!(!pair.contains(&row("a", "a")));
    }

    #[test]
    fn filter_matches_and_renders() {
        let filter = InsertFilter::eq("receiver_id", "b");
        assert!(filter.matches(&row("a", "b")));
        assert!(!filter.matches(&row("b", "a")));
        assert_eq!(filter.to_realtime_expr(), "receiver_id=eq.b");
        assert!(!InsertFilter::eq("status", "x").matches(&row("a", "b")));
    }
}
