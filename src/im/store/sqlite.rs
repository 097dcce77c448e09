//! 本地 SQLite 记录存储（基于 sqlx）
//!
//! 表结构由 `migrations/` 管理。插入事件通过进程内 broadcast 分发给订阅者，
//! 语义与远端实时推送一致：只推送新插入的行，状态更新不推送。

use crate::im::db::create_sqlite_pool_with_migration;
use crate::im::friend::models::Friendship;
use crate::im::message::models::{MessageRow, NewMessage};
use crate::im::message::types::DeliveryStatus;
use crate::im::profile::models::Profile;
use crate::im::serialization::{from_millis, now_millis};
use crate::im::store::{
    ConversationPair, FriendshipRecordStore, InsertFilter, InsertSubscription, MessageRecordStore,
    ProfileRecordStore, UsernameMatch,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const INSERT_CHANNEL_CAPACITY: usize = 256;

/// 本地 SQLite 记录存储
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Pool<Sqlite>,
    inserts: broadcast::Sender<MessageRow>,
}

impl SqliteRecordStore {
    /// 连接数据库并执行迁移
    pub async fn connect(db_url: &str) -> Result<Self> {
        let db = create_sqlite_pool_with_migration(db_url).await?;
        Ok(Self::with_pool(db))
    }

    /// 内存数据库（测试与演示使用）
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn with_pool(db: Pool<Sqlite>) -> Self {
        let (inserts, _) = broadcast::channel(INSERT_CHANNEL_CAPACITY);
        Self { db, inserts }
    }

    fn placeholders(n: usize) -> String {
        if n == 0 {
            String::new()
        } else {
            vec!["?"; n].join(",")
        }
    }

    fn row_to_message(m: &SqliteRow) -> MessageRow {
        let status: String = m.get("status");
        let sent_at: i64 = m.get("sent_at");
        MessageRow {
            id: m.get("id"),
            sender_id: m.get("sender_id"),
            receiver_id: m.get("receiver_id"),
            payload: m.get("original_text"),
            status: Some(DeliveryStatus::parse_loose(&status)),
            sent_at: from_millis(sent_at),
        }
    }

    fn row_to_profile(m: &SqliteRow) -> Profile {
        Profile {
            id: m.get("id"),
            username: m.try_get("username").unwrap_or(None),
            avatar_seed: m.try_get("avatar_seed").unwrap_or(None),
            bg_color: m.try_get("bg_color").unwrap_or(None),
        }
    }
}

#[async_trait]
impl MessageRecordStore for SqliteRecordStore {
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, receiver_id, original_text, status, sent_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.payload)
        .bind(message.status.as_str())
        .bind(message.sent_at.timestamp_millis())
        .bind(now_millis().timestamp_millis())
        .execute(&self.db)
        .await
        .context("插入消息失败")?;

        let row = MessageRow {
            id,
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            payload: message.payload.clone(),
            status: Some(message.status),
            sent_at: message.sent_at,
        };
        debug!(
            "[SqliteStore] 插入消息: id={}, {} → {}",
            row.id, row.sender_id, row.receiver_id
        );
        // 没有订阅者时 send 返回错误，忽略即可
        let _ = self.inserts.send(row.clone());
        Ok(row)
    }

    async fn select_conversation(&self, pair: &ConversationPair) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sender_id, receiver_id, original_text, status, sent_at
            FROM messages
            WHERE (sender_id = ? AND receiver_id = ?)
               OR (sender_id = ? AND receiver_id = ?)
            ORDER BY sent_at ASC, created_at ASC, rowid ASC
            "#,
        )
        .bind(&pair.me)
        .bind(&pair.friend)
        .bind(&pair.friend)
        .bind(&pair.me)
        .fetch_all(&self.db)
        .await
        .context("查询会话消息失败")?;

        Ok(rows.iter().map(Self::row_to_message).collect())
    }

    async fn select_unread_senders(&self, receiver_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT sender_id FROM messages WHERE receiver_id = ? AND status != 'READ'")
            .bind(receiver_id)
            .fetch_all(&self.db)
            .await
            .context("查询未读消息失败")?;
        Ok(rows.iter().map(|m| m.get("sender_id")).collect())
    }

    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'READ' WHERE receiver_id = ? AND sender_id = ? AND status != 'READ'",
        )
        .bind(receiver_id)
        .bind(sender_id)
        .execute(&self.db)
        .await
        .context("标记已读失败")?;
        Ok(result.rows_affected())
    }

    async fn delete_conversation(&self, pair: &ConversationPair) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM messages
            WHERE (sender_id = ? AND receiver_id = ?)
               OR (sender_id = ? AND receiver_id = ?)
            "#,
        )
        .bind(&pair.me)
        .bind(&pair.friend)
        .bind(&pair.friend)
        .bind(&pair.me)
        .execute(&self.db)
        .await
        .context("删除会话消息失败")?;
        Ok(result.rows_affected())
    }

    async fn delete_messages_for_user(&self, user_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE sender_id = ? OR receiver_id = ?")
            .bind(user_id)
            .bind(user_id)
            .execute(&self.db)
            .await
            .context("删除用户消息失败")?;
        Ok(result.rows_affected())
    }

    async fn subscribe_inserts(&self, filter: Option<InsertFilter>) -> Result<InsertSubscription> {
        let mut source = self.inserts.subscribe();
        let (tx, rx) = mpsc::channel(INSERT_CHANNEL_CAPACITY);
        let guard = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(row) => {
                        if filter.as_ref().map(|f| f.matches(&row)).unwrap_or(true)
                            && tx.send(row).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[SqliteStore] ⚠️ 插入事件积压，丢弃 {} 条（下次轮询会补齐）", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        info!("[SqliteStore] 📡 已订阅消息插入事件");
        Ok(InsertSubscription::new(rx, guard))
    }
}

#[async_trait]
impl ProfileRecordStore for SqliteRecordStore {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let row = sqlx::query("SELECT id, username, avatar_seed, bg_color FROM profiles WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await
            .context("查询用户资料失败")?;
        Ok(row.as_ref().map(Self::row_to_profile))
    }

    async fn fetch_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, username, avatar_seed, bg_color FROM profiles WHERE id IN ({})",
            Self::placeholders(user_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in user_ids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.db)
            .await
            .context("批量查询用户资料失败")?;
        Ok(rows.iter().map(Self::row_to_profile).collect())
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, username, avatar_seed, bg_color)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                avatar_seed = excluded.avatar_seed,
                bg_color = excluded.bg_color
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.username)
        .bind(&profile.avatar_seed)
        .bind(&profile.bg_color)
        .execute(&self.db)
        .await
        .context("写入用户资料失败")?;
        Ok(())
    }

    async fn update_username(&self, user_id: &str, username: &str) -> Result<()> {
        sqlx::query("UPDATE profiles SET username = ? WHERE id = ?")
            .bind(username)
            .bind(user_id)
            .execute(&self.db)
            .await
            .context("更新用户名失败")?;
        Ok(())
    }

    async fn update_avatar(&self, user_id: &str, avatar_seed: &str, bg_color: &str) -> Result<()> {
        sqlx::query("UPDATE profiles SET avatar_seed = ?, bg_color = ? WHERE id = ?")
            .bind(avatar_seed)
            .bind(bg_color)
            .bind(user_id)
            .execute(&self.db)
            .await
            .context("更新头像失败")?;
        Ok(())
    }

    async fn find_profiles_by_username(
        &self,
        query: &str,
        mode: UsernameMatch,
        limit: usize,
    ) -> Result<Vec<Profile>> {
        let sql = match mode {
            UsernameMatch::Exact => {
                "SELECT id, username, avatar_seed, bg_color FROM profiles WHERE lower(username) = lower(?) LIMIT ?"
            }
            UsernameMatch::Contains => {
                "SELECT id, username, avatar_seed, bg_color FROM profiles WHERE instr(lower(username), lower(?)) > 0 ORDER BY username LIMIT ?"
            }
        };
        let rows = sqlx::query(sql)
            .bind(query)
            .bind(limit as i64)
            .fetch_all(&self.db)
            .await
            .context("按用户名查询资料失败")?;
        Ok(rows.iter().map(Self::row_to_profile).collect())
    }
}

#[async_trait]
impl FriendshipRecordStore for SqliteRecordStore {
    async fn fetch_friendships(&self, user_id: &str) -> Result<Vec<Friendship>> {
        let rows = sqlx::query(
            "SELECT user_id, friend_id, status FROM friendships WHERE user_id = ? OR friend_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .context("查询好友关系失败")?;

        Ok(rows
            .iter()
            .map(|m| Friendship {
                user_id: m.get("user_id"),
                friend_id: m.get("friend_id"),
                status: m.try_get("status").unwrap_or(None),
            })
            .collect())
    }

    async fn friendship_exists(&self, a: &str, b: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM friendships
            WHERE (user_id = ? AND friend_id = ?) OR (user_id = ? AND friend_id = ?)
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_one(&self.db)
        .await
        .context("查询好友关系失败")?;
        Ok(count > 0)
    }

    async fn insert_friendship(&self, user_id: &str, friend_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO friendships (user_id, friend_id, status, created_at) VALUES (?, ?, NULL, ?)",
        )
        .bind(user_id)
        .bind(friend_id)
        .bind(now_millis().timestamp_millis())
        .execute(&self.db)
        .await
        .context("添加好友关系失败")?;
        Ok(())
    }

    async fn delete_friendship(&self, a: &str, b: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM friendships
            WHERE (user_id = ? AND friend_id = ?) OR (user_id = ? AND friend_id = ?)
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .execute(&self.db)
        .await
        .context("删除好友关系失败")?;
        Ok(result.rows_affected())
    }

    async fn delete_friendships_for_user(&self, user_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM friendships WHERE user_id = ? OR friend_id = ?")
            .bind(user_id)
            .bind(user_id)
            .execute(&self.db)
            .await
            .context("删除用户好友关系失败")?;
        Ok(result.rows_affected())
    }
}
