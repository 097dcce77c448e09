//! 托管后端 REST 数据接口客户端
//!
//! 数据接口为 PostgREST 风格：`{base}/rest/v1/<table>`，
//! 过滤条件写在查询参数里（`col=eq.v`、`or=(...)`、`order=col.asc`）。
//! 每个请求都带 `apikey` 与 `Authorization: Bearer <token>`（在 HTTP 客户端默认头中设置）。

use crate::im::friend::models::Friendship;
use crate::im::message::models::{MessageRow, NewMessage};
use crate::im::profile::models::Profile;
use crate::im::store::{
    ConversationPair, FriendshipRecordStore, InsertFilter, InsertSubscription, MessageRecordStore,
    ProfileRecordStore, RealtimeFeed, UsernameMatch,
};
use crate::im::types::{handle_http_response, read_http_body};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

const RETURN_REPRESENTATION: &str = "return=representation";
const RETURN_MINIMAL: &str = "return=minimal";

/// 去掉过滤表达式里的保留字符（逗号、括号、通配符、引号）
fn pg_value(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '%' | '"' | '\\'))
        .collect()
}

/// 会话双方任一方向的 `or` 过滤表达式
fn pair_filter(pair: &ConversationPair) -> String {
    format!(
        "(and(sender_id.eq.{a},receiver_id.eq.{b}),and(sender_id.eq.{b},receiver_id.eq.{a}))",
        a = pg_value(&pair.me),
        b = pg_value(&pair.friend)
    )
}

fn friendship_pair_filter(a: &str, b: &str) -> String {
    format!(
        "(and(user_id.eq.{a},friend_id.eq.{b}),and(user_id.eq.{b},friend_id.eq.{a}))",
        a = pg_value(a),
        b = pg_value(b)
    )
}

fn username_filter(query: &str, mode: UsernameMatch) -> String {
    match mode {
        UsernameMatch::Exact => format!("ilike.{}", pg_value(query)),
        UsernameMatch::Contains => format!("ilike.*{}*", pg_value(query)),
    }
}

#[derive(Debug, Deserialize)]
struct SenderOnly {
    #[serde(deserialize_with = "crate::im::serialization::deserialize_string_or_number")]
    sender_id: String,
}

/// REST 记录存储
#[derive(Clone)]
pub struct RestRecordStore {
    client: reqwest::Client,
    rest_base_url: String,
    realtime: Option<RealtimeFeed>,
}

impl RestRecordStore {
    /// 创建带认证默认头的客户端
    ///
    /// 未登录时 `access_token` 传 anon key 即可。
    pub fn new(base_url: &str, api_key: &str, access_token: &str) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = HeaderMap::new();
                headers.insert(
                    HeaderName::from_static("apikey"),
                    HeaderValue::from_str(api_key).context("无效的 api key")?,
                );
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", access_token))
                        .context("无效的 access token")?,
                );
                headers
            })
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self {
            client,
            rest_base_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            realtime: None,
        })
    }

    /// 配置实时推送（未配置时订阅插入事件会返回错误，只能依赖轮询）
    pub fn with_realtime(mut self, feed: RealtimeFeed) -> Self {
        self.realtime = Some(feed);
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_base_url, table)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        let operation_id = Uuid::new_v4().to_string();
        debug!(
            "[RestStore] {} {} operationID={}",
            method,
            self.table_url(table),
            operation_id
        );
        self.client
            .request(method, self.table_url(table))
            .header("operationID", operation_id)
    }

    /// 执行写请求并返回受影响的行数（依赖 `return=representation`）
    async fn affected_rows(&self, builder: reqwest::RequestBuilder, op: &str) -> Result<u64> {
        let response = builder
            .header("Prefer", RETURN_REPRESENTATION)
            .send()
            .await
            .context(format!("{}请求失败", op))?;
        let rows: Vec<serde_json::Value> = handle_http_response(response, op).await?;
        Ok(rows.len() as u64)
    }

    async fn send_minimal(&self, builder: reqwest::RequestBuilder, op: &str) -> Result<()> {
        let response = builder
            .header("Prefer", RETURN_MINIMAL)
            .send()
            .await
            .context(format!("{}请求失败", op))?;
        read_http_body(response, op).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageRecordStore for RestRecordStore {
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow> {
        let response = self
            .request(reqwest::Method::POST, "messages")
            .header("Prefer", RETURN_REPRESENTATION)
            .json(message)
            .send()
            .await
            .context("插入消息请求失败")?;
        let rows: Vec<MessageRow> = handle_http_response(response, "插入消息").await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("插入消息响应中缺少记录"))?;
        info!("[RestStore] ✅ 消息已写入: id={}", row.id);
        Ok(row)
    }

    async fn select_conversation(&self, pair: &ConversationPair) -> Result<Vec<MessageRow>> {
        let response = self
            .request(reqwest::Method::GET, "messages")
            .query(&[
                ("select", "*".to_string()),
                ("or", pair_filter(pair)),
                ("order", "sent_at.asc".to_string()),
            ])
            .send()
            .await
            .context("查询会话消息请求失败")?;
        handle_http_response(response, "查询会话消息").await
    }

    async fn select_unread_senders(&self, receiver_id: &str) -> Result<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, "messages")
            .query(&[
                ("select", "sender_id".to_string()),
                ("receiver_id", format!("eq.{}", pg_value(receiver_id))),
                ("status", "neq.READ".to_string()),
            ])
            .send()
            .await
            .context("查询未读消息请求失败")?;
        let rows: Vec<SenderOnly> = handle_http_response(response, "查询未读消息").await?;
        Ok(rows.into_iter().map(|r| r.sender_id).collect())
    }

    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64> {
        let builder = self
            .request(reqwest::Method::PATCH, "messages")
            .query(&[
                ("receiver_id", format!("eq.{}", pg_value(receiver_id))),
                ("sender_id", format!("eq.{}", pg_value(sender_id))),
                ("status", "neq.READ".to_string()),
            ])
            .json(&json!({ "status": "READ" }));
        self.affected_rows(builder, "标记已读").await
    }

    async fn delete_conversation(&self, pair: &ConversationPair) -> Result<u64> {
        let builder = self
            .request(reqwest::Method::DELETE, "messages")
            .query(&[("or", pair_filter(pair))]);
        self.affected_rows(builder, "删除会话消息").await
    }

    async fn delete_messages_for_user(&self, user_id: &str) -> Result<u64> {
        let id = pg_value(user_id);
        let builder = self
            .request(reqwest::Method::DELETE, "messages")
            .query(&[("or", format!("(sender_id.eq.{id},receiver_id.eq.{id})"))]);
        self.affected_rows(builder, "删除用户消息").await
    }

    async fn subscribe_inserts(&self, filter: Option<InsertFilter>) -> Result<InsertSubscription> {
        let feed = self
            .realtime
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("未配置实时服务"))?;
        let topic = match &filter {
            Some(f) => format!("messages:{}", f.to_realtime_expr()),
            None => "messages".to_string(),
        };
        feed.subscribe(&topic, "messages", filter).await
    }
}

#[async_trait]
impl ProfileRecordStore for RestRecordStore {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let response = self
            .request(reqwest::Method::GET, "profiles")
            .query(&[
                ("select", "*".to_string()),
                ("id", format!("eq.{}", pg_value(user_id))),
            ])
            .send()
            .await
            .context("查询用户资料请求失败")?;
        let rows: Vec<Profile> = handle_http_response(response, "查询用户资料").await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = user_ids.iter().map(|id| pg_value(id)).collect();
        let response = self
            .request(reqwest::Method::GET, "profiles")
            .query(&[
                ("select", "*".to_string()),
                ("id", format!("in.({})", ids.join(","))),
            ])
            .send()
            .await
            .context("批量查询用户资料请求失败")?;
        handle_http_response(response, "批量查询用户资料").await
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "profiles")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(profile)
            .send()
            .await
            .context("写入用户资料请求失败")?;
        read_http_body(response, "写入用户资料").await?;
        Ok(())
    }

    async fn update_username(&self, user_id: &str, username: &str) -> Result<()> {
        let builder = self
            .request(reqwest::Method::PATCH, "profiles")
            .query(&[("id", format!("eq.{}", pg_value(user_id)))])
            .json(&json!({ "username": username }));
        self.send_minimal(builder, "更新用户名").await
    }

    async fn update_avatar(&self, user_id: &str, avatar_seed: &str, bg_color: &str) -> Result<()> {
        let builder = self
            .request(reqwest::Method::PATCH, "profiles")
            .query(&[("id", format!("eq.{}", pg_value(user_id)))])
            .json(&json!({ "avatar_id": avatar_seed, "color": bg_color }));
        self.send_minimal(builder, "更新头像").await
    }

    async fn find_profiles_by_username(
        &self,
        query: &str,
        mode: UsernameMatch,
        limit: usize,
    ) -> Result<Vec<Profile>> {
        let response = self
            .request(reqwest::Method::GET, "profiles")
            .query(&[
                ("select", "*".to_string()),
                ("username", username_filter(query, mode)),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .context("按用户名查询资料请求失败")?;
        handle_http_response(response, "按用户名查询资料").await
    }
}

#[async_trait]
impl FriendshipRecordStore for RestRecordStore {
    async fn fetch_friendships(&self, user_id: &str) -> Result<Vec<Friendship>> {
        let id = pg_value(user_id);
        let response = self
            .request(reqwest::Method::GET, "friendships")
            .query(&[
                ("select", "user_id,friend_id,status".to_string()),
                ("or", format!("(user_id.eq.{id},friend_id.eq.{id})")),
            ])
            .send()
            .await
            .context("查询好友关系请求失败")?;
        handle_http_response(response, "查询好友关系").await
    }

    async fn friendship_exists(&self, a: &str, b: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::GET, "friendships")
            .query(&[
                ("select", "user_id".to_string()),
                ("or", friendship_pair_filter(a, b)),
            ])
            .send()
            .await
            .context("查询好友关系请求失败")?;
        let rows: Vec<serde_json::Value> = handle_http_response(response, "查询好友关系").await?;
        Ok(!rows.is_empty())
    }

    async fn insert_friendship(&self, user_id: &str, friend_id: &str) -> Result<()> {
        let builder = self
            .request(reqwest::Method::POST, "friendships")
            .json(&json!({ "user_id": user_id, "friend_id": friend_id }));
        self.send_minimal(builder, "添加好友关系").await
    }

    async fn delete_friendship(&self, a: &str, b: &str) -> Result<u64> {
        let builder = self
            .request(reqwest::Method::DELETE, "friendships")
            .query(&[("or", friendship_pair_filter(a, b))]);
        self.affected_rows(builder, "删除好友关系").await
    }

    async fn delete_friendships_for_user(&self, user_id: &str) -> Result<u64> {
        let id = pg_value(user_id);
        let builder = self
            .request(reqwest::Method::DELETE, "friendships")
            .query(&[("or", format!("(user_id.eq.{id},friend_id.eq.{id})"))]);
        self.affected_rows(builder, "删除用户好友关系").await
    }
}
