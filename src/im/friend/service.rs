//! 好友服务层
//!
//! 好友关系是无向的：`friendships` 里任一方向有一行即为好友。
//! 好友列表 = 关系 → 去重的对方 ID → 资料 → 未读数。

use crate::im::errors::VibeError;
use crate::im::friend::invite::parse_invite_code;
use crate::im::friend::listener::{EmptyFriendListener, FriendListener};
use crate::im::friend::models::{palette_color, Friend, DEFAULT_AVATAR_SEED, UNKNOWN_NAME};
use crate::im::profile::models::Profile;
use crate::im::store::{
    ConversationPair, FriendshipRecordStore, MessageRecordStore, ProfileRecordStore, UsernameMatch,
};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 搜索结果上限
pub const SEARCH_LIMIT: usize = 10;

/// 好友服务
pub struct FriendService {
    messages: Arc<dyn MessageRecordStore>,
    profiles: Arc<dyn ProfileRecordStore>,
    friendships: Arc<dyn FriendshipRecordStore>,
    listener: Arc<dyn FriendListener>,
}

impl FriendService {
    /// 创建好友服务（使用默认空监听器）
    pub fn new(
        messages: Arc<dyn MessageRecordStore>,
        profiles: Arc<dyn ProfileRecordStore>,
        friendships: Arc<dyn FriendshipRecordStore>,
    ) -> Self {
        Self::with_listener(messages, profiles, friendships, Arc::new(EmptyFriendListener))
    }

    pub fn with_listener(
        messages: Arc<dyn MessageRecordStore>,
        profiles: Arc<dyn ProfileRecordStore>,
        friendships: Arc<dyn FriendshipRecordStore>,
        listener: Arc<dyn FriendListener>,
    ) -> Self {
        Self {
            messages,
            profiles,
            friendships,
            listener,
        }
    }

    /// 资料转为好友卡片
    pub fn present(profile: &Profile, unread_count: usize) -> Friend {
        Friend {
            id: profile.id.clone(),
            name: profile
                .username
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| UNKNOWN_NAME.to_string()),
            avatar_seed: profile
                .avatar_seed
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_AVATAR_SEED.to_string()),
            color: palette_color(&profile.id).to_string(),
            unread_count,
        }
    }

    async fn notify_list_changed(&self, friends: &[Friend]) {
        match serde_json::to_string(friends) {
            Ok(json) => self.listener.on_friend_list_changed(json).await,
            Err(e) => warn!("[FriendService] 序列化好友列表失败: {}", e),
        }
    }

    /// 每个好友发给我的未读消息数
    pub async fn unread_counts(&self, me: &str) -> Result<HashMap<String, usize>> {
        let senders = self
            .messages
            .select_unread_senders(me)
            .await
            .context("查询未读数失败")?;
        let mut counts = HashMap::new();
        for sender in senders {
            *counts.entry(sender).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// 拉取好友列表（按建立关系的顺序）
    pub async fn fetch_friends(&self, me: &str) -> Result<Vec<Friend>> {
        let relations = self
            .friendships
            .fetch_friendships(me)
            .await
            .context("拉取好友关系失败")?;

        let mut seen = HashSet::new();
        let friend_ids: Vec<String> = relations
            .iter()
            .map(|r| r.other(me).to_string())
            .filter(|id| id != me && seen.insert(id.clone()))
            .collect();
        if friend_ids.is_empty() {
            info!("[FriendService] 好友列表为空, user={}", me);
            self.notify_list_changed(&[]).await;
            return Ok(Vec::new());
        }

        let profiles = self
            .profiles
            .fetch_profiles(&friend_ids)
            .await
            .context("拉取好友资料失败")?;
        let by_id: HashMap<&str, &Profile> = profiles.iter().map(|p| (p.id.as_str(), p)).collect();

        // 未读数失败不影响好友列表
        let unread = match self.unread_counts(me).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("[FriendService] ⚠️ 未读数拉取失败: {:#}", e);
                HashMap::new()
            }
        };

        let friends: Vec<Friend> = friend_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()))
            .map(|p| Self::present(p, unread.get(&p.id).copied().unwrap_or(0)))
            .collect();

        info!(
            "[FriendService] ✅ 好友列表: {} 个, 未读 {} 条",
            friends.len(),
            friends.iter().map(|f| f.unread_count).sum::<usize>()
        );
        self.notify_list_changed(&friends).await;
        Ok(friends)
    }

    /// 重新计算未读数，返回是否有变化
    pub async fn refresh_unread_counts(&self, me: &str, friends: &mut [Friend]) -> Result<bool> {
        let unread = self.unread_counts(me).await?;
        let mut changed = false;
        for friend in friends.iter_mut() {
            let count = unread.get(&friend.id).copied().unwrap_or(0);
            if friend.unread_count != count {
                friend.unread_count = count;
                changed = true;
                self.listener
                    .on_unread_count_changed(friend.id.clone(), count)
                    .await;
            }
        }
        Ok(changed)
    }

    /// 添加好友（已存在时不重复添加），返回是否新建了关系
    pub async fn add_friend(&self, me: &str, friend_id: &str) -> Result<bool> {
        if me == friend_id {
            return Err(VibeError::CannotAddYourself.into());
        }
        if self.friendships.friendship_exists(me, friend_id).await? {
            debug!("[FriendService] 已是好友: {} ↔ {}", me, friend_id);
            return Ok(false);
        }
        self.friendships
            .insert_friendship(me, friend_id)
            .await
            .context("添加好友失败")?;
        info!("[FriendService] ➕ 添加好友: {} → {}", me, friend_id);
        Ok(true)
    }

    /// 通过邀请码（或用户名）添加好友
    pub async fn connect_by_code(&self, me: &str, code: &str) -> Result<Friend> {
        let username = parse_invite_code(code)
            .ok_or_else(|| VibeError::UserNotFound(code.trim().to_string()))?;
        let matches = self
            .profiles
            .find_profiles_by_username(&username, UsernameMatch::Exact, 1)
            .await
            .context("按邀请码查找用户失败")?;
        let profile = matches
            .into_iter()
            .next()
            .ok_or_else(|| VibeError::UserNotFound(username.clone()))?;
        if profile.id == me {
            return Err(VibeError::CannotAddYourself.into());
        }

        self.add_friend(me, &profile.id).await?;
        let unread = self.unread_counts(me).await.unwrap_or_default();
        Ok(Self::present(&profile, unread.get(&profile.id).copied().unwrap_or(0)))
    }

    /// 按用户名搜索（不区分大小写的子串匹配，排除自己）
    pub async fn search_profiles(&self, me: &str, query: &str) -> Result<Vec<Profile>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let found = self
            .profiles
            .find_profiles_by_username(query, UsernameMatch::Contains, SEARCH_LIMIT + 1)
            .await
            .context("搜索用户失败")?;
        Ok(found
            .into_iter()
            .filter(|p| p.id != me)
            .take(SEARCH_LIMIT)
            .collect())
    }

    /// 清空与某好友的聊天记录（好友关系保留）
    pub async fn clear_conversation(&self, me: &str, friend_id: &str) -> Result<u64> {
        let deleted = self
            .messages
            .delete_conversation(&ConversationPair::new(me, friend_id))
            .await
            .context("清空聊天记录失败")?;
        info!("[FriendService] 🧹 清空聊天记录: {} 条, friend={}", deleted, friend_id);
        Ok(deleted)
    }

    /// 删除好友：聊天记录与好友关系一并删除
    pub async fn remove_friend(&self, me: &str, friend_id: &str) -> Result<()> {
        self.clear_conversation(me, friend_id).await?;
        self.friendships
            .delete_friendship(me, friend_id)
            .await
            .context("删除好友关系失败")?;
        info!("[FriendService] ➖ 删除好友: {}", friend_id);
        Ok(())
    }

    /// 删除与自己相关的全部消息与好友关系
    pub async fn clear_all_data(&self, me: &str) -> Result<()> {
        let messages = self
            .messages
            .delete_messages_for_user(me)
            .await
            .context("删除全部消息失败")?;
        let relations = self
            .friendships
            .delete_friendships_for_user(me)
            .await
            .context("删除全部好友关系失败")?;
        info!(
            "[FriendService] 🗑️ 已清空全部数据: 消息 {} 条, 好友关系 {} 条",
            messages, relations
        );
        self.notify_list_changed(&[]).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::models::NewMessage;
    use crate::im::message::types::DeliveryStatus;
    use crate::im::serialization::from_millis;
    use crate::im::store::SqliteRecordStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        lists: Mutex<Vec<String>>,
        unread: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait::async_trait]
    impl FriendListener for RecordingListener {
        async fn on_friend_list_changed(&self, friends_json: String) {
            self.lists.lock().unwrap().push(friends_json);
        }
        async fn on_unread_count_changed(&self, friend_id: String, unread_count: usize) {
            self.unread.lock().unwrap().push((friend_id, unread_count));
        }
    }

    async fn setup() -> (Arc<SqliteRecordStore>, FriendService, Arc<RecordingListener>) {
        let store = Arc::new(SqliteRecordStore::in_memory().await.unwrap());
        for (id, name) in [("me", "ME_ME"), ("bob", "BOBBY"), ("cat", "CATNIP"), ("dan", "DANNY")] {
            store
                .upsert_profile(&Profile {
                    id: id.into(),
                    username: Some(name.into()),
                    avatar_seed: None,
                    bg_color: None,
                })
                .await
                .unwrap();
        }
        let listener = Arc::new(RecordingListener::default());
        let service = FriendService::with_listener(
            store.clone(),
            store.clone(),
            store.clone(),
            listener.clone(),
        );
        (store, service, listener)
    }

    async fn send(store: &SqliteRecordStore, from: &str, to: &str) {
        store
            .insert_message(&NewMessage {
                sender_id: from.into(),
                receiver_id: to.into(),
                payload: "hi".into(),
                status: DeliveryStatus::Sent,
                sent_at: from_millis(1),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn friends_come_from_either_direction_with_unread_counts() {
        let (store, service, listener) = setup().await;
        assert!(service.add_friend("me", "bob").await.unwrap());
        store.insert_friendship("cat", "me").await.unwrap();
        // 重复添加（任一方向）不新建
        assert!(!service.add_friend("me", "cat").await.unwrap());

        send(&store, "bob", "me").await;
        send(&store, "bob", "me").await;
        send(&store, "me", "bob").await;

        let friends = service.fetch_friends("me").await.unwrap();
        let ids: Vec<&str> = friends.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["bob", "cat"]);
        assert_eq!(friends[0].unread_count, 2);
        assert_eq!(friends[1].unread_count, 0);
        assert_eq!(friends[0].name, "BOBBY");
        assert_eq!(friends[0].avatar_seed, DEFAULT_AVATAR_SEED);
        assert_eq!(friends[0].color, palette_color("bob"));
        assert_eq!(listener.lists.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unread_counts_refresh_after_read() {
        let (store, service, listener) = setup().await;
        service.add_friend("me", "bob").await.unwrap();
        send(&store, "bob", "me").await;
        let mut friends = service.fetch_friends("me").await.unwrap();
        assert_eq!(friends[0].unread_count, 1);

        store.mark_read("me", "bob").await.unwrap();
        assert!(service.refresh_unread_counts("me", &mut friends).await.unwrap());
        assert_eq!(friends[0].unread_count, 0);
        assert!(!service.refresh_unread_counts("me", &mut friends).await.unwrap());
        assert_eq!(
            listener.unread.lock().unwrap().as_slice(),
            &[("bob".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn connect_by_code_validates_target() {
        let (_store, service, _) = setup().await;
        let friend = service.connect_by_code("me", "vb-bobby").await.unwrap();
        assert_eq!(friend.id, "bob");

        let err = service.connect_by_code("me", "VB-ME_ME").await.unwrap_err();
        assert_eq!(err.downcast_ref::<VibeError>(), Some(&VibeError::CannotAddYourself));

        let err = service.connect_by_code("me", "VB-GHOST").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<VibeError>(),
            Some(&VibeError::UserNotFound("GHOST".to_string()))
        );

        let err = service.add_friend("me", "me").await.unwrap_err();
        assert_eq!(err.downcast_ref::<VibeError>(), Some(&VibeError::CannotAddYourself));
    }

    #[tokio::test]
    async fn search_excludes_self() {
        let (_store, service, _) = setup().await;
        let found = service.search_profiles("me", "m").await.unwrap();
        assert!(found.iter().all(|p| p.id != "me"));
        let found = service.search_profiles("me", "  nn ").await.unwrap();
        let ids: Vec<&str> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["dan"]);
        assert!(service.search_profiles("me", "   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_and_clear_are_scoped() {
        let (store, service, _) = setup().await;
        service.add_friend("me", "bob").await.unwrap();
        service.add_friend("me", "cat").await.unwrap();
        service.add_friend("bob", "dan").await.unwrap();
        send(&store, "me", "bob").await;
        send(&store, "cat", "me").await;
        send(&store, "bob", "dan").await;

        assert_eq!(service.clear_conversation("me", "cat").await.unwrap(), 1);
        service.remove_friend("me", "bob").await.unwrap();
        let friends = service.fetch_friends("me").await.unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].id, "cat");

        service.clear_all_data("me").await.unwrap();
        assert!(service.fetch_friends("me").await.unwrap().is_empty());
        // 其他人的数据不受影响
        assert_eq!(service.fetch_friends("bob").await.unwrap().len(), 1);
        assert_eq!(
            store
                .select_conversation(&ConversationPair::new("bob", "dan"))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
