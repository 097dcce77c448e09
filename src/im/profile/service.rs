//! 用户资料服务
//!
//! 注册后资料行可能稍晚才可读（复制延迟），因此登录后的资料拉取带有限次重试；
//! 资料缺失用户名时按会话信息自愈补全，重试用尽则降级而不是报错。

use crate::im::auth::Session;
use crate::im::errors::{friendly_store_message, VibeError};
use crate::im::profile::models::{Profile, ProfileState, RESTORED_BG_COLOR};
use crate::im::store::{ProfileRecordStore, UsernameMatch};
use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 随机用户名字符集（去掉了易混淆的 I、O、0、1）
pub const USERNAME_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const USERNAME_PREFIX: &str = "PLAYER_";

/// 资料拉取重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// 生成 `PLAYER_XXXX` 形式的随机用户名
pub fn generate_random_username() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| USERNAME_ALPHABET[rng.gen_range(0..USERNAME_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", USERNAME_PREFIX, suffix)
}

/// 自愈时使用的用户名：会话元数据中的用户名，否则 `PLAYER_` + ID 前 4 位大写
pub fn recovery_username(user_id: &str, session: &Session) -> String {
    session
        .username
        .clone()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| {
            let head: String = user_id.chars().take(4).collect();
            format!("{}{}", USERNAME_PREFIX, head.to_uppercase())
        })
}

/// 资料服务
pub struct ProfileService {
    store: Arc<dyn ProfileRecordStore>,
    retry: RetryPolicy,
}

impl ProfileService {
    pub fn new(store: Arc<dyn ProfileRecordStore>) -> Self {
        Self::with_retry(store, RetryPolicy::default())
    }

    pub fn with_retry(store: Arc<dyn ProfileRecordStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// 单次拉取；资料完整返回 Ready，自愈成功返回 Restored，否则返回 None 以便重试
    async fn fetch_once(&self, user_id: &str, session: Option<&Session>) -> Result<Option<ProfileState>> {
        if let Some(profile) = self.store.fetch_profile(user_id).await? {
            if profile.has_username() {
                return Ok(Some(ProfileState::Ready(profile)));
            }
        }

        warn!("[ProfileService] ⚠️ 资料缺失或不完整，尝试自愈: user={}", user_id);
        // 只为当前登录用户自愈
        let session = match session {
            Some(s) if s.user_id == user_id => s,
            _ => return Ok(None),
        };
        let restored = Profile {
            id: user_id.to_string(),
            username: Some(recovery_username(user_id, session)),
            avatar_seed: Some(format!("restored_{}", rand::thread_rng().gen_range(0..1000))),
            bg_color: Some(RESTORED_BG_COLOR.to_string()),
        };
        self.store.upsert_profile(&restored).await?;
        info!(
            "[ProfileService] 🩹 资料已自愈: user={}, username={:?}",
            user_id, restored.username
        );
        Ok(Some(ProfileState::Restored(restored)))
    }

    /// 带重试的资料拉取，重试用尽返回降级状态
    pub async fn fetch_profile_with_retry(&self, user_id: &str, session: Option<&Session>) -> ProfileState {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.fetch_once(user_id, session).await {
                Ok(Some(state)) => return state,
                Ok(None) => debug!("[ProfileService] 第 {}/{} 次未取到资料", attempt, attempts),
                Err(e) => error!(
                    "[ProfileService] ❌ 第 {}/{} 次拉取资料失败: {:#}",
                    attempt, attempts, e
                ),
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.delay).await;
            }
        }
        warn!("[ProfileService] ⚠️ 资料拉取重试用尽，降级运行: user={}", user_id);
        ProfileState::Degraded {
            user_id: user_id.to_string(),
        }
    }

    /// 修改用户名，返回保存后的用户名
    ///
    /// 存储层的约束错误转换为用户可读的提示（`VibeError::Store`）。
    pub async fn update_username(&self, user_id: &str, username: &str) -> Result<String> {
        let username = username.trim();
        if username.is_empty() {
            return Err(VibeError::EmptyUsername.into());
        }
        if let Err(e) = self.store.update_username(user_id, username).await {
            let message = friendly_store_message(&e);
            warn!("[ProfileService] 修改用户名失败: {}", message);
            return Err(VibeError::Store {
                code: "username".to_string(),
                message,
            }
            .into());
        }
        info!("[ProfileService] ✏️ 用户名已更新: {}", username);
        Ok(username.to_string())
    }

    pub async fn update_avatar(&self, user_id: &str, avatar_seed: &str, bg_color: &str) -> Result<()> {
        self.store.update_avatar(user_id, avatar_seed, bg_color).await?;
        info!("[ProfileService] 🎨 头像已更新: seed={}, color={}", avatar_seed, bg_color);
        Ok(())
    }

    /// 用户名是否可用（不区分大小写）；查询出错视为不可用
    pub async fn check_username_available(&self, username: &str) -> bool {
        match self
            .store
            .find_profiles_by_username(username, UsernameMatch::Exact, 1)
            .await
        {
            Ok(found) => found.is_empty(),
            Err(e) => {
                warn!("[ProfileService] 用户名可用性检查失败，按不可用处理: {:#}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::errors::{USERNAME_LENGTH_MESSAGE, USERNAME_TAKEN_MESSAGE};
    use crate::im::store::SqliteRecordStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(5),
        }
    }

    fn profile(id: &str, username: Option<&str>) -> Profile {
        Profile {
            id: id.into(),
            username: username.map(Into::into),
            avatar_seed: None,
            bg_color: None,
        }
    }

    /// 前几次查询返回空，模拟复制延迟
    struct LaggingStore {
        inner: SqliteRecordStore,
        misses: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProfileRecordStore for LaggingStore {
        async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.misses.load(Ordering::SeqCst) > 0 {
                self.misses.fetch_sub(1, Ordering::SeqCst);
                return Ok(None);
            }
            self.inner.fetch_profile(user_id).await
        }
        async fn fetch_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>> {
            self.inner.fetch_profiles(user_ids).await
        }
        async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
            self.inner.upsert_profile(profile).await
        }
        async fn update_username(&self, user_id: &str, username: &str) -> Result<()> {
            self.inner.update_username(user_id, username).await
        }
        async fn update_avatar(&self, user_id: &str, avatar_seed: &str, bg_color: &str) -> Result<()> {
            self.inner.update_avatar(user_id, avatar_seed, bg_color).await
        }
        async fn find_profiles_by_username(
            &self,
            query: &str,
            mode: UsernameMatch,
            limit: usize,
        ) -> Result<Vec<Profile>> {
            if query == "BROKEN" {
                anyhow::bail!("connection reset");
            }
            self.inner.find_profiles_by_username(query, mode, limit).await
        }
    }

    async fn lagging(misses: u32) -> Arc<LaggingStore> {
        Arc::new(LaggingStore {
            inner: SqliteRecordStore::in_memory().await.unwrap(),
            misses: AtomicU32::new(misses),
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn retries_until_profile_appears() {
        let store = lagging(2).await;
        store.upsert_profile(&profile("u1", Some("NEO"))).await.unwrap();
        let service = ProfileService::with_retry(store.clone(), fast());

        // 不是当前会话用户，不自愈，只重试
        let state = service.fetch_profile_with_retry("u1", None).await;
        assert_eq!(state, ProfileState::Ready(profile("u1", Some("NEO"))));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn self_heals_for_current_user() {
        let store = lagging(0).await;
        let service = ProfileService::with_retry(store.clone(), fast());

        let session = Session::local("abcd1234", None);
        let state = service.fetch_profile_with_retry("abcd1234", Some(&session)).await;
        let restored = match state {
            ProfileState::Restored(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(restored.username.as_deref(), Some("PLAYER_ABCD"));
        assert_eq!(restored.bg_color.as_deref(), Some(RESTORED_BG_COLOR));
        assert!(restored.avatar_seed.unwrap().starts_with("restored_"));
        assert!(store.fetch_profile("abcd1234").await.unwrap().unwrap().has_username());

        // 元数据里的用户名优先
        let session = Session::local("zz99", Some("KITTY".into()));
        let state = service.fetch_profile_with_retry("zz99", Some(&session)).await;
        assert_eq!(state.username(), Some("KITTY"));
    }

    #[tokio::test]
    async fn degrades_after_exhausting_attempts() {
        let store = lagging(0).await;
        let service = ProfileService::with_retry(store.clone(), fast());
        let other = Session::local("someone-else", None);
        let state = service.fetch_profile_with_retry("u1", Some(&other)).await;
        assert_eq!(state, ProfileState::Degraded { user_id: "u1".into() });
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn username_updates_map_store_errors() {
        let store = lagging(0).await;
        store.upsert_profile(&profile("u1", Some("NEO"))).await.unwrap();
        store.upsert_profile(&profile("u2", Some("TRINITY"))).await.unwrap();
        let service = ProfileService::new(store.clone());

        assert_eq!(service.update_username("u1", "  MORPH ").await.unwrap(), "MORPH");

        let err = service.update_username("u1", "   ").await.unwrap_err();
        assert_eq!(err.downcast_ref::<VibeError>(), Some(&VibeError::EmptyUsername));

        let err = service.update_username("u1", "trinity").await.unwrap_err();
        assert_eq!(err.to_string(), format!("store error username: {}", USERNAME_TAKEN_MESSAGE));

        let err = service.update_username("u1", "AB").await.unwrap_err();
        assert!(err.to_string().ends_with(USERNAME_LENGTH_MESSAGE));
    }

    #[tokio::test]
    async fn availability_is_case_insensitive_and_pessimistic() {
        let store = lagging(0).await;
        store.upsert_profile(&profile("u1", Some("NEO"))).await.unwrap();
        let service = ProfileService::new(store);
        assert!(!service.check_username_available("neo").await);
        assert!(service.check_username_available("SMITH").await);
        assert!(!service.check_username_available("BROKEN").await);
    }

    #[test]
    fn random_usernames_use_unambiguous_alphabet() {
        for _ in 0..50 {
            let name = generate_random_username();
            let suffix = name.strip_prefix(USERNAME_PREFIX).unwrap();
            assert_eq!(suffix.len(), 4);
            assert!(suffix.bytes().all(|b| USERNAME_ALPHABET.contains(&b)));
        }
    }
}
