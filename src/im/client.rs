//! ViBeBiTeS 客户端核心
//!
//! 持有配置、记录存储、生成器与应用状态（会话、资料、好友列表），
//! 对外暴露用户主动发起的操作：登录注册、打开会话、发送、猜题、改资料、管理好友。

use crate::im::auth::{AuthClient, Session};
use crate::im::compose::{self, ComposeDraft};
use crate::im::conversation::{
    ConversationConfig, ConversationListener, ConversationSession, EmptyConversationListener,
    DEFAULT_POLL_INTERVAL, DEFAULT_READ_RECEIPT_DELAY,
};
use crate::im::errors::VibeError;
use crate::im::friend::{invite_code, EmptyFriendListener, Friend, FriendListener, FriendService};
use crate::im::message::models::MessageRow;
use crate::im::profile::{
    generate_random_username, Profile, ProfileService, ProfileState, RetryPolicy, RESTORED_BG_COLOR,
};
use crate::im::scoring::{grade_guess, GuessOutcome, DEFAULT_PASS_THRESHOLD};
use crate::im::store::{
    ConversationPair, FriendshipRecordStore, InsertFilter, MessageRecordStore, ProfileRecordStore,
    RealtimeFeed, RecordStore, RestRecordStore, SqliteRecordStore,
};
use crate::im::vibe::{
    analyze_or_fallback, GeminiVibeGenerator, StaticVibeGenerator, VibeAnalysis, VibeGenerator,
    DEFAULT_GENERATOR_BASE_URL, DEFAULT_GENERATOR_MODEL,
};
use anyhow::{Context, Result};
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 托管后端地址（REST、认证接口的公共前缀）
    pub base_url: String,
    /// 匿名 key（`apikey` 头）
    pub anon_key: String,
    /// 实时推送 WebSocket 地址
    pub realtime_url: String,
    /// 生成器 API key，为空时使用固定结果
    pub generator_api_key: Option<String>,
    pub generator_model: String,
    pub generator_base_url: String,
    /// 本地模式使用的 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://vibebites.db?mode=rwc`
    pub db_url: String,
    pub poll_interval: Duration,
    pub read_receipt_delay: Duration,
    pub pass_threshold: u8,
    pub profile_retry: RetryPolicy,
    /// 是否订阅实时推送
    pub realtime: bool,
}

impl ClientConfig {
    /// 创建默认配置（本机开发环境）
    pub fn new() -> Self {
        Self::with_backend("http://localhost:54321", "")
    }

    /// 指定后端地址，实时推送地址由其推导
    pub fn with_backend(base_url: &str, anon_key: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            realtime_url: realtime_url_for(&base_url),
            base_url,
            anon_key: anon_key.to_string(),
            generator_api_key: None,
            generator_model: DEFAULT_GENERATOR_MODEL.to_string(),
            generator_base_url: DEFAULT_GENERATOR_BASE_URL.to_string(),
            db_url: "sqlite://vibebites.db?mode=rwc".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_receipt_delay: DEFAULT_READ_RECEIPT_DELAY,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            profile_retry: RetryPolicy::default(),
            realtime: true,
        }
    }

    pub fn conversation_config(&self) -> ConversationConfig {
        ConversationConfig {
            poll_interval: self.poll_interval,
            read_receipt_delay: self.read_receipt_delay,
            pass_threshold: self.pass_threshold,
            realtime: self.realtime,
        }
    }

    /// 有 API key 时使用 Gemini，否则使用固定结果
    pub fn build_generator(&self) -> Arc<dyn VibeGenerator> {
        match self.generator_api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Arc::new(GeminiVibeGenerator::new(
                key,
                self.generator_model.clone(),
                self.generator_base_url.clone(),
            )),
            None => {
                warn!("[Client] 未配置生成器 API key，使用默认表情");
                Arc::new(StaticVibeGenerator::default())
            }
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// `http(s)://host` → `ws(s)://host/realtime/v1`
pub fn realtime_url_for(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/realtime/v1", ws)
}

/// 登录后填充、登出时清空的应用状态
#[derive(Debug, Clone, Default)]
pub struct AppState {
    pub session: Option<Session>,
    pub profile: Option<ProfileState>,
    pub friends: Vec<Friend>,
}

impl AppState {
    pub fn username(&self) -> Option<&str> {
        self.profile.as_ref().and_then(|p| p.username())
    }

    fn friend_mut(&mut self, friend_id: &str) -> Option<&mut Friend> {
        self.friends.iter_mut().find(|f| f.id == friend_id)
    }

    fn profile_mut(&mut self) -> Option<&mut Profile> {
        match self.profile.as_mut()? {
            ProfileState::Ready(p) | ProfileState::Restored(p) => Some(p),
            ProfileState::Degraded { .. } => None,
        }
    }
}

/// 按当前好友列表重新计算未读数，只回写计数
async fn sync_unread_counts(friend_service: &FriendService, state: &RwLock<AppState>) -> Result<bool> {
    let (me, mut friends) = {
        let state = state.read().await;
        let me = state
            .session
            .as_ref()
            .map(|s| s.user_id.clone())
            .ok_or(VibeError::NotSignedIn)?;
        (me, state.friends.clone())
    };
    let changed = friend_service
        .refresh_unread_counts(&me, &mut friends)
        .await?;
    if changed {
        let mut state = state.write().await;
        for fresh in friends {
            if let Some(friend) = state.friend_mut(&fresh.id) {
                friend.unread_count = fresh.unread_count;
            }
        }
    }
    Ok(changed)
}

/// 注册时确定用户名
///
/// 手动输入的用户名转为大写，已被占用直接报错；
/// 留空则随机生成，被占用时再生成一次，仍冲突则报错。
pub async fn choose_username(profiles: &ProfileService, typed: &str) -> Result<String> {
    let typed = typed.trim().to_uppercase();
    if !typed.is_empty() {
        if !profiles.check_username_available(&typed).await {
            return Err(VibeError::UsernameTaken(typed).into());
        }
        return Ok(typed);
    }

    for _ in 0..2 {
        let candidate = generate_random_username();
        if profiles.check_username_available(&candidate).await {
            return Ok(candidate);
        }
        warn!("[Client] 随机用户名已被占用: {}", candidate);
    }
    Err(VibeError::UsernameGenerationFailed.into())
}

/// ViBeBiTeS 客户端
pub struct VibeClient {
    config: ClientConfig,
    messages: Arc<dyn MessageRecordStore>,
    profiles: Arc<dyn ProfileRecordStore>,
    friendships: Arc<dyn FriendshipRecordStore>,
    generator: Arc<dyn VibeGenerator>,
    auth: Option<AuthClient>,
    friend_service: Arc<FriendService>,
    profile_service: ProfileService,
    friend_listener: Arc<dyn FriendListener>,
    conversation_listener: Arc<dyn ConversationListener>,
    state: Arc<RwLock<AppState>>,
    /// 登录期间监听发给我的新消息，更新好友未读数
    unread_watch: Mutex<Option<JoinHandle<()>>>,
}

impl VibeClient {
    /// 使用给定的记录存储与生成器创建客户端
    pub fn new<S>(config: ClientConfig, store: Arc<S>, generator: Arc<dyn VibeGenerator>) -> Self
    where
        S: RecordStore + 'static,
    {
        let messages: Arc<dyn MessageRecordStore> = store.clone();
        let profiles: Arc<dyn ProfileRecordStore> = store.clone();
        let friendships: Arc<dyn FriendshipRecordStore> = store;
        let friend_listener: Arc<dyn FriendListener> = Arc::new(EmptyFriendListener);
        Self {
            friend_service: Arc::new(FriendService::with_listener(
                messages.clone(),
                profiles.clone(),
                friendships.clone(),
                friend_listener.clone(),
            )),
            profile_service: ProfileService::with_retry(profiles.clone(), config.profile_retry),
            config,
            messages,
            profiles,
            friendships,
            generator,
            auth: None,
            friend_listener,
            conversation_listener: Arc::new(EmptyConversationListener),
            state: Arc::new(RwLock::new(AppState::default())),
            unread_watch: Mutex::new(None),
        }
    }

    /// 注册好友监听器
    pub fn with_friend_listener(mut self, listener: Arc<dyn FriendListener>) -> Self {
        self.friend_service = Arc::new(FriendService::with_listener(
            self.messages.clone(),
            self.profiles.clone(),
            self.friendships.clone(),
            listener.clone(),
        ));
        self.friend_listener = listener;
        self
    }

    /// 注册会话监听器（之后打开的会话生效）
    pub fn with_conversation_listener(mut self, listener: Arc<dyn ConversationListener>) -> Self {
        self.conversation_listener = listener;
        self
    }

    pub fn with_auth(mut self, auth: AuthClient) -> Self {
        self.auth = Some(auth);
        self
    }

    /// 本地模式：SQLite 记录存储
    pub async fn connect_local(config: ClientConfig) -> Result<Self> {
        let store = Arc::new(SqliteRecordStore::connect(&config.db_url).await?);
        let generator = config.build_generator();
        info!("[Client] 🗄️ 本地模式: {}", config.db_url);
        Ok(Self::new(config, store, generator))
    }

    /// 远端模式：以会话令牌访问 REST 数据接口，并订阅实时推送
    pub async fn connect_rest(config: ClientConfig, session: &Session) -> Result<Self> {
        let token = if session.access_token.is_empty() {
            config.anon_key.as_str()
        } else {
            session.access_token.as_str()
        };
        let mut store = RestRecordStore::new(&config.base_url, &config.anon_key, token)?;
        if config.realtime {
            store = store.with_realtime(RealtimeFeed::new(
                config.realtime_url.clone(),
                config.anon_key.clone(),
                token.to_string(),
            ));
        }
        let auth = AuthClient::new(&config.base_url, &config.anon_key)?;
        let generator = config.build_generator();
        info!("[Client] 🌐 远端模式: {}", config.base_url);
        Ok(Self::new(config, Arc::new(store), generator).with_auth(auth))
    }

    /// 邮箱密码登录并加载资料与好友
    pub async fn sign_in(config: ClientConfig, email: &str, password: &str) -> Result<Self> {
        let auth = AuthClient::new(&config.base_url, &config.anon_key)?;
        let session = auth.sign_in_with_password(email, password).await?;
        let client = Self::connect_rest(config, &session).await?;
        client.on_signed_in(session).await;
        Ok(client)
    }

    /// 注册账号，返回新会话
    ///
    /// 资料行写入失败不影响注册结果，登录时的资料自愈会补齐。
    pub async fn register(
        config: &ClientConfig,
        email: &str,
        password: &str,
        typed_username: &str,
    ) -> Result<Session> {
        let anon = Arc::new(RestRecordStore::new(
            &config.base_url,
            &config.anon_key,
            &config.anon_key,
        )?);
        let username = choose_username(&ProfileService::new(anon.clone()), typed_username).await?;

        let auth = AuthClient::new(&config.base_url, &config.anon_key)?;
        let session = auth.sign_up(email, password, &username).await?;

        let store = if session.access_token.is_empty() {
            anon
        } else {
            Arc::new(RestRecordStore::new(
                &config.base_url,
                &config.anon_key,
                &session.access_token,
            )?)
        };
        let profile = Profile {
            id: session.user_id.clone(),
            username: Some(username),
            avatar_seed: Some(format!("player_{}", rand::thread_rng().gen_range(0..10000))),
            bg_color: Some(RESTORED_BG_COLOR.to_string()),
        };
        if let Err(e) = store.upsert_profile(&profile).await {
            error!("[Client] ❌ 注册后写入资料失败（登录时自愈）: {:#}", e);
        }
        Ok(session)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 当前应用状态快照
    pub async fn state(&self) -> AppState {
        self.state.read().await.clone()
    }

    async fn me(&self) -> Result<String> {
        self.state
            .read()
            .await
            .session
            .as_ref()
            .map(|s| s.user_id.clone())
            .ok_or_else(|| VibeError::NotSignedIn.into())
    }

    async fn session(&self) -> Result<Session> {
        self.state
            .read()
            .await
            .session
            .clone()
            .ok_or_else(|| VibeError::NotSignedIn.into())
    }

    /// 登录后：带重试加载资料，拉取好友列表
    pub async fn on_signed_in(&self, session: Session) -> AppState {
        let user_id = session.user_id.clone();
        let profile = self
            .profile_service
            .fetch_profile_with_retry(&user_id, Some(&session))
            .await;
        let friends = match self.friend_service.fetch_friends(&user_id).await {
            Ok(friends) => friends,
            Err(e) => {
                warn!("[Client] ⚠️ 拉取好友列表失败: {:#}", e);
                Vec::new()
            }
        };

        let snapshot = {
            let mut state = self.state.write().await;
            *state = AppState {
                session: Some(session),
                profile: Some(profile),
                friends,
            };
            info!(
                "[Client] ✅ 已登录: user={}, username={:?}, 好友 {} 个",
                user_id,
                state.username(),
                state.friends.len()
            );
            state.clone()
        };
        self.start_unread_watch(user_id).await;
        snapshot
    }

    /// 订阅发给我的新消息，每到一条就重算好友未读数
    async fn start_unread_watch(&self, me: String) {
        self.stop_unread_watch();
        let filter = InsertFilter::eq("receiver_id", me.clone());
        let mut subscription = match self.messages.subscribe_inserts(Some(filter)).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("[Client] ⚠️ 订阅新消息失败，未读数仅在拉取时更新: {:#}", e);
                return;
            }
        };
        let friend_service = self.friend_service.clone();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            while let Some(row) = subscription.recv().await {
                debug!("[Client] 📨 新消息: {} → {}", row.sender_id, me);
                if let Err(e) = sync_unread_counts(&friend_service, &state).await {
                    debug!("[Client] 未读数更新失败: {:#}", e);
                }
            }
            debug!("[Client] 新消息订阅结束");
        });
        *self.unread_watch.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn stop_unread_watch(&self) {
        let task = self
            .unread_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// 登出并清空状态
    pub async fn sign_out(&self) {
        self.stop_unread_watch();
        let session = std::mem::take(&mut *self.state.write().await).session;
        if let (Some(auth), Some(session)) = (&self.auth, session) {
            if !session.access_token.is_empty() {
                if let Err(e) = auth.sign_out(&session).await {
                    warn!("[Client] ⚠️ 登出请求失败: {:#}", e);
                }
            }
        }
        info!("[Client] 👋 已登出");
    }

    /// 重新拉取好友列表
    pub async fn refresh_friends(&self) -> Result<Vec<Friend>> {
        let me = self.me().await?;
        let friends = self.friend_service.fetch_friends(&me).await?;
        self.state.write().await.friends = friends.clone();
        Ok(friends)
    }

    /// 重新计算未读数
    pub async fn refresh_unread_counts(&self) -> Result<bool> {
        sync_unread_counts(&self.friend_service, &self.state).await
    }

    /// 打开与好友的会话
    ///
    /// 本地立即清零未读数，远端标记已读（失败只记录日志），返回实时会话。
    pub async fn open_conversation(&self, friend_id: &str) -> Result<ConversationSession> {
        let me = self.me().await?;
        let cleared = {
            let mut state = self.state.write().await;
            match state.friend_mut(friend_id) {
                Some(friend) if friend.unread_count > 0 => {
                    friend.unread_count = 0;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            self.friend_listener
                .on_unread_count_changed(friend_id.to_string(), 0)
                .await;
        }
        if let Err(e) = self.messages.mark_read(&me, friend_id).await {
            warn!("[Client] ⚠️ 标记已读失败: {:#}", e);
        }

        Ok(ConversationSession::open_with_listener(
            ConversationPair::new(me, friend_id),
            self.config.conversation_config(),
            self.messages.clone(),
            self.generator.clone(),
            self.conversation_listener.clone(),
        )
        .await)
    }

    /// 生成表情预览（发送时可沿用）
    pub async fn preview_vibe(&self, text: &str) -> Result<VibeAnalysis> {
        let draft = ComposeDraft::new(text)?;
        Ok(analyze_or_fallback(self.generator.as_ref(), draft.text()).await)
    }

    /// 编辑页发送
    pub async fn compose_and_send(
        &self,
        friend_id: &str,
        text: &str,
        preview: Option<VibeAnalysis>,
    ) -> Result<MessageRow> {
        let me = self.me().await?;
        let draft = ComposeDraft::new(text)?;
        compose::compose_and_send(
            self.messages.as_ref(),
            self.generator.as_ref(),
            &me,
            friend_id,
            &draft,
            preview,
        )
        .await
    }

    pub fn grade_guess(&self, guess: &str, target: &str) -> GuessOutcome {
        grade_guess(guess, target, self.config.pass_threshold)
    }

    /// 修改用户名：先更新本地状态，失败回滚
    pub async fn update_username(&self, username: &str) -> Result<String> {
        let me = self.me().await?;
        let trimmed = username.trim().to_string();
        if trimmed.is_empty() {
            return Err(VibeError::EmptyUsername.into());
        }

        let previous = {
            let mut state = self.state.write().await;
            state
                .profile_mut()
                .map(|p| std::mem::replace(&mut p.username, Some(trimmed.clone())))
        };

        match self.profile_service.update_username(&me, &trimmed).await {
            Ok(saved) => {
                if let Some(auth) = &self.auth {
                    let session = self.session().await?;
                    if let Err(e) = auth.update_username_metadata(&session, &saved).await {
                        warn!("[Client] ⚠️ 同步用户名元数据失败: {:#}", e);
                    }
                }
                Ok(saved)
            }
            Err(e) => {
                if let Some(previous) = previous {
                    if let Some(profile) = self.state.write().await.profile_mut() {
                        profile.username = previous;
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn update_avatar(&self, avatar_seed: &str, bg_color: &str) -> Result<()> {
        let me = self.me().await?;
        self.profile_service
            .update_avatar(&me, avatar_seed, bg_color)
            .await?;
        if let Some(profile) = self.state.write().await.profile_mut() {
            profile.avatar_seed = Some(avatar_seed.to_string());
            profile.bg_color = Some(bg_color.to_string());
        }
        Ok(())
    }

    pub async fn update_password(&self, password: &str, confirm: &str) -> Result<()> {
        let session = self.session().await?;
        let auth = self
            .auth
            .as_ref()
            .ok_or_else(|| VibeError::Auth("本地模式不支持修改密码".to_string()))?;
        auth.update_password(&session, password, confirm).await
    }

    /// 我的邀请码
    pub async fn invite_code(&self) -> Option<String> {
        self.state.read().await.username().map(invite_code)
    }

    pub async fn search_profiles(&self, query: &str) -> Result<Vec<Profile>> {
        let me = self.me().await?;
        self.friend_service.search_profiles(&me, query).await
    }

    /// 通过邀请码（或用户名）添加好友，并刷新好友列表
    pub async fn add_friend(&self, code: &str) -> Result<Friend> {
        let me = self.me().await?;
        let friend = self.friend_service.connect_by_code(&me, code).await?;
        if let Err(e) = self.refresh_friends().await {
            warn!("[Client] ⚠️ 刷新好友列表失败: {:#}", e);
        }
        Ok(friend)
    }

    /// 按用户 ID 添加好友（搜索结果）
    pub async fn add_friend_by_id(&self, friend_id: &str) -> Result<bool> {
        let me = self.me().await?;
        let created = self.friend_service.add_friend(&me, friend_id).await?;
        if let Err(e) = self.refresh_friends().await {
            warn!("[Client] ⚠️ 刷新好友列表失败: {:#}", e);
        }
        Ok(created)
    }

    pub async fn remove_friend(&self, friend_id: &str) -> Result<()> {
        let me = self.me().await?;
        self.friend_service.remove_friend(&me, friend_id).await?;
        self.state.write().await.friends.retain(|f| f.id != friend_id);
        Ok(())
    }

    pub async fn clear_conversation(&self, friend_id: &str) -> Result<u64> {
        let me = self.me().await?;
        let deleted = self
            .friend_service
            .clear_conversation(&me, friend_id)
            .await?;
        if let Some(friend) = self.state.write().await.friend_mut(friend_id) {
            friend.unread_count = 0;
        }
        Ok(deleted)
    }

    /// 删除自己的全部消息与好友关系（账号与资料保留）
    pub async fn clear_all_data(&self) -> Result<()> {
        let me = self.me().await?;
        self.friend_service
            .clear_all_data(&me)
            .await
            .context("清空全部数据失败")?;
        self.state.write().await.friends.clear();
        Ok(())
    }
}

impl Drop for VibeClient {
    fn drop(&mut self) {
        self.stop_unread_watch();
    }
}
