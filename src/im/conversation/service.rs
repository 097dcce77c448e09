//! 会话服务层
//!
//! `ConversationSession` 对应一个打开的聊天窗口：
//! - 打开时拉取一次历史，之后按固定间隔轮询（实时推送失效时的兜底）；
//! - 订阅发给我的插入事件，属于本会话的立即并入视图；
//! - 收到对方消息后延迟写已读回执；
//! - 发送走乐观路径：先出现在视图里，确认后替换，失败则保留并标记 FAILED。
//!
//! 视图由 `std::sync::Mutex` 保护，只在同步合并时短暂加锁，不跨 `.await`。
//! 后台任务在 `close()` 或 drop 时全部终止。

use crate::im::compose::ComposeDraft;
use crate::im::conversation::listener::{ConversationListener, EmptyConversationListener};
use crate::im::conversation::models::ConversationConfig;
use crate::im::errors::VibeError;
use crate::im::message::envelope::encode_payload;
use crate::im::message::models::{MessageRow, NewMessage};
use crate::im::message::types::{DeliveryStatus, MessageKind, VibeEnvelope, ENVELOPE_VERSION};
use crate::im::message::view::{ConversationView, InsertOutcome, LocalMessage};
use crate::im::scoring::{grade_guess, GuessOutcome};
use crate::im::store::{ConversationPair, InsertFilter, MessageRecordStore};
use crate::im::vibe::{VibeAnalysis, VibeGenerator};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 会话内共享状态（后台任务持有）
struct Shared {
    pair: ConversationPair,
    config: ConversationConfig,
    store: Arc<dyn MessageRecordStore>,
    generator: Arc<dyn VibeGenerator>,
    listener: Arc<dyn ConversationListener>,
    view: Mutex<ConversationView>,
    open: AtomicBool,
    read_trigger: Notify,
}

impl Shared {
    fn with_view<R>(&self, f: impl FnOnce(&mut ConversationView) -> R) -> R {
        let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut view)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn notify_changed(&self) {
        let snapshot = self.with_view(|v| v.snapshot());
        self.listener
            .on_messages_changed(self.pair.friend.clone(), snapshot)
            .await;
    }

    /// 拉取并合并，返回视图是否变化
    async fn refresh(&self) -> Result<bool> {
        let token = self.with_view(|v| v.fetch_token());
        let rows = self
            .store
            .select_conversation(&self.pair)
            .await
            .context("拉取会话消息失败")?;

        let (changed, unread) = self.with_view(|v| {
            let before = v.snapshot();
            v.merge_fetched_since(&rows, token);
            (v.entries() != before.as_slice(), v.unread_from_friend())
        });
        if changed {
            debug!(
                "[ConvSession] 🔄 视图已更新, friend={}, 共 {} 条",
                self.pair.friend,
                rows.len()
            );
            self.notify_changed().await;
        }
        if unread > 0 && self.is_open() {
            self.read_trigger.notify_one();
        }
        Ok(changed)
    }

    async fn handle_insert(&self, row: MessageRow) {
        match self.with_view(|v| v.apply_insert(&row)) {
            InsertOutcome::Accepted { from_remote } => {
                debug!("[ConvSession] 📨 推送消息并入视图: id={}", row.id);
                self.notify_changed().await;
                if from_remote {
                    self.listener
                        .on_scroll_to_latest(self.pair.friend.clone())
                        .await;
                    if self.is_open() {
                        self.read_trigger.notify_one();
                    }
                }
            }
            InsertOutcome::Duplicate => debug!("[ConvSession] 推送消息已存在: id={}", row.id),
            InsertOutcome::Ignored => {}
        }
    }

    async fn mark_read(&self) -> Result<u64> {
        let updated = self
            .store
            .mark_read(&self.pair.me, &self.pair.friend)
            .await
            .context("写入已读回执失败")?;
        let local = self.with_view(|v| v.mark_incoming_read());
        if local > 0 {
            self.notify_changed().await;
        }
        if updated > 0 {
            info!(
                "[ConvSession] ✅ 已读回执: {} 条, friend={}",
                updated, self.pair.friend
            );
            self.listener
                .on_messages_read(self.pair.friend.clone(), updated)
                .await;
        }
        Ok(updated)
    }
}

/// 插入一条待确认消息，成功后提交到视图，失败则标记 FAILED
///
/// 只持有视图的弱引用：会话已关闭时结果直接丢弃。
async fn deliver(
    store: Arc<dyn MessageRecordStore>,
    shared: Weak<Shared>,
    local_id: String,
    message: NewMessage,
) -> Result<MessageRow> {
    let result = store.insert_message(&message).await;

    let Some(shared) = shared.upgrade() else {
        debug!("[ConvSession] 会话已释放，丢弃发送结果: {}", local_id);
        return result;
    };
    if !shared.is_open() {
        // 已关闭但视图还在：只同步条目状态，不再通知监听器
        match &result {
            Ok(row) => {
                shared.with_view(|v| v.commit(&local_id, row));
            }
            Err(_) => {
                shared.with_view(|v| v.fail(&local_id));
            }
        }
        debug!("[ConvSession] 会话已关闭，发送结果仅写入视图: {}", local_id);
        return result;
    }

    match result {
        Ok(row) => {
            shared.with_view(|v| v.commit(&local_id, &row));
            info!("[ConvSession] ✅ 发送成功: {} → {}", local_id, row.id);
            shared.notify_changed().await;
            Ok(row)
        }
        Err(e) => {
            shared.with_view(|v| v.fail(&local_id));
            warn!("[ConvSession] ❌ 发送失败: {}: {:#}", local_id, e);
            shared.notify_changed().await;
            shared
                .listener
                .on_send_failed(shared.pair.friend.clone(), local_id, format!("{:#}", e))
                .await;
            Err(e)
        }
    }
}

fn envelope_for(entry: &LocalMessage) -> VibeEnvelope {
    VibeEnvelope {
        version: ENVELOPE_VERSION,
        text: entry.text.clone(),
        emojis: entry.emojis.clone(),
        topic: entry.topic.clone(),
        hint: entry.hint.clone(),
        difficulty: entry.difficulty,
        points: entry.points,
        status: DeliveryStatus::Sent,
        kind: MessageKind::IncomingUnsolved,
    }
}

fn new_message_for(entry: &LocalMessage) -> Result<NewMessage> {
    Ok(NewMessage {
        sender_id: entry.sender_id.clone(),
        receiver_id: entry.receiver_id.clone(),
        payload: encode_payload(&envelope_for(entry)).context("打包消息失败")?,
        status: DeliveryStatus::Sent,
        sent_at: entry.sent_at,
    })
}

/// 一个打开的会话
pub struct ConversationSession {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConversationSession {
    /// 打开会话（使用默认空监听器）
    pub async fn open(
        pair: ConversationPair,
        config: ConversationConfig,
        store: Arc<dyn MessageRecordStore>,
        generator: Arc<dyn VibeGenerator>,
    ) -> Self {
        Self::open_with_listener(pair, config, store, generator, Arc::new(EmptyConversationListener)).await
    }

    /// 打开会话：拉取历史，启动轮询、推送订阅与已读回执任务
    pub async fn open_with_listener(
        pair: ConversationPair,
        config: ConversationConfig,
        store: Arc<dyn MessageRecordStore>,
        generator: Arc<dyn VibeGenerator>,
        listener: Arc<dyn ConversationListener>,
    ) -> Self {
        info!(
            "[ConvSession] 💬 打开会话 {} ↔ {}, 轮询间隔 {:?}",
            pair.me, pair.friend, config.poll_interval
        );
        let view = ConversationView::new(pair.me.clone(), pair.friend.clone());
        let shared = Arc::new(Shared {
            pair,
            config,
            store,
            generator,
            listener,
            view: Mutex::new(view),
            open: AtomicBool::new(true),
            read_trigger: Notify::new(),
        });

        if let Err(e) = shared.refresh().await {
            warn!("[ConvSession] ⚠️ 首次拉取失败，等待轮询重试: {:#}", e);
        }

        let mut tasks = vec![
            Self::spawn_poller(shared.clone()),
            Self::spawn_read_receipts(shared.clone()),
        ];
        if shared.config.realtime {
            if let Some(task) = Self::spawn_push_listener(shared.clone()).await {
                tasks.push(task);
            }
        }

        Self {
            shared,
            tasks: Mutex::new(tasks),
        }
    }

    fn spawn_poller(shared: Arc<Shared>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(shared.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即完成；打开时已经拉取过
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = shared.refresh().await {
                    debug!("[ConvSession] 轮询失败，下次重试: {:#}", e);
                }
            }
        })
    }

    fn spawn_read_receipts(shared: Arc<Shared>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                shared.read_trigger.notified().await;
                sleep(shared.config.read_receipt_delay).await;
                if let Err(e) = shared.mark_read().await {
                    debug!("[ConvSession] 已读回执失败: {:#}", e);
                }
            }
        })
    }

    async fn spawn_push_listener(shared: Arc<Shared>) -> Option<JoinHandle<()>> {
        let filter = InsertFilter::eq("receiver_id", shared.pair.me.clone());
        let mut subscription = match shared.store.subscribe_inserts(Some(filter)).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("[ConvSession] ⚠️ 订阅实时推送失败，仅依赖轮询: {:#}", e);
                return None;
            }
        };
        Some(tokio::spawn(async move {
            while let Some(row) = subscription.recv().await {
                shared.handle_insert(row).await;
            }
            debug!("[ConvSession] 推送订阅结束");
        }))
    }

    pub fn pair(&self) -> &ConversationPair {
        &self.shared.pair
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// 当前视图快照
    pub fn snapshot(&self) -> Vec<LocalMessage> {
        self.shared.with_view(|v| v.snapshot())
    }

    /// 立即拉取一次
    pub async fn refresh(&self) -> Result<bool> {
        self.shared.refresh().await
    }

    /// 乐观插入待确认条目，返回临时 ID
    async fn push_pending(&self, draft: &ComposeDraft, preview: Option<&VibeAnalysis>) -> LocalMessage {
        let pair = &self.shared.pair;
        let mut pending = LocalMessage::pending(&pair.me, &pair.friend, draft.text());
        if let Some(analysis) = preview {
            pending.emojis = analysis.emojis.clone();
            pending.topic = analysis.topic.clone();
            pending.hint = analysis.hint.clone();
            pending.difficulty = analysis.difficulty;
            pending.points = analysis.points;
        }
        self.shared.with_view(|v| v.push_pending(pending.clone()));
        self.shared.notify_changed().await;
        self.shared
            .listener
            .on_scroll_to_latest(pair.friend.clone())
            .await;
        pending
    }

    /// 生成元数据并回填到待确认条目，返回待插入的消息
    async fn prepare(
        generator: &dyn VibeGenerator,
        shared: &Weak<Shared>,
        draft: &ComposeDraft,
        pending: &LocalMessage,
        preview: Option<VibeAnalysis>,
    ) -> Result<NewMessage> {
        let had_preview = preview.is_some();
        let analysis = draft.resolve_analysis(generator, preview).await;
        let mut entry = pending.clone();
        entry.emojis = analysis.emojis;
        entry.topic = analysis.topic;
        entry.hint = analysis.hint;
        entry.difficulty = analysis.difficulty;
        entry.points = analysis.points;
        let message = new_message_for(&entry)?;

        if !had_preview {
            if let Some(shared) = shared.upgrade() {
                let envelope = envelope_for(&entry);
                if shared.with_view(|v| v.update_pending_metadata(&pending.id, &envelope)) {
                    shared.notify_changed().await;
                }
            }
        }
        Ok(message)
    }

    /// 发送一条消息（等待结果）
    ///
    /// 失败时条目保留在视图中（FAILED），错误同时返回给调用方。
    pub async fn send(&self, text: &str, preview: Option<VibeAnalysis>) -> Result<MessageRow> {
        let draft = ComposeDraft::new(text)?;
        let pending = self.push_pending(&draft, preview.as_ref()).await;
        let weak = Arc::downgrade(&self.shared);
        let message =
            Self::prepare(self.shared.generator.as_ref(), &weak, &draft, &pending, preview).await?;
        deliver(self.shared.store.clone(), weak, pending.id, message).await
    }

    /// 后台发送，立即返回临时 ID
    ///
    /// 后台任务只持有会话的弱引用：消息照常写入存储，会话关闭后结果被丢弃，不会写入已释放的视图。
    pub async fn spawn_send(&self, text: &str, preview: Option<VibeAnalysis>) -> Result<String> {
        let draft = ComposeDraft::new(text)?;
        let pending = self.push_pending(&draft, preview.as_ref()).await;
        let local_id = pending.id.clone();

        let weak = Arc::downgrade(&self.shared);
        let store = self.shared.store.clone();
        let generator = self.shared.generator.clone();
        tokio::spawn(async move {
            let message =
                Self::prepare(generator.as_ref(), &weak, &draft, &pending, preview).await;
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!("[ConvSession] ❌ 打包消息失败: {:#}", e);
                    return;
                }
            };
            let _ = deliver(store, weak, pending.id, message).await;
        });
        Ok(local_id)
    }

    /// 重发一条失败的消息（保持原来的 sent_at，位置不变）
    pub async fn retry_failed(&self, local_id: &str) -> Result<MessageRow> {
        let entry = self.shared.with_view(|v| {
            if v.mark_sending(local_id) {
                v.get(local_id).cloned()
            } else {
                None
            }
        });
        let Some(entry) = entry else {
            return Err(VibeError::NotRetryable(local_id.to_string()).into());
        };
        info!("[ConvSession] 🔁 重发消息: {}", local_id);
        self.shared.notify_changed().await;

        let message = new_message_for(&entry)?;
        deliver(
            self.shared.store.clone(),
            Arc::downgrade(&self.shared),
            entry.id,
            message,
        )
        .await
    }

    /// 放弃一条未确认的消息
    pub async fn discard_failed(&self, local_id: &str) -> Result<LocalMessage> {
        let removed = self.shared.with_view(|v| v.discard(local_id));
        match removed {
            Some(entry) => {
                self.shared.notify_changed().await;
                Ok(entry)
            }
            None => Err(VibeError::MessageNotFound(local_id.to_string()).into()),
        }
    }

    /// 将对方发给我的未读消息标记为已读
    pub async fn mark_read(&self) -> Result<u64> {
        self.shared.mark_read().await
    }

    /// 本地标记已解
    pub async fn mark_solved(&self, message_id: &str, score: u8) -> bool {
        let changed = self.shared.with_view(|v| v.mark_solved(message_id, score));
        if changed {
            self.shared.notify_changed().await;
        }
        changed
    }

    /// 对一条收到的消息提交猜测，猜中后标记已解
    pub async fn guess(&self, message_id: &str, guess: &str) -> Result<GuessOutcome> {
        let target = self.shared.with_view(|v| {
            v.get(message_id)
                .filter(|e| e.is_incoming())
                .map(|e| e.text.clone())
        });
        let target = target.ok_or_else(|| VibeError::MessageNotFound(message_id.to_string()))?;

        let outcome = grade_guess(guess, &target, self.shared.config.pass_threshold);
        info!(
            "[ConvSession] 🎯 猜题 {}: {} 分 ({})",
            message_id,
            outcome.score(),
            if outcome.is_win() { "WIN" } else { "LOSS" }
        );
        if outcome.is_win() {
            self.mark_solved(message_id, outcome.score()).await;
        }
        Ok(outcome)
    }

    fn abort_tasks(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// 关闭会话，终止全部后台任务
    pub fn close(&self) {
        if self.is_open() {
            info!("[ConvSession] 👋 关闭会话, friend={}", self.shared.pair.friend);
        }
        self.abort_tasks();
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
