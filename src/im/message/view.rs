//! 本地消息视图
//!
//! 一个会话（我 + 好友）在客户端的消息列表，按 `id` 唯一、按 `sent_at` 升序。
//! 三个来源汇入同一个视图：
//! - 乐观发送：先插入带本地临时 ID 的 SENDING 条目，确认后替换为服务端记录；
//! - 轮询拉取：用拉取结果整体替换非本地条目，本地条目（SENDING / FAILED）保留；
//! - 实时推送：按 ID 去重后插入。
//!
//! 三者都是幂等的 upsert，到达顺序不影响最终结果。
//! 拉取开始前先取 `fetch_token()`：拉取期间经提交或推送进入视图的记录，
//! 即使不在（已过期的）拉取结果里也会保留。
//! 视图本身是纯同步数据结构，不做任何 I/O。

use crate::im::message::envelope::decode_payload;
use crate::im::message::models::MessageRow;
use crate::im::message::types::{DeliveryStatus, Difficulty, MessageKind, VibeEnvelope};
use crate::im::serialization::{generate_local_msg_id, now_millis, DEFAULT_POINTS};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// 视图中的一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub kind: MessageKind,
    pub text: String,
    pub emojis: Vec<String>,
    pub topic: String,
    pub hint: String,
    pub difficulty: Difficulty,
    pub points: i64,
    pub status: DeliveryStatus,
    pub sent_at: DateTime<Utc>,
    /// 猜中后的得分（仅本地）
    pub score: Option<u8>,
    /// 是否为尚未被服务端确认的本地条目
    pub local: bool,
}

impl LocalMessage {
    /// 从服务端记录构造视图条目
    ///
    /// 我发出的消息一律为 OUTGOING；收到的消息沿用信封里的类型（OUTGOING 视为未解）。
    /// 状态优先取记录的状态列，其次取信封里的状态。
    pub fn from_row(row: &MessageRow, me: &str) -> Self {
        let decoded = decode_payload(&row.payload);
        let envelope_status = decoded.envelope.as_ref().map(|e| e.status);
        let kind = if row.sender_id == me {
            MessageKind::Outgoing
        } else {
            match decoded.envelope.as_ref().map(|e| e.kind) {
                Some(MessageKind::IncomingSolved) => MessageKind::IncomingSolved,
                _ => MessageKind::IncomingUnsolved,
            }
        };

        let mut entry = LocalMessage {
            id: row.id.clone(),
            sender_id: row.sender_id.clone(),
            receiver_id: row.receiver_id.clone(),
            kind,
            text: decoded.text,
            emojis: Vec::new(),
            topic: String::new(),
            hint: String::new(),
            difficulty: Difficulty::Medium,
            points: DEFAULT_POINTS,
            status: row.status.or(envelope_status).unwrap_or_default(),
            sent_at: row.sent_at,
            score: None,
            local: false,
        };
        if let Some(envelope) = decoded.envelope {
            entry.apply_metadata(&envelope);
        }
        entry
    }

    /// 构造乐观发送的待确认条目（临时 ID，状态 SENDING）
    pub fn pending(me: &str, friend: &str, text: &str) -> Self {
        LocalMessage {
            id: generate_local_msg_id(),
            sender_id: me.to_string(),
            receiver_id: friend.to_string(),
            kind: MessageKind::Outgoing,
            text: text.to_string(),
            emojis: Vec::new(),
            topic: String::new(),
            hint: String::new(),
            difficulty: Difficulty::Medium,
            points: DEFAULT_POINTS,
            status: DeliveryStatus::Sending,
            sent_at: now_millis(),
            score: None,
            local: true,
        }
    }

    /// 用信封中的元数据覆盖当前条目（原文、状态、类型不变）
    pub fn apply_metadata(&mut self, envelope: &VibeEnvelope) {
        self.emojis = envelope.emojis.clone();
        self.topic = envelope.topic.clone();
        self.hint = envelope.hint.clone();
        self.difficulty = envelope.difficulty;
        self.points = envelope.points;
    }

    pub fn is_incoming(&self) -> bool {
        self.kind != MessageKind::Outgoing
    }
}

/// 推送事件的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 不属于当前会话
    Ignored,
    /// 视图中已有该 ID
    Duplicate,
    /// 已插入；`from_remote` 表示由对方发出
    Accepted { from_remote: bool },
}

/// 一个会话的本地消息视图
#[derive(Debug, Clone)]
pub struct ConversationView {
    me: String,
    friend: String,
    entries: Vec<LocalMessage>,
    /// 本地标记为已解的消息及得分，跨拉取保留
    solved: HashMap<String, u8>,
    /// 每次提交或推送入视图递增
    generation: u64,
    /// 经提交或推送进入视图的记录 → 进入时的代数
    accepted: HashMap<String, u64>,
}

impl ConversationView {
    pub fn new(me: impl Into<String>, friend: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            friend: friend.into(),
            entries: Vec::new(),
            solved: HashMap::new(),
            generation: 0,
            accepted: HashMap::new(),
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn friend(&self) -> &str {
        &self.friend
    }

    pub fn entries(&self) -> &[LocalMessage] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<LocalMessage> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&LocalMessage> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// 记录是否属于本会话（任一方向）
    pub fn belongs_to_pair(&self, row: &MessageRow) -> bool {
        (row.sender_id == self.me && row.receiver_id == self.friend)
            || (row.sender_id == self.friend && row.receiver_id == self.me)
    }

    /// 对方发给我、尚未已读的消息数
    pub fn unread_from_friend(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                !e.local && e.sender_id == self.friend && e.status != DeliveryStatus::Read
            })
            .count()
    }

    fn decorate(&self, mut entry: LocalMessage) -> LocalMessage {
        if let Some(score) = self.solved.get(&entry.id) {
            if entry.is_incoming() {
                entry.kind = MessageKind::IncomingSolved;
                entry.score = Some(*score);
            }
        }
        entry
    }

    fn resort(&mut self) {
        // sort_by_key 是稳定排序，相同 sent_at 保持插入顺序
        self.entries.sort_by_key(|e| e.sent_at);
    }

    fn record_accepted(&mut self, id: &str) {
        self.generation += 1;
        self.accepted.insert(id.to_string(), self.generation);
    }

    /// 发起拉取前调用，合并时传给 `merge_fetched_since`
    pub fn fetch_token(&self) -> u64 {
        self.generation
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// 插入乐观发送的条目
    pub fn push_pending(&mut self, entry: LocalMessage) {
        if let Some(pos) = self.position(&entry.id) {
            self.entries[pos] = entry;
        } else {
            self.entries.push(entry);
        }
        self.resort();
    }

    /// 元数据生成完成后更新待确认条目
    pub fn update_pending_metadata(&mut self, local_id: &str, envelope: &VibeEnvelope) -> bool {
        match self.entries.iter_mut().find(|e| e.local && e.id == local_id) {
            Some(entry) => {
                entry.apply_metadata(envelope);
                true
            }
            None => false,
        }
    }

    /// 发送成功：用服务端记录替换待确认条目
    ///
    /// 如果该记录已经先经由轮询或推送进入视图，只移除待确认条目，不产生重复。
    /// 返回待确认条目是否仍在视图中。
    pub fn commit(&mut self, local_id: &str, row: &MessageRow) -> bool {
        let pending = self.position(local_id);
        if let Some(pos) = pending {
            self.entries.remove(pos);
        }

        let entry = self.decorate(LocalMessage::from_row(row, &self.me));
        match self.position(&row.id) {
            Some(pos) => self.entries[pos] = entry,
            None => self.entries.push(entry),
        }
        self.record_accepted(&row.id);
        self.resort();
        pending.is_some()
    }

    /// 发送失败：条目原地保留，状态置为 FAILED
    pub fn fail(&mut self, local_id: &str) -> bool {
        self.set_local_status(local_id, DeliveryStatus::Failed)
    }

    /// 重试前将 FAILED 条目恢复为 SENDING
    pub fn mark_sending(&mut self, local_id: &str) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.local && e.id == local_id && e.status == DeliveryStatus::Failed)
        {
            Some(entry) => {
                entry.status = DeliveryStatus::Sending;
                true
            }
            None => false,
        }
    }

    fn set_local_status(&mut self, local_id: &str, status: DeliveryStatus) -> bool {
        match self.entries.iter_mut().find(|e| e.local && e.id == local_id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// 移除本地条目（放弃失败的发送）
    pub fn discard(&mut self, local_id: &str) -> Option<LocalMessage> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.local && e.id == local_id)?;
        Some(self.entries.remove(pos))
    }

    /// 合并一次拉取结果（拉取期间视图没有其它来源的变化）
    ///
    /// 非本地条目整体替换为拉取到的记录（按 ID 去重，忽略不属于本会话的记录），
    /// 本地条目原样保留。重复调用结果相同。
    pub fn merge_fetched(&mut self, rows: &[MessageRow]) {
        self.merge_fetched_since(rows, self.generation);
    }

    /// 合并一次在 `token` 时发起的拉取结果
    ///
    /// 在 `token` 之后经提交或推送进入视图、但不在拉取结果里的记录保留：
    /// 它们比这次拉取新，不能被过期的快照删掉。
    pub fn merge_fetched_since(&mut self, rows: &[MessageRow], token: u64) {
        let mut seen = HashSet::new();
        let mut merged = Vec::with_capacity(rows.len() + self.entries.len());
        for row in rows {
            if !self.belongs_to_pair(row) || !seen.insert(row.id.clone()) {
                continue;
            }
            merged.push(self.decorate(LocalMessage::from_row(row, &self.me)));
        }

        let accepted = &self.accepted;
        let kept = self.entries.drain(..).filter(|e| {
            e.local
                || (!seen.contains(&e.id)
                    && accepted.get(&e.id).is_some_and(|generation| *generation > token))
        });
        merged.extend(kept);

        // 拉取发起前进入的记录已由这次结果确认（或删除）
        self.accepted.retain(|_, generation| *generation > token);
        self.entries = merged;
        self.resort();
    }

    /// 处理一条实时推送的新记录
    pub fn apply_insert(&mut self, row: &MessageRow) -> InsertOutcome {
        if !self.belongs_to_pair(row) {
            return InsertOutcome::Ignored;
        }
        if self.position(&row.id).is_some() {
            return InsertOutcome::Duplicate;
        }
        let entry = self.decorate(LocalMessage::from_row(row, &self.me));
        self.entries.push(entry);
        self.record_accepted(&row.id);
        self.resort();
        InsertOutcome::Accepted {
            from_remote: row.sender_id == self.friend,
        }
    }

    /// 本地标记对方消息为已解
    pub fn mark_solved(&mut self, id: &str, score: u8) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id && e.is_incoming()) else {
            return false;
        };
        entry.kind = MessageKind::IncomingSolved;
        entry.score = Some(score);
        self.solved.insert(id.to_string(), score);
        true
    }

    /// 远端已读回执成功后，同步本地状态
    pub fn mark_incoming_read(&mut self) -> usize {
        let mut changed = 0;
        for entry in self.entries.iter_mut() {
            if !entry.local && entry.sender_id == self.friend && entry.status != DeliveryStatus::Read
            {
                entry.status = DeliveryStatus::Read;
                changed += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::envelope::{build_envelope, encode_payload, plain_envelope};
    use crate::im::serialization::from_millis;
    use crate::im::vibe::VibeAnalysis;

    const ME: &str = "me";
    const FRIEND: &str = "friend";

    fn row(id: &str, from: &str, to: &str, text: &str, at: i64) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            payload: encode_payload(&plain_envelope(text)).unwrap(),
            status: Some(DeliveryStatus::Sent),
            sent_at: from_millis(at),
        }
    }

    fn ids(view: &ConversationView) -> Vec<String> {
        view.entries().iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn merge_is_idempotent() {
        let rows = vec![
            row("1", ME, FRIEND, "hi", 1_000),
            row("2", FRIEND, ME, "yo", 2_000),
        ];
        let mut view = ConversationView::new(ME, FRIEND);
        view.merge_fetched(&rows);
        let once = view.snapshot();
        view.merge_fetched(&rows);
        assert_eq!(view.snapshot(), once);
        assert_eq!(ids(&view), vec!["1", "2"]);
        assert_eq!(view.entries()[0].kind, MessageKind::Outgoing);
        assert_eq!(view.entries()[1].kind, MessageKind::IncomingUnsolved);
    }

    #[test]
    fn optimistic_send_then_commit_leaves_one_entry() {
        let mut view = ConversationView::new(ME, FRIEND);
        let pending = LocalMessage::pending(ME, FRIEND, "running late");
        let local_id = pending.id.clone();
        let sent_at = pending.sent_at;
        view.push_pending(pending);
        assert_eq!(view.get(&local_id).unwrap().status, DeliveryStatus::Sending);

        let mut confirmed = row("srv-1", ME, FRIEND, "running late", 0);
        confirmed.sent_at = sent_at;
        assert!(view.commit(&local_id, &confirmed));

        assert_eq!(view.len(), 1);
        let entry = &view.entries()[0];
        assert_eq!(entry.id, "srv-1");
        assert_eq!(entry.text, "running late");
        assert_eq!(entry.status, DeliveryStatus::Sent);
        assert!(!entry.local);
    }

    #[test]
    fn commit_after_poll_does_not_duplicate() {
        let mut view = ConversationView::new(ME, FRIEND);
        let pending = LocalMessage::pending(ME, FRIEND, "hello");
        let local_id = pending.id.clone();
        view.push_pending(pending);

        let confirmed = row("srv-9", ME, FRIEND, "hello", 5_000);
        view.merge_fetched(std::slice::from_ref(&confirmed));
        // 轮询先拿到了确认记录，待确认条目还在
        assert_eq!(view.len(), 2);

        view.commit(&local_id, &confirmed);
        assert_eq!(ids(&view), vec!["srv-9"]);
    }

    #[test]
    fn stale_fetch_keeps_rows_accepted_after_it_started() {
        let mut view = ConversationView::new(ME, FRIEND);
        let old = row("old", FRIEND, ME, "hi", 1_000);
        view.merge_fetched(std::slice::from_ref(&old));

        // 拉取在发送提交之前发起，结果里没有新记录
        let token = view.fetch_token();
        let pending = LocalMessage::pending(ME, FRIEND, "hello there");
        let local_id = pending.id.clone();
        view.push_pending(pending);
        view.commit(&local_id, &row("sent", ME, FRIEND, "hello there", 2_000));
        view.apply_insert(&row("pushed", FRIEND, ME, "yo", 3_000));

        view.merge_fetched_since(std::slice::from_ref(&old), token);
        assert_eq!(ids(&view), vec!["old", "sent", "pushed"]);

        // 之后发起的拉取是权威的：已删除的记录不再保留
        let token = view.fetch_token();
        view.merge_fetched_since(&[old.clone(), row("sent", ME, FRIEND, "hello there", 2_000)], token);
        assert_eq!(ids(&view), vec!["old", "sent"]);
    }

    #[test]
    fn push_and_poll_converge_in_any_order() {
        let a = row("a", FRIEND, ME, "one", 1_000);
        let b = row("b", FRIEND, ME, "two", 2_000);

        let mut push_first = ConversationView::new(ME, FRIEND);
        assert_eq!(
            push_first.apply_insert(&b),
            InsertOutcome::Accepted { from_remote: true }
        );
        push_first.merge_fetched(&[a.clone(), b.clone()]);

        let mut poll_first = ConversationView::new(ME, FRIEND);
        poll_first.merge_fetched(&[a.clone(), b.clone()]);
        assert_eq!(poll_first.apply_insert(&b), InsertOutcome::Duplicate);

        assert_eq!(push_first.snapshot(), poll_first.snapshot());
        assert_eq!(ids(&push_first), vec!["a", "b"]);
    }

    #[test]
    fn ordering_follows_sent_at_not_confirmation_order() {
        let mut view = ConversationView::new(ME, FRIEND);
        let mut first = LocalMessage::pending(ME, FRIEND, "first");
        first.sent_at = from_millis(1_000);
        let mut second = LocalMessage::pending(ME, FRIEND, "second");
        second.sent_at = from_millis(2_000);
        let (first_id, second_id) = (first.id.clone(), second.id.clone());
        view.push_pending(first);
        view.push_pending(second);

        // 第二条先确认
        view.commit(&second_id, &row("s2", ME, FRIEND, "second", 2_000));
        view.commit(&first_id, &row("s1", ME, FRIEND, "first", 1_000));
        assert_eq!(ids(&view), vec!["s1", "s2"]);
    }

    #[test]
    fn failed_entry_survives_refresh_and_can_be_retried() {
        let mut view = ConversationView::new(ME, FRIEND);
        let pending = LocalMessage::pending(ME, FRIEND, "lost");
        let local_id = pending.id.clone();
        view.push_pending(pending);
        assert!(view.fail(&local_id));

        view.merge_fetched(&[row("1", FRIEND, ME, "hey", 0)]);
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(&local_id).unwrap().status, DeliveryStatus::Failed);

        assert!(view.mark_sending(&local_id));
        assert!(!view.mark_sending(&local_id));
        assert_eq!(view.get(&local_id).unwrap().status, DeliveryStatus::Sending);

        assert!(view.discard(&local_id).is_some());
        assert_eq!(ids(&view), vec!["1"]);
    }

    #[test]
    fn rows_from_other_pairs_are_ignored() {
        let mut view = ConversationView::new(ME, FRIEND);
        assert_eq!(
            view.apply_insert(&row("x", "stranger", ME, "psst", 1)),
            InsertOutcome::Ignored
        );
        assert_eq!(
            view.apply_insert(&row("y", FRIEND, "someone-else", "hi", 1)),
            InsertOutcome::Ignored
        );
        view.merge_fetched(&[row("z", "stranger", ME, "psst", 1)]);
        assert!(view.is_empty());
        assert_eq!(
            view.apply_insert(&row("mine", ME, FRIEND, "hi", 1)),
            InsertOutcome::Accepted { from_remote: false }
        );
    }

    #[test]
    fn malformed_payload_is_shown_as_plain_text() {
        let mut view = ConversationView::new(ME, FRIEND);
        let mut raw = row("1", FRIEND, ME, "", 0);
        raw.payload = "legacy plain text".to_string();
        raw.status = None;
        view.apply_insert(&raw);
        let entry = &view.entries()[0];
        assert_eq!(entry.text, "legacy plain text");
        assert!(entry.emojis.is_empty());
        assert_eq!(entry.status, DeliveryStatus::Sent);
    }

    #[test]
    fn solved_state_survives_merge() {
        let analysis = VibeAnalysis {
            emojis: vec!["🍕".into()],
            topic: "FOOD".into(),
            hint: "yum".into(),
            difficulty: Difficulty::Easy,
            points: 150,
        };
        let mut incoming = row("1", FRIEND, ME, "", 1_000);
        incoming.payload = encode_payload(&build_envelope("pizza", &analysis)).unwrap();

        let mut view = ConversationView::new(ME, FRIEND);
        view.merge_fetched(std::slice::from_ref(&incoming));
        assert_eq!(view.entries()[0].points, 150);
        assert!(view.mark_solved("1", 90));
        view.merge_fetched(std::slice::from_ref(&incoming));

        let entry = &view.entries()[0];
        assert_eq!(entry.kind, MessageKind::IncomingSolved);
        assert_eq!(entry.score, Some(90));
        assert_eq!(entry.emojis, vec!["🍕".to_string()]);
    }

    #[test]
    fn unread_counts_and_local_read() {
        let mut view = ConversationView::new(ME, FRIEND);
        let mut read = row("3", FRIEND, ME, "old", 500);
        read.status = Some(DeliveryStatus::Read);
        view.merge_fetched(&[
            read,
            row("1", FRIEND, ME, "a", 1_000),
            row("2", ME, FRIEND, "b", 2_000),
        ]);
        assert_eq!(view.unread_from_friend(), 1);
        assert_eq!(view.mark_incoming_read(), 1);
        assert_eq!(view.mark_incoming_read(), 0);
        assert_eq!(view.get("2").unwrap().status, DeliveryStatus::Sent);
    }
}
