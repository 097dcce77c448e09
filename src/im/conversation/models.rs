//! 会话配置

use crate::im::scoring::DEFAULT_PASS_THRESHOLD;
use std::time::Duration;

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// 收到对方消息后延迟多久写已读回执（期间的多条消息合并为一次）
pub const DEFAULT_READ_RECEIPT_DELAY: Duration = Duration::from_millis(500);

/// 打开会话时的配置
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub poll_interval: Duration,
    pub read_receipt_delay: Duration,
    /// 猜题通过阈值
    pub pass_threshold: u8,
    /// 是否订阅实时推送（关闭时只靠轮询）
    pub realtime: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_receipt_delay: DEFAULT_READ_RECEIPT_DELAY,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            realtime: true,
        }
    }
}
