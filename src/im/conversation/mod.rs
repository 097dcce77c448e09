//! 会话模块
//!
//! 一个打开的聊天窗口：拉取、轮询、推送、乐观发送与已读回执

pub mod listener;
pub mod models;
pub mod service;

// 重新导出主要类型和函数
pub use listener::{ConversationListener, EmptyConversationListener};
pub use models::{ConversationConfig, DEFAULT_POLL_INTERVAL, DEFAULT_READ_RECEIPT_DELAY};
pub use service::ConversationSession;
