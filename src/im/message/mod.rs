//! 消息模块
//!
//! 消息记录、信封编解码与本地消息视图（乐观发送 / 轮询 / 推送的合并）

pub mod envelope;
pub mod models;
pub mod types;
pub mod view;

// 重新导出主要类型和函数
pub use envelope::{build_envelope, decode_payload, encode_payload, plain_envelope, DecodedPayload};
pub use models::{MessageRow, NewMessage};
pub use types::{DeliveryStatus, Difficulty, MessageKind, VibeEnvelope, ENVELOPE_VERSION};
pub use view::{ConversationView, InsertOutcome, LocalMessage};
