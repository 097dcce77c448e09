pub mod auth;
pub mod client;
pub mod compose;
pub mod conversation;
pub mod db;
pub mod errors;
pub mod friend;
pub mod message;
pub mod profile;
pub mod scoring;
pub mod serialization;
pub mod store;
pub mod types;
pub mod vibe;

// 重新导出认证相关类型
pub use auth::{AuthClient, Session, SessionProvider};

// 重新导出会话相关类型
pub use conversation::{ConversationConfig, ConversationListener, ConversationSession};

// 重新导出错误类型
pub use errors::VibeError;
