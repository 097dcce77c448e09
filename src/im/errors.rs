//! 错误类型定义
//!
//! 服务边界统一使用 `anyhow::Result`，需要调用方区分处理的错误使用 `VibeError`，
//! 调用方可以通过 `err.downcast_ref::<VibeError>()` 做模式匹配。

use thiserror::Error;

/// 可分类的业务错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VibeError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("message too long: {len} > {max} chars")]
    MessageTooLong { len: usize, max: usize },
    #[error("CANNOT ADD YOURSELF!")]
    CannotAddYourself,
    #[error("USER '{0}' NOT FOUND")]
    UserNotFound(String),
    #[error("USERNAME '{0}' IS TAKEN.")]
    UsernameTaken(String),
    #[error("COULD NOT GENERATE UNIQUE NAME. PLEASE TYPE ONE.")]
    UsernameGenerationFailed,
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("{0}")]
    InvalidPassword(&'static str),
    #[error("not signed in")]
    NotSignedIn,
    #[error("message {0} not found in conversation")]
    MessageNotFound(String),
    #[error("message {0} is not in a retryable state")]
    NotRetryable(String),
    #[error("store error {code}: {message}")]
    Store { code: String, message: String },
    #[error("auth error: {0}")]
    Auth(String),
}

/// 违反长度约束时展示给用户的提示
pub const USERNAME_LENGTH_MESSAGE: &str = "Username must be between 3 and 12 characters.";
/// 违反唯一约束时展示给用户的提示
pub const USERNAME_TAKEN_MESSAGE: &str = "Username already taken.";

/// 将存储层返回的约束错误映射为用户可读的提示
///
/// 按已知的约束错误子串匹配（同时兼容 Postgres 与 SQLite 的措辞），
/// 未知错误返回原始信息，没有信息时返回 "Unknown error"。
pub fn friendly_store_message(err: &anyhow::Error) -> String {
    let raw = format!("{:#}", err);
    if raw.contains("username_length")
        || raw.contains("violates check constraint")
        || raw.contains("CHECK constraint failed")
    {
        return USERNAME_LENGTH_MESSAGE.to_string();
    }
    if raw.contains("duplicate key")
        || raw.contains("violates unique constraint")
        || raw.contains("UNIQUE constraint failed")
    {
        return USERNAME_TAKEN_MESSAGE.to_string();
    }
    if raw.trim().is_empty() {
        "Unknown error".to_string()
    } else {
        raw
    }
}
