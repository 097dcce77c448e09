//! 用户资料模块

pub mod models;
pub mod service;

// 重新导出主要类型和函数
pub use models::{Profile, ProfileState, RESTORED_BG_COLOR};
pub use service::{generate_random_username, ProfileService, RetryPolicy};
