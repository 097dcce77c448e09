//! 好友模块
//!
//! 好友列表、未读数、邀请码与搜索

pub mod invite;
pub mod listener;
pub mod models;
pub mod service;

// 重新导出主要类型和函数
pub use invite::{avatar_url, invite_code, parse_invite_code};
pub use listener::{EmptyFriendListener, FriendListener};
pub use models::{palette_color, Friend, Friendship, FRIEND_PALETTE};
pub use service::FriendService;
