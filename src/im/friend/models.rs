//! 好友模型定义

use crate::im::serialization::deserialize_string_or_number;
use serde::{Deserialize, Serialize};

/// 好友卡片配色（顺序决定哈希取模后的颜色）
pub const FRIEND_PALETTE: [&str; 6] = [
    "#FF5252", // RED
    "#FFD740", // YELLOW
    "#9C27B0", // PURPLE
    "#2196F3", // BLUE
    "#FF4081", // PINK
    "#00E676", // GREEN
];

/// 没有用户名时展示的名字
pub const UNKNOWN_NAME: &str = "UNKNOWN";
/// 没有头像种子时使用的种子
pub const DEFAULT_AVATAR_SEED: &str = "default";

/// 好友关系记录（对应 `friendships` 表，无向关系，任一方向都算好友）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friendship {
    #[serde(deserialize_with = "deserialize_string_or_number")]
    pub user_id: String,
    #[serde(deserialize_with = "deserialize_string_or_number")]
    pub friend_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Friendship {
    /// 从 `me` 的视角取出对方 ID
    pub fn other(&self, me: &str) -> &str {
        if self.user_id == me {
            &self.friend_id
        } else {
            &self.user_id
        }
    }
}

/// 好友列表中展示的好友
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Friend {
    pub id: String,
    pub name: String,
    pub avatar_seed: String,
    pub color: String,
    pub unread_count: usize,
}

/// 按 ID 计算好友卡片颜色
///
/// 字符串哈希 `h = c + ((h << 5) - h)`，逐个 UTF-16 码元计算，
/// 左移按 32 位截断、加减在 64 位上进行，最后取 `|h| % 6`。
pub fn palette_color(id: &str) -> &'static str {
    let mut hash: i64 = 0;
    for unit in id.encode_utf16() {
        let shifted = (hash as i32).wrapping_shl(5) as i64;
        hash = unit as i64 + (shifted - hash);
    }
    let index = (hash.unsigned_abs() % FRIEND_PALETTE.len() as u64) as usize;
    FRIEND_PALETTE[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_is_deterministic() {
        assert_eq!(palette_color(""), "#FF5252");
        // 'a' = 97 → 97 % 6 = 1
        assert_eq!(palette_color("a"), "#FFD740");
        // "ab": 98 + (97*32 - 97) = 3105 → 3
        assert_eq!(palette_color("ab"), "#2196F3");
        let id = "3f1c2d9e-5b7a-4c1e-9f00-123456789abc";
        assert_eq!(palette_color(id), palette_color(id));
        assert!(FRIEND_PALETTE.contains(&palette_color(id)));
    }

    #[test]
    fn friendship_other_side() {
        let f = Friendship {
            user_id: "a".into(),
            friend_id: "b".into(),
            status: None,
        };
        assert_eq!(f.other("a"), "b");
        assert_eq!(f.other("b"), "a");
    }
}
