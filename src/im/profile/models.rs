//! 用户资料模型定义

use crate::im::serialization::deserialize_string_or_number;
use serde::{Deserialize, Serialize};

/// 自愈时使用的默认背景色
pub const RESTORED_BG_COLOR: &str = "#b6e3f4";

/// 用户资料（对应 `profiles` 表）
///
/// 远端列名为 `avatar_id` / `color`，本地库为 `avatar_seed` / `bg_color`，反序列化两者都接受。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(deserialize_with = "deserialize_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(rename = "avatar_id", alias = "avatar_seed", default)]
    pub avatar_seed: Option<String>,
    #[serde(rename = "color", alias = "bg_color", default)]
    pub bg_color: Option<String>,
}

impl Profile {
    /// 用户名为空视为资料不完整，需要自愈
    pub fn has_username(&self) -> bool {
        self.username
            .as_deref()
            .map(|u| !u.trim().is_empty())
            .unwrap_or(false)
    }
}

/// 资料加载结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileState {
    /// 资料完整
    Ready(Profile),
    /// 资料缺失用户名，已自动补全
    Restored(Profile),
    /// 多次重试仍失败，降级为无资料状态（界面继续可用）
    Degraded { user_id: String },
}

impl ProfileState {
    pub fn profile(&self) -> Option<&Profile> {
        match self {
            ProfileState::Ready(p) | ProfileState::Restored(p) => Some(p),
            ProfileState::Degraded { .. } => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.profile().and_then(|p| p.username.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_remote_and_local_column_names() {
        let remote: Profile =
            serde_json::from_str(r##"{"id":"u1","username":"NEO","avatar_id":"s1","color":"#fff"}"##)
                .unwrap();
        let local: Profile = serde_json::from_str(
            r##"{"id":"u1","username":"NEO","avatar_seed":"s1","bg_color":"#fff"}"##,
        )
        .unwrap();
        assert_eq!(remote, local);
        let json = serde_json::to_value(&remote).unwrap();
        assert_eq!(json["avatar_id"], "s1");
        assert_eq!(json["color"], "#fff");
    }

    #[test]
    fn blank_username_needs_repair() {
        let p: Profile = serde_json::from_str(r#"{"id":"u1","username":"  "}"#).unwrap();
        assert!(!p.has_username());
        assert_eq!(ProfileState::Degraded { user_id: "u1".into() }.username(), None);
    }
}
