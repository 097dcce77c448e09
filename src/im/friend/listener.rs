//! 好友监听器回调接口

use async_trait::async_trait;

/// 好友监听器回调接口
#[async_trait]
pub trait FriendListener: Send + Sync {
    /// 好友列表发生变更（拉取、添加、删除之后），参数为 JSON 数组字符串
    async fn on_friend_list_changed(&self, friends_json: String);

    /// 某个好友的未读数发生变更
    async fn on_unread_count_changed(&self, friend_id: String, unread_count: usize);
}

/// 默认空实现（无操作）
pub struct EmptyFriendListener;

#[async_trait]
impl FriendListener for EmptyFriendListener {
    async fn on_friend_list_changed(&self, _friends_json: String) {
        // 默认不做任何处理
    }

    async fn on_unread_count_changed(&self, _friend_id: String, _unread_count: usize) {
        // 默认不做任何处理
    }
}
