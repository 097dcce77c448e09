//! 邀请码与头像地址

const INVITE_PREFIX: &str = "VB-";
const AVATAR_SERVICE_URL: &str = "https://api.dicebear.com/9.x/pixel-art/svg";

/// 用户名对应的邀请码：`VB-` + 大写用户名
pub fn invite_code(username: &str) -> String {
    format!("{}{}", INVITE_PREFIX, username.to_uppercase())
}

/// 从输入的邀请码中取出用户名
///
/// 去掉首尾空白和开头不区分大小写的 `VB-`；`VB-PLAYER1` 与 `PLAYER1` 等价。
/// 结果为空时返回 `None`。
pub fn parse_invite_code(input: &str) -> Option<String> {
    let input = input.trim();
    let name = match input.get(..INVITE_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(INVITE_PREFIX) => &input[INVITE_PREFIX.len()..],
        _ => input,
    };
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// 像素风头像地址（背景色去掉 `#`）
pub fn avatar_url(seed: &str, bg_color: &str) -> String {
    format!(
        "{}?seed={}&backgroundColor={}",
        AVATAR_SERVICE_URL,
        seed,
        bg_color.replacen('#', "", 1)
    )
}
