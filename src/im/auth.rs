//! 认证：托管认证 REST 接口的登录、注册、改密与登出
//!
//! 核心逻辑只关心"当前用户 ID"（`SessionProvider`），并且只做相等比较。

use crate::im::errors::VibeError;
use crate::im::types::{handle_http_response, read_http_body};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 新密码最短长度
pub const MIN_PASSWORD_CHARS: usize = 6;
pub const PASSWORD_TOO_SHORT: &str = "TOO SHORT (MIN 6 CHARS)";
pub const PASSWORDS_DONT_MATCH: &str = "PASSWORDS DON'T MATCH";

/// 当前登录会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub user_id: String,
    /// 注册时写入认证元数据的用户名（资料自愈时使用）
    pub username: Option<String>,
}

impl Session {
    /// 本地模式下的会话（无令牌）
    pub fn local(user_id: impl Into<String>, username: Option<String>) -> Self {
        Self {
            access_token: String::new(),
            user_id: user_id.into(),
            username,
        }
    }
}

/// 提供当前用户 ID
pub trait SessionProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

impl SessionProvider for Session {
    fn current_user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }
}

impl SessionProvider for Option<Session> {
    fn current_user_id(&self) -> Option<String> {
        self.as_ref().map(|s| s.user_id.clone())
    }
}

/// 校验新密码：长度与两次输入一致
pub fn validate_new_password(password: &str, confirm: &str) -> Result<(), VibeError> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(VibeError::InvalidPassword(PASSWORD_TOO_SHORT));
    }
    if password != confirm {
        return Err(VibeError::InvalidPassword(PASSWORDS_DONT_MATCH));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
}

/// 登录 / 注册响应
///
/// 开启邮箱确认时注册接口只返回用户对象（没有令牌），这里两种形态都接受。
#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user: Option<AuthUser>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
}

impl AuthResponse {
    fn into_session(self) -> Result<Session> {
        let (user_id, metadata) = match self.user {
            Some(user) => (user.id, user.user_metadata),
            None => (
                self.id.ok_or_else(|| VibeError::Auth("响应中缺少用户".to_string()))?,
                self.user_metadata,
            ),
        };
        Ok(Session {
            access_token: self.access_token.unwrap_or_default(),
            user_id,
            username: metadata.and_then(|m| m.username).filter(|u| !u.is_empty()),
        })
    }
}

/// 认证接口客户端
#[derive(Clone)]
pub struct AuthClient {
    client: reqwest::Client,
    auth_base_url: String,
}

impl AuthClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(api_key).context("apikey 含非法字符")?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("创建认证 HTTP 客户端失败")?;
        Ok(Self {
            client,
            auth_base_url: format!("{}/auth/v1", base_url.trim_end_matches('/')),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.auth_base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("operationID", Uuid::new_v4().to_string())
    }

    /// 邮箱密码登录
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        info!("[Auth] 🔐 正在登录: {}", email);
        let response = self
            .request(reqwest::Method::POST, "/token?grant_type=password")
            .json(&PasswordGrant { email, password })
            .send()
            .await
            .context("登录请求失败")?;
        let resp: AuthResponse = handle_http_response(response, "登录").await?;
        let session = resp.into_session()?;
        info!("[Auth] ✅ 登录成功: user={}", session.user_id);
        Ok(session)
    }

    /// 注册，用户名写入认证元数据
    pub async fn sign_up(&self, email: &str, password: &str, username: &str) -> Result<Session> {
        info!("[Auth] 📝 正在注册: {} ({})", email, username);
        let response = self
            .request(reqwest::Method::POST, "/signup")
            .json(&json!({
                "email": email,
                "password": password,
                "data": { "username": username },
            }))
            .send()
            .await
            .context("注册请求失败")?;
        let resp: AuthResponse = handle_http_response(response, "注册").await?;
        let session = resp.into_session()?;
        if session.access_token.is_empty() {
            warn!("[Auth] ⚠️ 注册成功但没有返回令牌（可能需要邮箱确认）");
        }
        Ok(session)
    }

    /// 修改密码（先本地校验）
    pub async fn update_password(&self, session: &Session, password: &str, confirm: &str) -> Result<()> {
        validate_new_password(password, confirm)?;
        let response = self
            .request(reqwest::Method::PUT, "/user")
            .bearer_auth(&session.access_token)
            .json(&json!({ "password": password }))
            .send()
            .await
            .context("修改密码请求失败")?;
        read_http_body(response, "修改密码").await?;
        info!("[Auth] ✅ 密码已更新");
        Ok(())
    }

    /// 同步认证元数据中的用户名
    pub async fn update_username_metadata(&self, session: &Session, username: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, "/user")
            .bearer_auth(&session.access_token)
            .json(&json!({ "data": { "username": username } }))
            .send()
            .await
            .context("更新用户名元数据请求失败")?;
        read_http_body(response, "更新用户名元数据").await?;
        debug!("[Auth] 用户名元数据已更新: {}", username);
        Ok(())
    }

    pub async fn sign_out(&self, session: &Session) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/logout")
            .bearer_auth(&session.access_token)
            .send()
            .await
            .context("登出请求失败")?;
        read_http_body(response, "登出").await?;
        info!("[Auth] 👋 已登出: user={}", session.user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_rules() {
        assert_eq!(
            validate_new_password("12345", "12345"),
            Err(VibeError::InvalidPassword(PASSWORD_TOO_SHORT))
        );
        assert_eq!(
            validate_new_password("123456", "123457"),
            Err(VibeError::InvalidPassword(PASSWORDS_DONT_MATCH))
        );
        assert!(validate_new_password("123456", "123456").is_ok());
        assert_eq!(
            VibeError::InvalidPassword(PASSWORD_TOO_SHORT).to_string(),
            "TOO SHORT (MIN 6 CHARS)"
        );
    }

    #[test]
    fn session_from_token_response() {
        let resp: AuthResponse = serde_json::from_str(
            r#"{"access_token":"tok","token_type":"bearer","user":{"id":"u1","user_metadata":{"username":"NEO"}}}"#,
        )
        .unwrap();
        assert_eq!(
            resp.into_session().unwrap(),
            Session {
                access_token: "tok".into(),
                user_id: "u1".into(),
                username: Some("NEO".into()),
            }
        );
    }

    #[test]
    fn session_from_bare_user_response() {
        let resp: AuthResponse =
            serde_json::from_str(r#"{"id":"u2","user_metadata":{}}"#).unwrap();
        let session = resp.into_session().unwrap();
        assert_eq!(session.user_id, "u2");
        assert!(session.access_token.is_empty());
        assert_eq!(session.username, None);

        let resp: AuthResponse = serde_json::from_str(r#"{"access_token":"x"}"#).unwrap();
        assert!(resp.into_session().is_err());
    }

    #[test]
    fn provider_compares_ids() {
        let session = Some(Session::local("u1", None));
        assert_eq!(session.current_user_id().as_deref(), Some("u1"));
        let none: Option<Session> = None;
        assert_eq!(none.current_user_id(), None);

        let client = AuthClient::new("https://x.example/", "k").unwrap();
        assert_eq!(
            client.url("/token?grant_type=password"),
            "https://x.example/auth/v1/token?grant_type=password"
        );
    }
}
