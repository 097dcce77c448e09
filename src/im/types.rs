//! HTTP 通用响应处理
//!
//! 托管后端的 REST 接口（数据表接口与认证接口）成功时直接返回 JSON 数据，
//! 失败时返回错误体。这里统一读取 body、打印日志并转换为 `VibeError`。

use crate::im::errors::VibeError;
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, error};

/// 后端错误响应体
///
/// 数据表接口返回 `{code, message, details, hint}`，
/// 认证接口返回 `{error, error_description}` 或 `{code, msg}`，这里全部兼容。
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, deserialize_with = "deserialize_code")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

fn deserialize_code<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }))
}

impl ApiErrorBody {
    /// 取出最有信息量的错误描述
    pub fn describe(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for s in [
            &self.message,
            &self.msg,
            &self.error_description,
            &self.error,
            &self.details,
        ]
        .into_iter()
        .flatten()
        {
            if !s.is_empty() && !parts.contains(&s.as_str()) {
                parts.push(s);
            }
        }
        parts.join(" | ")
    }
}

/// 将失败响应转换为 `VibeError::Store`
pub fn api_error(status: reqwest::StatusCode, body: &[u8]) -> VibeError {
    let parsed: ApiErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let mut message = parsed.describe();
    if message.is_empty() {
        message = String::from_utf8_lossy(body).to_string();
    }
    VibeError::Store {
        code: parsed.code.unwrap_or_else(|| status.as_u16().to_string()),
        message,
    }
}

/// 读取响应 body，检查 HTTP 状态，返回原始字节
pub async fn read_http_body(response: reqwest::Response, operation_name: &str) -> Result<Vec<u8>> {
    let status = response.status();
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(api_error(status, &body_bytes).into());
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);
    Ok(body_bytes.to_vec())
}

/// 通用 HTTP 响应处理函数：检查状态并反序列化为目标类型
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<T> {
    let body_bytes = read_http_body(response, operation_name).await?;
    serde_json::from_slice(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name,
            e,
            String::from_utf8_lossy(&body_bytes)
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_api_error_becomes_store_error() {
        let body = br#"{"code":"23505","message":"duplicate key value violates unique constraint \"profiles_username_key\"","details":null,"hint":null}"#;
        match api_error(reqwest::StatusCode::CONFLICT, body) {
            VibeError::Store { code, message } => {
                assert_eq!(code, "23505");
                assert!(message.contains("duplicate key"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn auth_error_and_plain_body() {
        let body = br#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        let err = api_error(reqwest::StatusCode::BAD_REQUEST, body);
        assert!(err.to_string().contains("Invalid login credentials"));

        let err = api_error(reqwest::StatusCode::BAD_GATEWAY, b"upstream down");
        assert_eq!(
            err,
            VibeError::Store {
                code: "502".to_string(),
                message: "upstream down".to_string()
            }
        );
    }
}
