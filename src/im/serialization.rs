use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

/// 反序列化数组字段，处理 null 值
pub fn deserialize_vec_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// ID 字段可能是字符串（UUID）也可能是数字（自增主键），统一转为字符串
pub fn deserialize_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        Str(String),
        Int(i64),
        Float(f64),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Str(s) => s,
        StringOrNumber::Int(i) => i.to_string(),
        StringOrNumber::Float(f) => f.to_string(),
    })
}

/// 积分字段：生成服务可能返回浮点数或 null，统一为整数，缺省 100
pub fn deserialize_points<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64)))
        .filter(|p| *p > 0)
        .unwrap_or(DEFAULT_POINTS))
}

/// 默认积分
pub const DEFAULT_POINTS: i64 = 100;

/// 字段缺失时的积分
pub fn default_points() -> i64 {
    DEFAULT_POINTS
}

/// 解析时间戳
///
/// 支持 RFC3339（带时区），以及不带时区的 `YYYY-MM-DDTHH:MM:SS[.f]`（按 UTC 处理），
/// 后者是实时推送中 timestamp 列的常见格式。
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// 当前时间，截断到毫秒（与存储精度一致，保证乐观条目与确认后的记录 sent_at 相同）
pub fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

/// 毫秒时间戳转 `DateTime<Utc>`，越界时退回 UNIX 纪元
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// 生成本地临时消息 ID（乐观插入使用，与服务端 ID 永不重合）
pub fn generate_local_msg_id() -> String {
    format!("local-{}", Uuid::new_v4())
}

/// 去掉模型输出中可能包裹的 markdown 代码块标记
pub fn strip_code_fences(output: &str) -> String {
    output.replace("```json", "").replace("```", "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Row {
        #[serde(deserialize_with = "deserialize_string_or_number")]
        id: String,
        #[serde(default, deserialize_with = "deserialize_points")]
        points: i64,
        #[serde(default, deserialize_with = "deserialize_vec_or_null")]
        emojis: Vec<String>,
    }

    #[test]
    fn tolerant_field_decoding() {
        let row: Row = serde_json::from_str(r#"{"id": 42, "points": 150.4, "emojis": null}"#).unwrap();
        assert_eq!(row.id, "42");
        assert_eq!(row.points, 150);
        assert!(row.emojis.is_empty());

        let row: Row = serde_json::from_str(r#"{"id": "abc", "points": null}"#).unwrap();
        assert_eq!(row.id, "abc");
        assert_eq!(row.points, DEFAULT_POINTS);
    }

    #[test]
    fn parses_timestamps_with_and_without_zone() {
        let a = parse_timestamp("2024-05-01T10:00:00.123+00:00").unwrap();
        let b = parse_timestamp("2024-05-01T10:00:00.123").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn local_ids_are_distinct() {
        assert_ne!(generate_local_msg_id(), generate_local_msg_id());
        assert!(generate_local_msg_id().starts_with("local-"));
    }
}
