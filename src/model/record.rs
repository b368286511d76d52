//! 中转日志数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// 一次中转请求的日志记录
///
/// 由服务端在请求完成时生成，客户端只读。字段名与服务端 JSON 保持一致，
/// 见各字段上的 `rename`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// 日志 ID（唯一，但不保证跨来源单调）
    pub id: i64,
    /// 请求时间（Unix 秒）
    #[serde(rename = "time")]
    pub timestamp: i64,
    /// 请求模型名称
    #[serde(default)]
    pub request_model_name: String,
    /// 实际使用的渠道 ID
    #[serde(rename = "channel", default)]
    pub channel_id: i64,
    /// 渠道名称
    #[serde(default)]
    pub channel_name: String,
    /// 实际使用的模型名称
    #[serde(default)]
    pub actual_model_name: String,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    /// 首字时间（毫秒）
    #[serde(rename = "ftut", default)]
    pub first_token_latency_ms: i64,
    /// 总用时（毫秒）
    #[serde(rename = "use_time", default)]
    pub total_latency_ms: i64,
    /// 消耗费用
    #[serde(default)]
    pub cost: f64,
    /// 请求内容（原始文本，通常为 JSON）
    #[serde(rename = "request_content", default)]
    pub request_body: String,
    /// 响应内容（原始文本，通常为 JSON）
    #[serde(rename = "response_content", default)]
    pub response_body: String,
    /// 错误信息，服务端用空字符串表示无错误
    #[serde(
        default,
        deserialize_with = "deserialize_error",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
}

fn deserialize_error<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

impl LogRecord {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }

    /// 请求时间（UTC），时间戳越界时返回 None
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}
