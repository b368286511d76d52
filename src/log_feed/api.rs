//! 日志 API 客户端
//!
//! # 端点（相对于 `{baseUrl}{apiPrefix}`）
//! - `GET /log/list` - 历史日志分页
//! - `GET /log/stream-token` - 获取一次性实时流 token
//! - `GET /log/stream?token=` - 实时日志 SSE 流
//! - `DELETE /log/clear` - 服务端清空日志

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::sse::{SseDecoder, SseEvent};
use crate::common::truncate_with_ellipsis;
use crate::http_client::{ProxyConfig, build_client};
use crate::model::config::Config;
use crate::model::record::LogRecord;

/// 实时流：按到达顺序产出的 SSE 事件
pub type EventStream = BoxStream<'static, anyhow::Result<SseEvent>>;

/// 历史查询的时间范围（Unix 秒）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

/// 日志服务端接口
///
/// 历史分页、stream token、实时流和服务端清空。
/// HTTP 实现见 [`HttpLogApi`]，测试中可替换为模拟实现。
#[async_trait]
pub trait LogApi: Send + Sync {
    /// 获取一页历史日志（服务端按时间倒序）
    async fn fetch_page(
        &self,
        page: u32,
        page_size: u32,
        range: TimeRange,
    ) -> anyhow::Result<Vec<LogRecord>>;

    /// 获取一次性实时流 token
    async fn stream_token(&self) -> anyhow::Result<String>;

    /// 用 token 打开实时流
    async fn open_stream(&self, token: &str) -> anyhow::Result<EventStream>;

    /// 服务端清空日志
    async fn purge(&self) -> anyhow::Result<()>;
}

/// 解开网关统一响应包装 `{ code, message, data }`
///
/// 部分部署直接返回裸 JSON，两种格式都接受；`null` 返回 None。
fn unwrap_envelope<T: DeserializeOwned>(value: Value) -> anyhow::Result<Option<T>> {
    let payload = match value {
        Value::Object(mut map) if map.contains_key("code") || map.contains_key("data") => {
            if let Some(code) = map.get("code").and_then(Value::as_i64) {
                if code != 0 && !(200..300).contains(&code) {
                    let message = map
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    anyhow::bail!("服务端返回错误 (code {}): {}", code, message);
                }
            }
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    Ok(serde_json::from_value(payload)?)
}

#[derive(Debug, Deserialize)]
struct StreamTokenResponse {
    token: String,
}

/// 基于 reqwest 的 [`LogApi`] 实现
pub struct HttpLogApi {
    api_root: String,
    api_key: Option<String>,
    /// 历史查询客户端（带整体超时）
    client: Client,
    /// 实时流客户端（不设整体超时）
    stream_client: Client,
}

impl HttpLogApi {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let proxy = ProxyConfig::from_config(config);
        let client = build_client(proxy.as_ref(), Some(config.timeout_secs), config.tls_backend)?;
        let stream_client = build_client(proxy.as_ref(), None, config.tls_backend)?;

        Ok(Self {
            api_root: config.api_root(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            client,
            stream_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// 非 2xx 响应转为错误（附带截断后的响应体）
    async fn check_status(response: Response) -> anyhow::Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("HTTP {}: {}", status, truncate_with_ellipsis(&body, 256))
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> anyhow::Result<Option<T>> {
        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("读取响应失败: {}", e))?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("响应解析失败: {}", e))?;
        unwrap_envelope(value)
    }
}

#[async_trait]
impl LogApi for HttpLogApi {
    async fn fetch_page(
        &self,
        page: u32,
        page_size: u32,
        range: TimeRange,
    ) -> anyhow::Result<Vec<LogRecord>> {
        let mut query: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
        ];
        if let Some(start) = range.start_time {
            query.push(("start_time", start.to_string()));
        }
        if let Some(end) = range.end_time {
            query.push(("end_time", end.to_string()));
        }

        let request = self.authorize(self.client.get(self.url("/log/list")).query(&query));
        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("请求发送失败: {}", e))?;
        let response = Self::check_status(response).await?;

        // null 视为空页
        let records: Option<Vec<LogRecord>> = Self::read_json(response).await?;
        let records = records.unwrap_or_default();
        tracing::debug!("历史日志第 {} 页: {} 条", page, records.len());
        Ok(records)
    }

    async fn stream_token(&self) -> anyhow::Result<String> {
        let request = self.authorize(self.client.get(self.url("/log/stream-token")));
        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("请求发送失败: {}", e))?;
        let response = Self::check_status(response).await?;

        let token: Option<StreamTokenResponse> = Self::read_json(response).await?;
        match token {
            Some(t) if !t.token.is_empty() => Ok(t.token),
            _ => anyhow::bail!("响应中没有 token"),
        }
    }

    async fn open_stream(&self, token: &str) -> anyhow::Result<EventStream> {
        // 流式连接无法携带认证头，token 只能放在查询参数中
        let url = format!(
            "{}?token={}",
            self.url("/log/stream"),
            urlencoding::encode(token)
        );
        let response = self
            .stream_client
            .get(&url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("请求发送失败: {}", e))?;
        let response = Self::check_status(response).await?;

        let events = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let batch: Vec<anyhow::Result<SseEvent>> = match chunk {
                    Ok(bytes) => decoder.feed(&bytes).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(anyhow::anyhow!("读取数据失败: {}", e))],
                };
                futures::future::ready(Some(stream::iter(batch)))
            })
            .flatten()
            .boxed();
        Ok(events)
    }

    async fn purge(&self) -> anyhow::Result<()> {
        let request = self.authorize(self.client.delete(self.url("/log/clear")));
        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("请求发送失败: {}", e))?;
        let response = Self::check_status(response).await?;

        // 只关心业务错误码，data 内容忽略
        let _: Option<serde_json::Value> = Self::read_json(response).await?;
        tracing::info!("服务端日志已清空");
        Ok(())
    }
}
