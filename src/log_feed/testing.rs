//! 测试用的模拟日志服务端

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use tokio::sync::Semaphore;

use super::api::{EventStream, LogApi, TimeRange};
use super::sse::SseEvent;
use crate::model::record::LogRecord;

/// 测试端持有的实时流发送端，drop 后流结束
pub type LiveSender = UnboundedSender<anyhow::Result<SseEvent>>;

/// 模拟日志服务端
///
/// - 历史页按页码返回预设数据，超出范围返回空页
/// - 可注入失败次数、用信号量卡住请求
/// - 实时流由测试通过 [`LiveSender`] 推送
pub struct MockLogApi {
    pages: Mutex<Vec<Vec<LogRecord>>>,
    page_failures: AtomicUsize,
    page_gate: Option<Arc<Semaphore>>,
    fetch_calls: Mutex<Vec<u32>>,
    token_error: Option<String>,
    token_gate: Option<Arc<Semaphore>>,
    stream: Mutex<Option<UnboundedReceiver<anyhow::Result<SseEvent>>>>,
    open_calls: AtomicUsize,
    purge_calls: AtomicUsize,
    purge_error: Option<String>,
}

impl MockLogApi {
    pub fn new(pages: Vec<Vec<LogRecord>>) -> (Self, LiveSender) {
        let (tx, rx) = unbounded();
        let api = Self {
            pages: Mutex::new(pages),
            page_failures: AtomicUsize::new(0),
            page_gate: None,
            fetch_calls: Mutex::new(Vec::new()),
            token_error: None,
            token_gate: None,
            stream: Mutex::new(Some(rx)),
            open_calls: AtomicUsize::new(0),
            purge_calls: AtomicUsize::new(0),
            purge_error: None,
        };
        (api, tx)
    }

    /// 历史查询需先从信号量获取许可
    pub fn with_page_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.page_gate = Some(gate);
        self
    }

    pub fn with_token_error(mut self, message: &str) -> Self {
        self.token_error = Some(message.to_string());
        self
    }

    /// token 请求需先从信号量获取许可
    pub fn with_token_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.token_gate = Some(gate);
        self
    }

    pub fn with_purge_error(mut self, message: &str) -> Self {
        self.purge_error = Some(message.to_string());
        self
    }

    /// 接下来的 n 次历史查询失败
    pub fn fail_next_fetches(&self, n: usize) {
        self.page_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_pages(&self, pages: Vec<Vec<LogRecord>>) {
        *self.pages.lock().unwrap() = pages;
    }

    pub fn fetch_calls(&self) -> Vec<u32> {
        self.fetch_calls.lock().unwrap().clone()
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn purge_calls(&self) -> usize {
        self.purge_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogApi for MockLogApi {
    async fn fetch_page(
        &self,
        page: u32,
        _page_size: u32,
        _range: TimeRange,
    ) -> anyhow::Result<Vec<LogRecord>> {
        self.fetch_calls.lock().unwrap().push(page);

        if let Some(gate) = &self.page_gate {
            gate.acquire().await?.forget();
        }

        let remaining = self.page_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.page_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("模拟网络错误");
        }

        let pages = self.pages.lock().unwrap();
        Ok(pages
            .get(page.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default())
    }

    async fn stream_token(&self) -> anyhow::Result<String> {
        if let Some(gate) = &self.token_gate {
            gate.acquire().await?.forget();
        }
        match &self.token_error {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok("mock-token".to_string()),
        }
    }

    async fn open_stream(&self, token: &str) -> anyhow::Result<EventStream> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(token, "mock-token");
        let rx = self
            .stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("实时流已被打开过"))?;
        Ok(rx.boxed())
    }

    async fn purge(&self) -> anyhow::Result<()> {
        self.purge_calls.fetch_add(1, Ordering::SeqCst);
        match &self.purge_error {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(()),
        }
    }
}

pub fn record(id: i64, time: i64) -> LogRecord {
    LogRecord {
        id,
        timestamp: time,
        request_model_name: "claude-sonnet-4".to_string(),
        channel_id: 1,
        channel_name: "anthropic".to_string(),
        actual_model_name: "claude-sonnet-4-20250514".to_string(),
        input_tokens: 100,
        output_tokens: 20,
        first_token_latency_ms: 300,
        total_latency_ms: 1200,
        cost: 0.002,
        request_body: "{}".to_string(),
        response_body: "{}".to_string(),
        error: None,
    }
}

/// 把一条日志编码为 SSE message 事件
pub fn live_event(record: &LogRecord) -> anyhow::Result<SseEvent> {
    Ok(raw_event(&serde_json::to_string(record).unwrap()))
}

pub fn raw_event(data: &str) -> SseEvent {
    SseEvent {
        event: None,
        data: data.to_string(),
        id: None,
    }
}
