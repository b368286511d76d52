//! 实时日志订阅
//!
//! 先用认证请求换取一次性 token，再用 token 打开 SSE 流。
//! 每个 message 事件解析为一条日志发往控制器；解析失败的帧记录日志后丢弃。
//!
//! 连接出错或被关闭后不会自动重连，需要重新创建控制器。

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::api::LogApi;
use super::error::FeedError;
use super::sse::SseEvent;
use crate::common::one_line_preview;
use crate::model::record::LogRecord;

/// 实时连接状态
///
/// `Connecting → Open → {Closed | Errored}`，后两者为终态。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Open,
    Closed,
    Errored(FeedError),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Errored(_))
    }
}

/// 订阅者发往控制器的消息
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    State(ConnectionState),
    Record(LogRecord),
}

/// 实时日志订阅者
///
/// 一个实例对应一次订阅生命周期，最多打开一个连接。
pub struct LiveFeedSubscriber {
    api: Arc<dyn LogApi>,
    events: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
}

impl LiveFeedSubscriber {
    pub fn new(
        api: Arc<dyn LogApi>,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            events,
            cancel,
        }
    }

    /// 在后台任务中运行
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        if !self.emit(FeedEvent::State(ConnectionState::Connecting)).await {
            return;
        }

        let token = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!("实时日志订阅已取消（等待 token 时）");
                return;
            }
            result = self.api.stream_token() => result,
        };
        let token = match token {
            Ok(token) => token,
            Err(e) => {
                tracing::error!("获取 stream token 失败: {}", e);
                self.fail(FeedError::Token(e.to_string())).await;
                return;
            }
        };

        // token 返回时消费者可能已经离开，此时不能再打开流
        if self.cancel.is_cancelled() {
            tracing::debug!("实时日志订阅已取消，放弃打开流");
            return;
        }

        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!("实时日志订阅已取消（打开流时）");
                return;
            }
            result = self.api.open_stream(&token) => result,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("打开实时日志流失败: {}", e);
                self.fail(FeedError::Stream(e.to_string())).await;
                return;
            }
        };

        tracing::info!("实时日志流已连接");
        if !self.emit(FeedEvent::State(ConnectionState::Open)).await {
            return;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // stream 随函数返回被 drop，连接随之关闭
                    tracing::debug!("实时日志订阅已取消，关闭连接");
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if !self.handle_event(event).await {
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("实时日志流错误: {}", e);
                    self.fail(FeedError::Stream(e.to_string())).await;
                    return;
                }
                None => {
                    tracing::warn!("实时日志流已被服务端关闭");
                    self.emit(FeedEvent::State(ConnectionState::Closed)).await;
                    return;
                }
            }
        }
    }

    /// 处理一个 SSE 事件，返回 false 表示控制器已经不在
    async fn handle_event(&self, event: SseEvent) -> bool {
        if !event.is_message() {
            tracing::debug!("忽略非 message 事件: {:?}", event.event);
            return true;
        }

        match serde_json::from_str::<LogRecord>(&event.data) {
            Ok(record) => self.emit(FeedEvent::Record(record)).await,
            Err(e) => {
                tracing::warn!(
                    "解析日志数据失败 (event id: {}): {}，内容: {}",
                    event.id.as_deref().unwrap_or("-"),
                    e,
                    one_line_preview(&event.data, 200)
                );
                true
            }
        }
    }

    async fn fail(&self, error: FeedError) {
        self.emit(FeedEvent::State(ConnectionState::Errored(error)))
            .await;
    }

    async fn emit(&self, event: FeedEvent) -> bool {
        if self.events.send(event).await.is_err() {
            tracing::debug!("控制器已退出，停止实时日志订阅");
            return false;
        }
        true
    }
}
