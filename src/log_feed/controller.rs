//! 日志流控制器
//!
//! 整合历史分页、实时推送和滚动加载：
//! - 启动时并发拉取第一页历史日志并打开实时流
//! - `load_more` 加载更早的一页，同一时间只允许一个请求
//! - `clear` 重置本地集合与分页游标（不影响服务端）
//!
//! 控制器在后台以单写者任务运行，所有对 [`LogStore`] 的修改都在该任务内串行执行；
//! 网络请求在独立任务中进行，结果通过 channel 送回。

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::api::{LogApi, TimeRange};
use super::error::FeedError;
use super::store::LogStore;
use super::subscriber::{ConnectionState, FeedEvent, LiveFeedSubscriber};
use crate::model::config::Config;
use crate::model::record::LogRecord;

/// 命令队列容量
const COMMAND_CAPACITY: usize = 64;
/// 实时事件队列容量
const FEED_CAPACITY: usize = 1024;

/// 控制器参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedOptions {
    /// 每页条数
    pub page_size: u32,
    /// 历史查询时间范围
    pub range: TimeRange,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            page_size: 20,
            range: TimeRange::default(),
        }
    }
}

impl FeedOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.effective_page_size(),
            range: TimeRange {
                start_time: config.start_time,
                end_time: config.end_time,
            },
        }
    }
}

/// 展示层可见的状态快照
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    /// 去重后按时间倒序排列的日志
    pub records: Vec<Arc<LogRecord>>,
    /// 实时流是否已连接
    pub is_connected: bool,
    pub connection: ConnectionState,
    /// 最近一次错误
    pub error: Option<FeedError>,
    /// 是否还有更早的历史页
    pub has_more: bool,
    /// 第一页历史日志加载中
    pub is_loading: bool,
    /// 更多历史日志加载中
    pub is_loading_more: bool,
}

enum Command {
    LoadMore,
    Clear,
    Refresh,
    Purge(oneshot::Sender<Result<(), FeedError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    Initial,
    More,
}

/// 后台请求的结果
enum Completion {
    Page {
        /// 发起请求时的代数，clear 之后旧结果作废
        generation: u64,
        page: u32,
        kind: PageKind,
        result: anyhow::Result<Vec<LogRecord>>,
    },
    Purged {
        result: anyhow::Result<()>,
        reply: oneshot::Sender<Result<(), FeedError>>,
    },
}

/// 日志流控制器
///
/// 创建即激活；drop 或 [`shutdown`](Self::shutdown) 时关闭实时连接并丢弃所有未完成请求的结果。
pub struct FeedController {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<FeedSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FeedController {
    /// 激活：并发拉取第一页历史日志并打开实时流
    pub fn start(api: Arc<dyn LogApi>, options: FeedOptions) -> Self {
        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (feed_tx, feed_rx) = mpsc::channel(FEED_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let store = LogStore::new();
        let (state_tx, state_rx) = watch::channel(FeedSnapshot {
            has_more: store.has_more(),
            ..Default::default()
        });

        LiveFeedSubscriber::new(api.clone(), feed_tx, cancel.child_token()).spawn();

        let actor = FeedActor {
            api,
            options,
            store,
            generation: 0,
            is_loading: false,
            is_loading_more: false,
            connection: ConnectionState::Connecting,
            error: None,
            state: state_tx,
            completions: completion_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run(command_rx, feed_rx, completion_rx));

        Self {
            commands: command_tx,
            state: state_rx,
            cancel,
            task: Some(task),
        }
    }

    /// 加载更早的一页历史日志
    ///
    /// 没有更多数据或已有请求在进行时不做任何事。
    pub fn load_more(&self) {
        self.send(Command::LoadMore);
    }

    /// 清空本地日志并重置分页游标
    pub fn clear(&self) {
        self.send(Command::Clear);
    }

    /// 清空后重新拉取第一页历史日志
    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    /// 清空服务端日志，成功后刷新本地集合
    pub async fn purge(&self) -> Result<(), FeedError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Purge(reply_tx))
            .await
            .map_err(|_| FeedError::Purge("控制器已停止".to_string()))?;
        reply_rx
            .await
            .map_err(|_| FeedError::Purge("控制器已停止".to_string()))?
    }

    /// 当前状态快照
    pub fn snapshot(&self) -> FeedSnapshot {
        self.state.borrow().clone()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.state.clone()
    }

    /// 停止控制器并等待后台任务退出
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("日志流控制器任务异常退出: {}", e);
            }
        }
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.try_send(command) {
            tracing::warn!("日志流控制器命令发送失败（队列已满或已关闭）: {}", e);
        }
    }
}

impl Drop for FeedController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 控制器后台任务，唯一持有并修改 [`LogStore`]
struct FeedActor {
    api: Arc<dyn LogApi>,
    options: FeedOptions,
    store: LogStore,
    generation: u64,
    is_loading: bool,
    is_loading_more: bool,
    connection: ConnectionState,
    error: Option<FeedError>,
    state: watch::Sender<FeedSnapshot>,
    completions: mpsc::UnboundedSender<Completion>,
    cancel: CancellationToken,
}

impl FeedActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut feed: mpsc::Receiver<FeedEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        self.fetch_initial();
        self.publish();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                Some(event) = feed.recv() => self.handle_feed_event(event),
                Some(completion) = completions.recv() => self.handle_completion(completion),
                else => break,
            }
            self.publish();
        }

        // 卸载后不再视为已连接
        if self.connection.is_connected() {
            self.connection = ConnectionState::Closed;
        }
        self.publish();
        tracing::debug!("日志流控制器已退出");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::LoadMore => self.load_more(),
            Command::Clear => self.reset(),
            Command::Refresh => {
                self.reset();
                self.fetch_initial();
            }
            Command::Purge(reply) => self.spawn_purge(reply),
        }
    }

    fn load_more(&mut self) {
        if !self.store.has_more() {
            tracing::debug!("没有更多历史日志，忽略 load_more");
            return;
        }
        if self.is_loading || self.is_loading_more {
            tracing::debug!("历史日志加载中，忽略 load_more");
            return;
        }

        self.is_loading_more = true;
        self.spawn_fetch(self.store.next_page(), PageKind::More);
    }

    fn fetch_initial(&mut self) {
        self.is_loading = true;
        self.spawn_fetch(1, PageKind::Initial);
    }

    /// 清空本地集合；之前发出的历史请求结果到达时会被丢弃
    fn reset(&mut self) {
        self.store.clear();
        self.generation += 1;
        self.is_loading = false;
        self.is_loading_more = false;
        if matches!(self.error, Some(FeedError::History(_)) | Some(FeedError::Purge(_))) {
            self.error = None;
        }
        tracing::debug!("本地日志已清空");
    }

    fn spawn_fetch(&self, page: u32, kind: PageKind) {
        let api = self.api.clone();
        let completions = self.completions.clone();
        let cancel = self.cancel.clone();
        let generation = self.generation;
        let FeedOptions { page_size, range } = self.options;

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = api.fetch_page(page, page_size, range) => result,
            };
            let _ = completions.send(Completion::Page {
                generation,
                page,
                kind,
                result,
            });
        });
    }

    fn spawn_purge(&self, reply: oneshot::Sender<Result<(), FeedError>>) {
        let api = self.api.clone();
        let completions = self.completions.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = api.purge() => result,
            };
            let _ = completions.send(Completion::Purged { result, reply });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Page {
                generation,
                page,
                kind,
                result,
            } => self.commit_page(generation, page, kind, result),
            Completion::Purged { result, reply } => {
                let outcome = match result {
                    Ok(()) => {
                        tracing::info!("服务端日志已清空，重新加载");
                        self.reset();
                        self.fetch_initial();
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("清空服务端日志失败: {}", e);
                        let error = FeedError::Purge(e.to_string());
                        self.error = Some(error.clone());
                        Err(error)
                    }
                };
                let _ = reply.send(outcome);
            }
        }
    }

    fn commit_page(
        &mut self,
        generation: u64,
        page: u32,
        kind: PageKind,
        result: anyhow::Result<Vec<LogRecord>>,
    ) {
        if generation != self.generation {
            tracing::debug!("丢弃过期的历史日志结果: 第 {} 页", page);
            return;
        }

        match kind {
            PageKind::Initial => self.is_loading = false,
            PageKind::More => self.is_loading_more = false,
        }

        let records = match result {
            Ok(records) => records,
            Err(e) => {
                // 游标不动，下次 load_more 重试同一页
                tracing::error!("加载历史日志第 {} 页失败: {}", page, e);
                self.error = Some(FeedError::History(e.to_string()));
                return;
            }
        };

        if page != self.store.next_page() {
            tracing::warn!(
                "历史日志页码不连续（期望第 {} 页，收到第 {} 页），丢弃",
                self.store.next_page(),
                page
            );
            return;
        }

        let count = records.len();
        let page_size = self.options.page_size;
        if self.store.pages_loaded() == 0 {
            self.store.initialize(records, page_size);
        } else {
            self.store.append_page(records, page_size);
        }
        if matches!(self.error, Some(FeedError::History(_))) {
            self.error = None;
        }
        tracing::debug!(
            "历史日志第 {} 页已合并: {} 条，共 {} 条，has_more={}",
            page,
            count,
            self.store.len(),
            self.store.has_more()
        );
    }

    fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Record(record) => {
                let id = record.id;
                if !self.store.insert_live(record) {
                    tracing::debug!("忽略重复的实时日志: #{}", id);
                }
            }
            FeedEvent::State(state) => {
                match &state {
                    ConnectionState::Open => {
                        if self.error.as_ref().is_some_and(FeedError::is_connection_error) {
                            self.error = None;
                        }
                    }
                    ConnectionState::Closed => self.error = Some(FeedError::Closed),
                    ConnectionState::Errored(e) => self.error = Some(e.clone()),
                    ConnectionState::Connecting => {}
                }
                self.connection = state;
            }
        }
    }

    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            records: self.store.records().to_vec(),
            is_connected: self.connection.is_connected(),
            connection: self.connection.clone(),
            error: self.error.clone(),
            has_more: self.store.has_more(),
            is_loading: self.is_loading,
            is_loading_more: self.is_loading_more,
        }
    }

    fn publish(&self) {
        self.state.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_feed::testing::{LiveSender, MockLogApi, live_event, raw_event, record};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn options(page_size: u32) -> FeedOptions {
        FeedOptions {
            page_size,
            range: TimeRange::default(),
        }
    }

    fn ids(snapshot: &FeedSnapshot) -> Vec<i64> {
        snapshot.records.iter().map(|r| r.id).collect()
    }

    async fn wait_until(
        rx: &mut watch::Receiver<FeedSnapshot>,
        condition: impl FnMut(&FeedSnapshot) -> bool,
    ) -> FeedSnapshot {
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(condition))
            .await
            .expect("等待状态超时")
            .expect("状态通道已关闭");
        snapshot.clone()
    }

    fn start(api: MockLogApi, page_size: u32) -> (Arc<MockLogApi>, FeedController) {
        let api = Arc::new(api);
        let controller = FeedController::start(api.clone(), options(page_size));
        (api, controller)
    }

    fn push(live: &LiveSender, record: LogRecord) {
        live.unbounded_send(live_event(&record)).unwrap();
    }

    #[tokio::test]
    async fn test_startup_merges_history_and_live() {
        let (api, live) = MockLogApi::new(vec![vec![record(1, 100), record(2, 90)]]);
        let (_api, controller) = start(api, 20);
        let mut rx = controller.subscribe();

        push(&live, record(3, 150));
        // 与历史页重叠的实时日志
        push(&live, record(2, 90));

        let snapshot = wait_until(&mut rx, |s| {
            s.records.len() == 3 && !s.is_loading && s.is_connected
        })
        .await;

        assert_eq!(ids(&snapshot), vec![3, 1, 2]);
        assert!(!snapshot.has_more);
        assert!(snapshot.error.is_none());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_double_load_more_fetches_once() {
        let gate = Arc::new(Semaphore::new(1));
        let (api, _live) = MockLogApi::new(vec![
            vec![record(4, 40), record(3, 30)],
            vec![record(2, 20)],
        ]);
        let (api, controller) = start(api.with_page_gate(gate.clone()), 2);
        let mut rx = controller.subscribe();

        wait_until(&mut rx, |s| !s.is_loading && s.records.len() == 2).await;

        controller.load_more();
        controller.load_more();
        wait_until(&mut rx, |s| s.is_loading_more).await;

        gate.add_permits(1);
        let snapshot = wait_until(&mut rx, |s| !s.is_loading_more && s.records.len() == 3).await;

        assert_eq!(api.fetch_calls(), vec![1, 2]);
        assert_eq!(ids(&snapshot), vec![4, 3, 2]);
        assert!(!snapshot.has_more);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_more_failure_keeps_cursor() {
        let (api, _live) = MockLogApi::new(vec![
            vec![record(4, 40), record(3, 30)],
            vec![record(2, 20), record(1, 10)],
        ]);
        let (api, controller) = start(api, 2);
        let mut rx = controller.subscribe();
        wait_until(&mut rx, |s| !s.is_loading && s.records.len() == 2).await;

        api.fail_next_fetches(1);
        controller.load_more();
        let snapshot = wait_until(&mut rx, |s| s.error.is_some() && !s.is_loading_more).await;
        assert!(matches!(snapshot.error, Some(FeedError::History(_))));
        assert_eq!(snapshot.records.len(), 2);
        assert!(snapshot.has_more);

        // 重试请求的是同一页
        controller.load_more();
        let snapshot = wait_until(&mut rx, |s| s.records.len() == 4).await;
        assert_eq!(api.fetch_calls(), vec![1, 2, 2]);
        assert_eq!(ids(&snapshot), vec![4, 3, 2, 1]);
        assert!(snapshot.error.is_none());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_more_noop_when_no_more() {
        let (api, _live) = MockLogApi::new(vec![vec![record(1, 10)]]);
        let (api, controller) = start(api, 20);
        let mut rx = controller.subscribe();
        let snapshot = wait_until(&mut rx, |s| !s.is_loading && s.records.len() == 1).await;
        assert!(!snapshot.has_more);

        controller.load_more();
        // 命令按顺序处理，refresh 发出请求时 load_more 已经处理完
        controller.refresh();
        tokio::time::timeout(Duration::from_secs(5), async {
            while api.fetch_calls().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("refresh 未发出请求");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(api.fetch_calls(), vec![1, 1]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_initial_failure_retried_by_load_more() {
        let (api, _live) = MockLogApi::new(vec![vec![record(2, 20), record(1, 10)]]);
        api.fail_next_fetches(1);
        let (api, controller) = start(api, 20);
        let mut rx = controller.subscribe();

        let snapshot = wait_until(&mut rx, |s| !s.is_loading && s.error.is_some()).await;
        assert!(snapshot.records.is_empty());
        assert!(snapshot.has_more);

        controller.load_more();
        let snapshot = wait_until(&mut rx, |s| s.records.len() == 2).await;
        assert_eq!(api.fetch_calls(), vec![1, 1]);
        assert!(!snapshot.has_more);
        assert!(snapshot.error.is_none());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_discards_in_flight_page() {
        let gate = Arc::new(Semaphore::new(1));
        let (api, _live) = MockLogApi::new(vec![
            vec![record(4, 40), record(3, 30)],
            vec![record(2, 20), record(1, 10)],
        ]);
        let (_api, controller) = start(api.with_page_gate(gate.clone()), 2);
        let mut rx = controller.subscribe();
        wait_until(&mut rx, |s| !s.is_loading && s.records.len() == 2).await;

        controller.load_more();
        wait_until(&mut rx, |s| s.is_loading_more).await;

        controller.clear();
        let snapshot = wait_until(&mut rx, |s| s.records.is_empty()).await;
        assert!(snapshot.has_more);
        assert!(!snapshot.is_loading_more);

        // 放行旧的第 2 页请求，其结果应被丢弃
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.snapshot().records.is_empty());

        // clear 之后从第一页重新开始
        gate.add_permits(1);
        controller.refresh();
        let snapshot = wait_until(&mut rx, |s| !s.is_loading && s.records.len() == 2).await;
        assert_eq!(ids(&snapshot), vec![4, 3]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_forgets_ids() {
        let (api, live) = MockLogApi::new(vec![vec![record(1, 100)]]);
        let (_api, controller) = start(api, 20);
        let mut rx = controller.subscribe();
        wait_until(&mut rx, |s| s.records.len() == 1 && s.is_connected).await;

        controller.clear();
        wait_until(&mut rx, |s| s.records.is_empty()).await;

        // 清空后同一 id 可以再次出现
        push(&live, record(1, 100));
        let snapshot = wait_until(&mut rx, |s| s.records.len() == 1).await;
        assert_eq!(ids(&snapshot), vec![1]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_token_failure_surfaces_error() {
        let (api, _live) = MockLogApi::new(vec![vec![record(1, 100)]]);
        let (api, controller) = start(api.with_token_error("forbidden"), 20);
        let mut rx = controller.subscribe();

        let snapshot = wait_until(&mut rx, |s| {
            s.connection.is_terminal() && !s.is_loading
        })
        .await;

        assert!(!snapshot.is_connected);
        assert_eq!(snapshot.error, Some(FeedError::Token("forbidden".to_string())));
        // 历史日志不受影响
        assert_eq!(ids(&snapshot), vec![1]);
        assert_eq!(api.open_calls(), 0);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_close_does_not_reconnect() {
        let (api, live) = MockLogApi::new(Vec::new());
        let (api, controller) = start(api, 20);
        let mut rx = controller.subscribe();
        wait_until(&mut rx, |s| s.is_connected).await;

        drop(live);
        let snapshot = wait_until(&mut rx, |s| s.connection == ConnectionState::Closed).await;
        assert!(!snapshot.is_connected);
        assert_eq!(snapshot.error, Some(FeedError::Closed));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.open_calls(), 1);
        assert!(!controller.snapshot().is_connected);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_live_frame_dropped() {
        let (api, live) = MockLogApi::new(Vec::new());
        let (_api, controller) = start(api, 20);
        let mut rx = controller.subscribe();
        wait_until(&mut rx, |s| s.is_connected && !s.is_loading).await;

        live.unbounded_send(Ok(raw_event("{broken"))).unwrap();
        push(&live, record(7, 700));

        let snapshot = wait_until(&mut rx, |s| s.records.len() == 1).await;
        assert_eq!(ids(&snapshot), vec![7]);
        assert!(snapshot.is_connected);
        assert!(snapshot.error.is_none());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_purge_reloads_from_server() {
        let (api, _live) = MockLogApi::new(vec![vec![record(2, 20), record(1, 10)]]);
        let (api, controller) = start(api, 20);
        let mut rx = controller.subscribe();
        wait_until(&mut rx, |s| !s.is_loading && s.records.len() == 2).await;

        api.set_pages(Vec::new());
        controller.purge().await.unwrap();
        let snapshot = wait_until(&mut rx, |s| !s.is_loading && s.records.is_empty()).await;

        assert_eq!(api.purge_calls(), 1);
        assert_eq!(api.fetch_calls(), vec![1, 1]);
        assert!(!snapshot.has_more);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_purge_failure_keeps_records() {
        let (api, _live) = MockLogApi::new(vec![vec![record(1, 10)]]);
        let (_api, controller) = start(api.with_purge_error("permission denied"), 20);
        let mut rx = controller.subscribe();
        wait_until(&mut rx, |s| !s.is_loading && s.records.len() == 1).await;

        let err = controller.purge().await.unwrap_err();
        assert_eq!(err, FeedError::Purge("permission denied".to_string()));
        let snapshot = wait_until(&mut rx, |s| s.error.is_some()).await;
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.error, Some(err));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_stream() {
        let (api, live) = MockLogApi::new(Vec::new());
        let (_api, controller) = start(api, 20);
        let mut rx = controller.subscribe();
        wait_until(&mut rx, |s| s.is_connected).await;

        controller.shutdown().await;
        assert!(!rx.borrow().is_connected);

        // 订阅任务随取消退出，实时流被 drop
        tokio::time::timeout(Duration::from_secs(5), async {
            while !live.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("实时流未关闭");
    }
}
