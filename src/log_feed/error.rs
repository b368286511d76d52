//! 日志流对外暴露的错误状态

use thiserror::Error;

/// 日志流错误
///
/// 所有网络/解析错误都在产生处被捕获并转为此类型，
/// 通过快照暴露给展示层，不会向上抛出。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// 历史日志查询失败，分页状态不变，可重试
    #[error("加载历史日志失败: {0}")]
    History(String),

    /// 获取 stream token 失败，实时流未打开
    #[error("获取 stream token 失败: {0}")]
    Token(String),

    /// 实时流打开或读取失败
    #[error("实时日志流错误: {0}")]
    Stream(String),

    /// 服务端关闭了实时流
    #[error("实时日志流连接断开")]
    Closed,

    /// 服务端清空日志失败
    #[error("清空服务端日志失败: {0}")]
    Purge(String),
}

impl FeedError {
    /// 是否为实时连接相关的错误
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Token(_) | Self::Stream(_) | Self::Closed)
    }
}
