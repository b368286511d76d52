//! 请求日志流
//!
//! 把分页历史日志和实时推送合并为一个按 id 去重、按时间倒序排列的集合：
//! - [`store`] 有序去重集合与分页游标
//! - [`sse`] SSE 增量解码
//! - [`api`] 日志服务端接口及 HTTP 实现
//! - [`subscriber`] 实时流订阅
//! - [`controller`] 对外的控制器

pub mod api;
pub mod controller;
pub mod error;
pub mod sse;
pub mod store;
pub mod subscriber;

#[cfg(test)]
mod testing;

pub use api::{HttpLogApi, LogApi, TimeRange};
pub use controller::{FeedController, FeedOptions, FeedSnapshot};
pub use error::FeedError;
pub use store::LogStore;
pub use subscriber::ConnectionState;
