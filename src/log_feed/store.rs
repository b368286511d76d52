//! 日志内存存储
//!
//! 历史分页与实时推送的记录都汇入这里：
//! - 按 id 去重（同一条日志无论从哪个来源、投递几次都只保留一份）
//! - 按时间倒序排列，时间相同的保持插入顺序
//! - 记录分页游标和 has_more 状态

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::record::LogRecord;

/// 去重、有序的日志集合
///
/// 所有操作同步完成且不会失败；输入合法性由调用方保证。
#[derive(Debug)]
pub struct LogStore {
    /// 按时间倒序排列的日志
    records: Vec<Arc<LogRecord>>,
    /// 已见过的日志 ID
    ids: HashSet<i64>,
    /// 是否还有更早的历史页
    has_more: bool,
    /// 已成功加载的历史页数
    pages_loaded: u32,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            ids: HashSet::new(),
            has_more: true,
            pages_loaded: 0,
        }
    }

    /// 用第一页历史日志初始化
    ///
    /// 已存在的 id（例如先到的实时日志）会被跳过。
    pub fn initialize(&mut self, records: Vec<LogRecord>, page_size: u32) {
        self.has_more = is_full_page(records.len(), page_size);
        self.pages_loaded = 1;
        self.merge(records);
    }

    /// 追加一页更早的历史日志
    pub fn append_page(&mut self, records: Vec<LogRecord>, page_size: u32) {
        self.has_more = is_full_page(records.len(), page_size);
        self.pages_loaded += 1;
        self.merge(records);
    }

    /// 插入一条实时推送的日志
    ///
    /// 插到第一条时间严格更早的记录之前，与到达顺序无关。
    /// 返回 false 表示 id 已存在，集合未变化。
    pub fn insert_live(&mut self, record: LogRecord) -> bool {
        if !self.ids.insert(record.id) {
            return false;
        }

        let idx = self
            .records
            .iter()
            .position(|r| r.timestamp < record.timestamp)
            .unwrap_or(self.records.len());
        self.records.insert(idx, Arc::new(record));
        true
    }

    /// 清空所有日志并重置分页状态
    pub fn clear(&mut self) {
        self.records.clear();
        self.ids.clear();
        self.has_more = true;
        self.pages_loaded = 0;
    }

    pub fn records(&self) -> &[Arc<LogRecord>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn pages_loaded(&self) -> u32 {
        self.pages_loaded
    }

    /// 下一次历史查询应请求的页码（从 1 开始）
    pub fn next_page(&self) -> u32 {
        self.pages_loaded + 1
    }

    /// 合并一批记录：去重后整体按时间倒序稳定排序
    fn merge(&mut self, records: Vec<LogRecord>) {
        let before = self.records.len();
        for record in records {
            if self.ids.insert(record.id) {
                self.records.push(Arc::new(record));
            }
        }

        if self.records.len() == before {
            return;
        }

        // sort_by 是稳定排序，时间相同的记录保持插入顺序
        self.records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }
}

fn is_full_page(len: usize, page_size: u32) -> bool {
    len >= page_size as usize
}
