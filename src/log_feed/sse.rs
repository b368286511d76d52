//! SSE (text/event-stream) 增量解码
//!
//! 网络分块可能在任意位置断开（包括行中间、`\r\n` 中间），
//! 解码器缓存未完成的行，遇到空行时产出一个事件。

use bytes::{Buf, BytesMut};

/// 一个完整的 SSE 事件
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// `event:` 字段，未指定时为 None（等同于 "message"）
    pub event: Option<String>,
    /// 多行 `data:` 以 `\n` 拼接
    pub data: String,
    /// `id:` 字段
    pub id: Option<String>,
}

impl SseEvent {
    /// 是否为默认的 message 事件
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// 增量 SSE 解码器
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    /// buffer 中已确认不含换行符的前缀长度
    scanned: usize,
    /// 上一块以 `\r` 结尾，下一块开头的 `\n` 属于同一个换行
    pending_cr: bool,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一块字节，返回本块内完成的所有事件
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut chunk = chunk;
        // 空块不能决定 `\r` 后面是否跟着 `\n`
        if self.pending_cr && !chunk.is_empty() {
            self.pending_cr = false;
            if chunk[0] == b'\n' {
                chunk = &chunk[1..];
            }
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            let Some(offset) = self.buffer[self.scanned..]
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r')
            else {
                self.scanned = self.buffer.len();
                break;
            };
            let line = self.buffer.split_to(self.scanned + offset);
            self.scanned = 0;
            let terminator = self.buffer[0];
            self.buffer.advance(1);

            if terminator == b'\r' {
                match self.buffer.first() {
                    Some(b'\n') => self.buffer.advance(1),
                    Some(_) => {}
                    // `\r` 恰好在块尾，等下一块再决定
                    None => self.pending_cr = true,
                }
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        // 注释行（常见于心跳）
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // retry 与未知字段对日志流没有意义
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data, id })
    }
}
