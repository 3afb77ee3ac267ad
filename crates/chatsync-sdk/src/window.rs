//! 消息窗口
//!
//! 单个频道的有序、去重消息窗口。这里只有纯数据操作，不做 I/O；
//! 并发串行化由引擎负责（所有修改都在同一把锁内完成）。
//!
//! 不变量：
//! - `messages` 内没有重复的 `id`
//! - `messages` 始终按 `created_at` 升序（相同时间戳保持到达顺序）
//! - `oldest_loaded_timestamp` 等于 `messages` 首条的 `created_at`

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::message::Message;
use crate::reconcile::{PendingMessage, PendingOutbox};

/// 窗口加载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowState {
    /// 未初始化
    Idle,
    /// 正在加载初始页
    LoadingInitial,
    /// 就绪
    Ready,
    /// 正在加载更早的历史
    LoadingOlder,
    /// 频道视图已关闭
    Closed,
}

impl WindowState {
    /// 是否接受发送和实时追加（Ready 或 LoadingOlder）
    pub fn is_ready(&self) -> bool {
        matches!(self, WindowState::Ready | WindowState::LoadingOlder)
    }
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowState::Idle => write!(f, "未初始化"),
            WindowState::LoadingInitial => write!(f, "加载初始页"),
            WindowState::Ready => write!(f, "就绪"),
            WindowState::LoadingOlder => write!(f, "加载历史"),
            WindowState::Closed => write!(f, "已关闭"),
        }
    }
}

/// 时间线条目：已确认消息或待确认的乐观消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineItem {
    Confirmed(Message),
    Pending(PendingMessage),
}

impl TimelineItem {
    pub fn is_pending(&self) -> bool {
        matches!(self, TimelineItem::Pending(_))
    }

    pub fn body(&self) -> &str {
        match self {
            TimelineItem::Confirmed(m) => &m.body,
            TimelineItem::Pending(p) => &p.body,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            TimelineItem::Confirmed(m) => &m.sender_id,
            TimelineItem::Pending(p) => &p.sender_id,
        }
    }
}

/// 窗口只读快照（供展示层渲染）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub channel_id: String,
    pub state: WindowState,
    pub messages: Vec<Message>,
    pub pending: Vec<PendingMessage>,
    pub oldest_loaded_timestamp: Option<u64>,
    pub has_more_history: bool,
    pub is_loading_initial: bool,
    pub is_loading_older: bool,
}

impl WindowSnapshot {
    /// 渲染顺序：已确认消息在前（升序），待确认消息按提交顺序排在末尾
    pub fn timeline(&self) -> Vec<TimelineItem> {
        self.messages
            .iter()
            .cloned()
            .map(TimelineItem::Confirmed)
            .chain(self.pending.iter().cloned().map(TimelineItem::Pending))
            .collect()
    }
}

/// 实时插入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 已存在相同 id，窗口未变化
    Duplicate,
    /// 插入到指定位置
    Inserted { index: usize },
}

/// 单频道消息窗口
#[derive(Debug)]
pub struct MessageWindow {
    messages: Vec<Message>,
    ids: HashSet<String>,
    outbox: PendingOutbox,
    oldest_loaded_timestamp: Option<u64>,
    has_more_history: bool,
    state: WindowState,
    /// 初始页加载期间先到的实时消息
    buffered_live: Vec<Message>,
}

impl Default for MessageWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageWindow {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            ids: HashSet::new(),
            outbox: PendingOutbox::new(),
            oldest_loaded_timestamp: None,
            has_more_history: true,
            state: WindowState::Idle,
            buffered_live: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn oldest_loaded_timestamp(&self) -> Option<u64> {
        self.oldest_loaded_timestamp
    }

    pub fn has_more_history(&self) -> bool {
        self.has_more_history
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    /// 切换状态，返回旧状态
    pub fn set_state(&mut self, state: WindowState) -> WindowState {
        std::mem::replace(&mut self.state, state)
    }

    pub fn is_loading_initial(&self) -> bool {
        self.state == WindowState::LoadingInitial
    }

    pub fn is_loading_older(&self) -> bool {
        self.state == WindowState::LoadingOlder
    }

    pub fn outbox_mut(&mut self) -> &mut PendingOutbox {
        &mut self.outbox
    }

    /// 用初始页替换窗口内容
    ///
    /// `has_more_history` 取决于存储返回的原始条数是否等于页大小。
    pub fn replace_with_page(&mut self, page: Vec<Message>, page_size: usize) {
        let fetched = page.len();
        let mut page = page;
        page.sort_by_key(|m| m.created_at);

        self.messages.clear();
        self.ids.clear();
        for message in page {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }
        self.has_more_history = fetched == page_size;
        self.refresh_cursor();
    }

    /// 按 `created_at` 有序插入；相同时间戳排在已有条目之后
    pub fn insert(&mut self, message: Message) -> InsertOutcome {
        if self.ids.contains(&message.id) {
            return InsertOutcome::Duplicate;
        }
        let index = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.ids.insert(message.id.clone());
        self.messages.insert(index, message);
        if index == 0 {
            self.refresh_cursor();
        }
        InsertOutcome::Inserted { index }
    }

    /// 合并一页更早的历史，返回实际新增的消息及其合并后的位置（按位置升序）
    ///
    /// 只接受严格早于 `cursor` 的消息。请求在途期间可能到达比游标更早的乱序实时消息，
    /// 所以这里做归并而不是简单前插；相同时间戳时历史消息排在已有条目之前。
    pub fn merge_older(
        &mut self,
        page: Vec<Message>,
        cursor: u64,
        page_size: usize,
    ) -> Vec<(usize, Message)> {
        let fetched = page.len();
        let mut accepted: Vec<Message> = Vec::with_capacity(fetched);
        for message in page {
            if message.created_at >= cursor {
                warn!(
                    "丢弃不早于游标的历史消息: id={}, created_at={}, cursor={}",
                    message.id, message.created_at, cursor
                );
                continue;
            }
            if self.ids.contains(&message.id) || accepted.iter().any(|m| m.id == message.id) {
                continue;
            }
            accepted.push(message);
        }
        accepted.sort_by_key(|m| m.created_at);

        let mut existing = std::mem::take(&mut self.messages).into_iter().peekable();
        let mut merged = Vec::with_capacity(accepted.len() + existing.len());
        let mut added = Vec::with_capacity(accepted.len());
        for message in accepted {
            while let Some(next) = existing.next_if(|m| m.created_at < message.created_at) {
                merged.push(next);
            }
            self.ids.insert(message.id.clone());
            added.push((merged.len(), message.clone()));
            merged.push(message);
        }
        merged.extend(existing);
        self.messages = merged;

        self.has_more_history = fetched == page_size;
        self.refresh_cursor();
        added
    }

    /// 淘汰最旧的消息直到不超过 `max_retained`，返回被淘汰的消息
    ///
    /// 淘汰只影响本地保留，不改变 `has_more_history`。
    pub fn evict_oldest(&mut self, max_retained: usize) -> Vec<Message> {
        if self.messages.len() <= max_retained {
            return Vec::new();
        }
        let excess = self.messages.len() - max_retained;
        let evicted: Vec<Message> = self.messages.drain(..excess).collect();
        for message in evicted.iter() {
            self.ids.remove(&message.id);
        }
        self.refresh_cursor();
        evicted
    }

    /// 缓冲初始页加载期间到达的实时消息
    pub fn buffer_live(&mut self, message: Message) -> bool {
        if self.buffered_live.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.buffered_live.push(message);
        true
    }

    pub fn take_buffered_live(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.buffered_live)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered_live.len()
    }

    /// 清空全部内容（频道关闭或初始化失败时）
    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.outbox.clear();
        self.buffered_live.clear();
        self.oldest_loaded_timestamp = None;
        self.has_more_history = true;
    }

    pub fn snapshot(&self, channel_id: &str) -> WindowSnapshot {
        WindowSnapshot {
            channel_id: channel_id.to_string(),
            state: self.state,
            messages: self.messages.clone(),
            pending: self.outbox.entries().to_vec(),
            oldest_loaded_timestamp: self.oldest_loaded_timestamp,
            has_more_history: self.has_more_history,
            is_loading_initial: self.is_loading_initial(),
            is_loading_older: self.is_loading_older(),
        }
    }

    fn refresh_cursor(&mut self) {
        self.oldest_loaded_timestamp = self.messages.first().map(|m| m.created_at);
    }
}
