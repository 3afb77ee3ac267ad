//! 事件系统模块 - 展示层通过事件感知窗口变化
//!
//! 功能包括：
//! - 时间线差异（初始页重置、实时插入、历史前插、淘汰、乐观消息增删与确认）
//! - 加载状态变更
//! - 拉取失败 / 发送失败通知（携带可重试的正文）
//! - 事件广播和订阅机制
//!
//! 广播在窗口锁内同步发出，订阅者收到的事件顺序与窗口修改顺序一致。
//! 因此监听器回调里不要同步调用引擎的方法。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::message::Message;
use crate::reconcile::PendingMessage;
use crate::window::WindowState;

/// 拉取阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchPhase {
    /// 初始页
    Initial,
    /// 更早的历史页
    Older,
}

/// 时间线差异类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineDiffKind {
    /// 重置整个时间线（初始页加载完成）
    Reset { messages: Vec<Message> },
    /// 在指定位置插入一条已确认消息
    Insert { index: usize, message: Message },
    /// 在时间线头部插入更早的消息（已按 created_at 升序）
    Prepend { messages: Vec<Message> },
    /// 淘汰最旧的消息
    Evict { message_ids: Vec<String> },
    /// 追加一条乐观消息
    PendingAdded { pending: PendingMessage },
    /// 乐观消息被确认记录替换
    PendingConfirmed {
        client_msg_id: String,
        index: usize,
        message: Message,
    },
    /// 乐观消息被移除（发送失败，或确认记录已在窗口中）
    PendingRemoved { client_msg_id: String },
}

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChatEvent {
    /// 时间线差异
    TimelineDiff {
        channel_id: String,
        diff_kind: TimelineDiffKind,
        timestamp: u64,
    },
    /// 加载状态变更
    LoadStateChanged {
        channel_id: String,
        old_state: WindowState,
        new_state: WindowState,
        timestamp: u64,
    },
    /// 拉取失败
    FetchFailed {
        channel_id: String,
        phase: FetchPhase,
        error: String,
        timestamp: u64,
    },
    /// 消息发送成功
    MessageSent {
        channel_id: String,
        message_id: String,
        client_msg_id: String,
        timestamp: u64,
    },
    /// 消息发送失败（body 用于展示重试入口）
    MessageSendFailed {
        channel_id: String,
        client_msg_id: String,
        body: String,
        error: String,
        timestamp: u64,
    },
}

impl ChatEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            ChatEvent::TimelineDiff { .. } => "timeline_diff",
            ChatEvent::LoadStateChanged { .. } => "load_state_changed",
            ChatEvent::FetchFailed { .. } => "fetch_failed",
            ChatEvent::MessageSent { .. } => "message_sent",
            ChatEvent::MessageSendFailed { .. } => "message_send_failed",
        }
    }

    /// 获取事件关联的频道ID
    pub fn channel_id(&self) -> &str {
        match self {
            ChatEvent::TimelineDiff { channel_id, .. }
            | ChatEvent::LoadStateChanged { channel_id, .. }
            | ChatEvent::FetchFailed { channel_id, .. }
            | ChatEvent::MessageSent { channel_id, .. }
            | ChatEvent::MessageSendFailed { channel_id, .. } => channel_id,
        }
    }

    /// 获取事件时间戳（UTC 毫秒）
    pub fn timestamp(&self) -> u64 {
        match self {
            ChatEvent::TimelineDiff { timestamp, .. }
            | ChatEvent::LoadStateChanged { timestamp, .. }
            | ChatEvent::FetchFailed { timestamp, .. }
            | ChatEvent::MessageSent { timestamp, .. }
            | ChatEvent::MessageSendFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 频道ID过滤器
    pub channel_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加事件类型过滤
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// 添加频道ID过滤
    pub fn with_channel_ids(mut self, channel_ids: Vec<String>) -> Self {
        self.channel_ids = Some(channel_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &ChatEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(ref channel_ids) = self.channel_ids {
            if !channel_ids.iter().any(|c| c == event.channel_id()) {
                return false;
            }
        }
        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&ChatEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<u64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<ChatEvent>,
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<Mutex<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(Mutex::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: ChatEvent) {
        debug!("Emitting event: {} channel_id={}", event.event_type(), event.channel_id());

        {
            let mut stats = self.stats.lock();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败（如无 UI 的客户端），属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read();
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    /// 订阅匹配过滤器的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器（event_type 为 "*" 时接收全部事件）
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));

        self.stats.lock().listener_count = listeners.values().map(|v| v.len()).sum();
        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.lock().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.lock().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<ChatEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<ChatEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<ChatEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<ChatEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;
    use crate::utils::now_millis;

    pub fn timeline_diff(channel_id: &str, diff_kind: TimelineDiffKind) -> ChatEvent {
        ChatEvent::TimelineDiff {
            channel_id: channel_id.to_string(),
            diff_kind,
            timestamp: now_millis(),
        }
    }

    pub fn load_state_changed(
        channel_id: &str,
        old_state: WindowState,
        new_state: WindowState,
    ) -> ChatEvent {
        ChatEvent::LoadStateChanged {
            channel_id: channel_id.to_string(),
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }

    pub fn fetch_failed(channel_id: &str, phase: FetchPhase, error: String) -> ChatEvent {
        ChatEvent::FetchFailed {
            channel_id: channel_id.to_string(),
            phase,
            error,
            timestamp: now_millis(),
        }
    }

    pub fn message_sent(channel_id: &str, message_id: &str, client_msg_id: &str) -> ChatEvent {
        ChatEvent::MessageSent {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            client_msg_id: client_msg_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn message_send_failed(
        channel_id: &str,
        client_msg_id: &str,
        body: &str,
        error: String,
    ) -> ChatEvent {
        ChatEvent::MessageSendFailed {
            channel_id: channel_id.to_string(),
            client_msg_id: client_msg_id.to_string(),
            body: body.to_string(),
            error,
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(100);
        let mut receiver = manager.subscribe();

        manager.emit(event_builders::load_state_changed(
            "room",
            WindowState::Idle,
            WindowState::LoadingInitial,
        ));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "load_state_changed");
        assert_eq!(received.channel_id(), "room");

        let stats = manager.get_stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("load_state_changed"), Some(&1));
    }

    #[tokio::test]
    async fn test_event_filter() {
        let manager = EventManager::new(100);
        let filter = EventFilter::new()
            .with_event_types(vec!["fetch_failed".to_string()])
            .with_channel_ids(vec!["room".to_string()]);
        let mut filtered = manager.subscribe_filtered(filter);

        manager.emit(event_builders::fetch_failed("other", FetchPhase::Initial, "x".into()));
        manager.emit(event_builders::load_state_changed(
            "room",
            WindowState::LoadingInitial,
            WindowState::Idle,
        ));
        manager.emit(event_builders::fetch_failed("room", FetchPhase::Older, "boom".into()));

        match filtered.recv().await.unwrap() {
            ChatEvent::FetchFailed { channel_id, phase, error, .. } => {
                assert_eq!(channel_id, "room");
                assert_eq!(phase, FetchPhase::Older);
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(filtered.try_recv().is_err());
    }

    #[test]
    fn test_event_listeners() {
        let manager = EventManager::new(100);
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let typed_clone = typed.clone();
        manager.add_listener("message_sent", move |_event| {
            typed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let all_clone = all.clone();
        manager.add_listener("*", move |_event| {
            all_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(manager.get_stats().listener_count, 2);

        for _ in 0..3 {
            manager.emit(event_builders::message_sent("room", "m1", "c1"));
        }
        manager.emit(event_builders::fetch_failed("room", FetchPhase::Initial, "x".into()));

        assert_eq!(typed.load(Ordering::SeqCst), 3);
        assert_eq!(all.load(Ordering::SeqCst), 4);

        manager.clear_listeners();
        assert_eq!(manager.get_stats().listener_count, 0);
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let manager = EventManager::new(4);
        assert_eq!(manager.subscriber_count(), 0);
        manager.emit(event_builders::message_send_failed("room", "c1", "hi", "down".into()));
        assert_eq!(manager.get_stats().total_events, 1);
    }
}
