//! 进程内消息存储
//!
//! 供演示和测试使用：存储分配 UUID 消息 ID 和单调递增的逻辑时钟，
//! 追加后按顺序扇出给该频道的所有订阅者。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{MessageStore, StoreResult, Subscription};
use crate::error::StoreError;
use crate::message::{Message, MessageDraft};
use crate::utils::now_millis;

#[derive(Default)]
struct ChannelLog {
    /// 按 created_at 升序
    messages: Vec<Message>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Message>>,
}

#[derive(Default)]
struct StoreInner {
    channels: HashMap<String, ChannelLog>,
    /// 最近一次分配的逻辑时钟
    clock: u64,
    next_subscriber_id: u64,
}

impl StoreInner {
    fn next_timestamp(&mut self) -> u64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }
}

/// 内存消息存储
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 导入已有历史消息（不会推送给订阅者）
    pub fn seed(&self, channel_id: &str, messages: impl IntoIterator<Item = Message>) {
        let mut inner = self.inner.lock();
        let mut max_ts = inner.clock;
        let log = inner.channels.entry(channel_id.to_string()).or_default();
        for message in messages {
            if log.messages.iter().any(|m| m.id == message.id) {
                continue;
            }
            max_ts = max_ts.max(message.created_at);
            let pos = log
                .messages
                .partition_point(|m| m.created_at <= message.created_at);
            log.messages.insert(pos, message);
        }
        inner.clock = max_ts;
    }

    /// 当前频道的消息数量
    pub fn message_count(&self, channel_id: &str) -> usize {
        self.inner
            .lock()
            .channels
            .get(channel_id)
            .map(|log| log.messages.len())
            .unwrap_or(0)
    }

    /// 当前频道的活跃订阅数量
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.inner
            .lock()
            .channels
            .get(channel_id)
            .map(|log| log.subscribers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn fetch_recent(&self, channel_id: &str, limit: usize) -> StoreResult<Vec<Message>> {
        let inner = self.inner.lock();
        let Some(log) = inner.channels.get(channel_id) else {
            return Ok(Vec::new());
        };
        let start = log.messages.len().saturating_sub(limit);
        Ok(log.messages[start..].to_vec())
    }

    async fn fetch_before(
        &self,
        channel_id: &str,
        before: u64,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let inner = self.inner.lock();
        let Some(log) = inner.channels.get(channel_id) else {
            return Ok(Vec::new());
        };
        let end = log.messages.partition_point(|m| m.created_at < before);
        let start = end.saturating_sub(limit);
        Ok(log.messages[start..end].to_vec())
    }

    async fn append(&self, channel_id: &str, draft: MessageDraft) -> StoreResult<Message> {
        if draft.body.trim().is_empty() {
            return Err(StoreError::Rejected("message body is required".to_string()));
        }

        let mut inner = self.inner.lock();
        let created_at = inner.next_timestamp();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            body: draft.body,
            created_at,
            client_msg_id: Some(draft.client_msg_id),
        };

        let log = inner.channels.entry(channel_id.to_string()).or_default();
        log.messages.push(message.clone());
        log.subscribers
            .retain(|_, sender| sender.send(message.clone()).is_ok());

        debug!(
            "内存存储追加消息: channel_id={}, id={}, created_at={}, subscribers={}",
            channel_id,
            message.id,
            created_at,
            log.subscribers.len()
        );
        Ok(message)
    }

    async fn subscribe(&self, channel_id: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber_id = {
            let mut inner = self.inner.lock();
            let subscriber_id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner
                .channels
                .entry(channel_id.to_string())
                .or_default()
                .subscribers
                .insert(subscriber_id, tx);
            subscriber_id
        };

        let inner = Arc::downgrade(&self.inner);
        let channel = channel_id.to_string();
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = inner.upgrade() {
                if let Some(log) = inner.lock().channels.get_mut(&channel) {
                    log.subscribers.remove(&subscriber_id);
                }
            }
            debug!("内存存储取消订阅: channel_id={}, subscriber_id={}", channel, subscriber_id);
        }))
    }
}
