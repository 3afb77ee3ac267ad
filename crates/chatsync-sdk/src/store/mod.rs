//! 消息存储协作者
//!
//! SDK 不拥有存储引擎和传输层，只依赖下面这个抽象契约：
//! - 按时间戳排序的只追加集合
//! - 范围查询（最近 N 条、游标之前 N 条）
//! - 每个频道按追加顺序、至少一次投递的订阅

mod memory;

pub use memory::InMemoryMessageStore;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::message::{Message, MessageDraft};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 外部消息存储
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 最近 `limit` 条消息（升序或降序均可，引擎会统一排序）
    async fn fetch_recent(&self, channel_id: &str, limit: usize) -> StoreResult<Vec<Message>>;

    /// 最多 `limit` 条 `created_at < before` 的消息
    async fn fetch_before(
        &self,
        channel_id: &str,
        before: u64,
        limit: usize,
    ) -> StoreResult<Vec<Message>>;

    /// 持久化追加，返回带存储分配 `id` / `created_at` 的规范记录
    async fn append(&self, channel_id: &str, draft: MessageDraft) -> StoreResult<Message>;

    /// 订阅频道的新追加记录（包括自己刚发送的消息）
    async fn subscribe(&self, channel_id: &str) -> StoreResult<Subscription>;
}

type UnsubscribeFn = Box<dyn FnOnce() + Send>;

/// 实时订阅句柄
///
/// 取消订阅回调最多执行一次：显式 `unsubscribe()` 或 drop 时触发。
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Message>,
    unsubscribe: Option<UnsubscribeFn>,
}

impl Subscription {
    pub fn new<F>(receiver: mpsc::UnboundedReceiver<Message>, unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            receiver,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// 接收下一条实时消息；发送端关闭后返回 None
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// 显式取消订阅
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            self.receiver.close();
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
