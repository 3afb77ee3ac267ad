//! 集成测试用的可编排存储
//!
//! 每个操作都可以被闸门挡住（模拟在途请求）或注入一次性失败；
//! 实时推送由测试手动触发。

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatsync_sdk::{
    ChatSyncConfig, ChatSyncEngine, EventManager, Message, MessageDraft, MessageStore, StoreError,
    StoreResult, Subscription,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};

pub const CHANNEL: &str = "public-chat";

/// 挡住一次存储调用，直到测试放行
#[derive(Clone)]
pub struct Gate {
    entered: Arc<Notify>,
    released: Arc<Semaphore>,
}

impl Gate {
    fn new() -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            released: Arc::new(Semaphore::new(0)),
        }
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.released.acquire().await {
            permit.forget();
        }
    }

    /// 等待被挡住的调用到达
    pub async fn wait_entered(&self) {
        tokio::time::timeout(Duration::from_secs(2), self.entered.notified())
            .await
            .expect("gated call never arrived");
    }

    pub fn release(&self) {
        self.released.add_permits(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Subscribe,
    FetchRecent,
    FetchBefore,
    Append,
}

#[derive(Default)]
struct State {
    messages: Vec<Message>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<Message>)>,
    next_subscriber_id: u64,
    next_seq: u64,
    clock: u64,
    scripted_appends: VecDeque<(String, u64)>,
    failures: Vec<Op>,
    gates: Vec<(Op, Gate)>,
    fetch_recent_calls: usize,
    fetch_before_calls: Vec<u64>,
    append_calls: usize,
}

#[derive(Clone)]
pub struct ScriptedStore {
    state: Arc<Mutex<State>>,
    unsubscribes: Arc<AtomicUsize>,
    /// 存储是否回显客户端关联 ID
    echo_client_id: bool,
    /// append 成功后是否同时经由订阅推送
    deliver_appends: bool,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
            echo_client_id: true,
            deliver_appends: true,
        }
    }

    pub fn without_client_echo(mut self) -> Self {
        self.echo_client_id = false;
        self
    }

    pub fn without_append_delivery(mut self) -> Self {
        self.deliver_appends = false;
        self
    }

    pub fn seed(&self, timestamps: &[u64]) {
        let mut state = self.state.lock();
        for ts in timestamps {
            state
                .messages
                .push(Message::new(format!("m{}", ts), "u9", "Bob", format!("msg {}", ts), *ts));
            state.clock = state.clock.max(*ts);
        }
        state.messages.sort_by_key(|m| m.created_at);
    }

    /// 下一次 append 使用指定的 id 和 created_at
    pub fn script_append(&self, id: &str, created_at: u64) {
        self.state
            .lock()
            .scripted_appends
            .push_back((id.to_string(), created_at));
    }

    pub fn fail_next(&self, op: Op) {
        self.state.lock().failures.push(op);
    }

    pub fn gate(&self, op: Op) -> Gate {
        let gate = Gate::new();
        self.state.lock().gates.push((op, gate.clone()));
        gate
    }

    /// 别人追加了一条消息：写入并推送
    pub fn push_live(&self, message: Message) {
        let mut state = self.state.lock();
        state.messages.push(message.clone());
        state.messages.sort_by_key(|m| m.created_at);
        state.clock = state.clock.max(message.created_at);
        Self::fan_out(&mut state, &message);
    }

    /// 只推送不写入（模拟至少一次投递的重复推送）
    pub fn redeliver(&self, message: Message) {
        Self::fan_out(&mut self.state.lock(), &message);
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn fetch_recent_calls(&self) -> usize {
        self.state.lock().fetch_recent_calls
    }

    pub fn fetch_before_calls(&self) -> Vec<u64> {
        self.state.lock().fetch_before_calls.clone()
    }

    pub fn append_calls(&self) -> usize {
        self.state.lock().append_calls
    }

    fn fan_out(state: &mut State, message: &Message) {
        state
            .subscribers
            .retain(|(_, tx)| tx.send(message.clone()).is_ok());
    }

    fn take_failure(&self, op: Op) -> StoreResult<()> {
        let mut state = self.state.lock();
        match state.failures.iter().position(|f| *f == op) {
            Some(pos) => {
                state.failures.remove(pos);
                Err(StoreError::Unavailable(format!("injected {:?} failure", op)))
            }
            None => Ok(()),
        }
    }

    async fn pass_gate(&self, op: Op) {
        let gate = {
            let mut state = self.state.lock();
            state
                .gates
                .iter()
                .position(|(o, _)| *o == op)
                .map(|pos| state.gates.remove(pos).1)
        };
        if let Some(gate) = gate {
            gate.pass().await;
        }
    }
}

#[async_trait]
impl MessageStore for ScriptedStore {
    async fn fetch_recent(&self, _channel_id: &str, limit: usize) -> StoreResult<Vec<Message>> {
        let page = {
            let mut state = self.state.lock();
            state.fetch_recent_calls += 1;
            let start = state.messages.len().saturating_sub(limit);
            // 倒序返回，引擎需要自行排序
            state.messages[start..].iter().rev().cloned().collect::<Vec<_>>()
        };
        self.pass_gate(Op::FetchRecent).await;
        self.take_failure(Op::FetchRecent)?;
        Ok(page)
    }

    async fn fetch_before(
        &self,
        _channel_id: &str,
        before: u64,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let page = {
            let mut state = self.state.lock();
            state.fetch_before_calls.push(before);
            let older: Vec<Message> = state
                .messages
                .iter()
                .filter(|m| m.created_at < before)
                .cloned()
                .collect();
            let start = older.len().saturating_sub(limit);
            older[start..].to_vec()
        };
        self.pass_gate(Op::FetchBefore).await;
        self.take_failure(Op::FetchBefore)?;
        Ok(page)
    }

    async fn append(&self, _channel_id: &str, draft: MessageDraft) -> StoreResult<Message> {
        self.state.lock().append_calls += 1;
        if let Err(e) = self.take_failure(Op::Append) {
            self.pass_gate(Op::Append).await;
            return Err(e);
        }

        let message = {
            let mut state = self.state.lock();
            let (id, created_at) = match state.scripted_appends.pop_front() {
                Some(scripted) => scripted,
                None => {
                    state.next_seq += 1;
                    (format!("s{}", state.next_seq), state.clock + 1)
                }
            };
            state.clock = state.clock.max(created_at);
            let mut message =
                Message::new(id, draft.sender_id, draft.sender_name, draft.body, created_at);
            if self.echo_client_id {
                message.client_msg_id = Some(draft.client_msg_id);
            }
            state.messages.push(message.clone());
            state.messages.sort_by_key(|m| m.created_at);
            if self.deliver_appends {
                Self::fan_out(&mut state, &message);
            }
            message
        };
        // 闸门在推送之后：测试可以让实时推送先于 append 返回
        self.pass_gate(Op::Append).await;
        Ok(message)
    }

    async fn subscribe(&self, _channel_id: &str) -> StoreResult<Subscription> {
        self.pass_gate(Op::Subscribe).await;
        self.take_failure(Op::Subscribe)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            state.next_subscriber_id += 1;
            let id = state.next_subscriber_id;
            state.subscribers.push((id, tx));
            id
        };
        let state = Arc::downgrade(&self.state);
        let unsubscribes = self.unsubscribes.clone();
        Ok(Subscription::new(rx, move || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
            if let Some(state) = state.upgrade() {
                state.lock().subscribers.retain(|(sid, _)| *sid != id);
            }
        }))
    }
}

pub fn engine(store: &ScriptedStore, config: ChatSyncConfig) -> Arc<ChatSyncEngine> {
    Arc::new(
        ChatSyncEngine::new(
            CHANNEL,
            Arc::new(store.clone()),
            config,
            Arc::new(EventManager::new(256)),
        )
        .expect("valid engine"),
    )
}

pub fn page_size(n: usize) -> ChatSyncConfig {
    ChatSyncConfig::builder().page_size(n).build().expect("valid config")
}

pub fn timestamps(messages: &[Message]) -> Vec<u64> {
    messages.iter().map(|m| m.created_at).collect()
}

pub fn other(id: &str, created_at: u64) -> Message {
    Message::new(id, "u9", "Bob", format!("msg {}", id), created_at)
}

/// 轮询直到条件成立（实时推送在后台任务里处理）
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn assert_sorted_unique(messages: &[Message]) {
    for pair in messages.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at, "not sorted: {:?}", timestamps(messages));
    }
    let mut ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), messages.len(), "duplicate ids");
}
