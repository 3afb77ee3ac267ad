//! 频道消息同步引擎
//!
//! 职责：
//! - 加载初始页并建立实时订阅
//! - 合并实时追加（幂等、有序）
//! - 向后分页加载更早的历史（同一时刻最多一个请求在途）
//! - 乐观发送与确认记录对账
//!
//! 并发模型：窗口的所有读-改-写都在同一把锁内同步完成，锁从不跨越 `.await`；
//! 存储 I/O 在锁外进行，期间实时推送可以任意穿插。
//!
//! ## NOTE: 引擎不做重试
//!
//! 没有幂等键的情况下自动重发会产生重复消息，所以失败一律返回给调用方，
//! 由展示层提供重试入口。

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ChatSyncConfig;
use crate::error::{ChatSyncError, Result};
use crate::events::{
    event_builders, EventFilter, EventManager, FetchPhase, FilteredEventReceiver, TimelineDiffKind,
};
use crate::message::{ChatUser, Message, MessageDraft};
use crate::reconcile::PendingMessage;
use crate::store::{MessageStore, Subscription};
use crate::utils::{millis_since, now_millis};
use crate::window::{InsertOutcome, MessageWindow, WindowSnapshot, WindowState};

/// 实时消息处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveOutcome {
    /// 已插入窗口；`reconciled` 表示替换了一条乐观消息
    Inserted { index: usize, reconciled: bool },
    /// 重复投递，窗口未变化
    Duplicate,
    /// 初始页加载中，先缓冲
    Buffered,
}

/// 加载更早历史的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOlderOutcome {
    Loaded {
        /// 存储返回的条数
        fetched: usize,
        /// 去重后实际新增的条数
        inserted: usize,
        has_more_history: bool,
    },
    /// 上游已无更早的消息
    NoMoreHistory,
    /// 已有一个历史请求在途
    AlreadyLoading,
}

/// 引擎与实时订阅任务共享的状态
struct Shared {
    channel_id: String,
    config: ChatSyncConfig,
    window: Mutex<MessageWindow>,
    event_manager: Arc<EventManager>,
}

impl Shared {
    fn emit_diff(&self, diff_kind: TimelineDiffKind) {
        self.event_manager
            .emit(event_builders::timeline_diff(&self.channel_id, diff_kind));
    }

    fn transition(&self, window: &mut MessageWindow, new_state: WindowState) {
        let old_state = window.set_state(new_state);
        if old_state != new_state {
            debug!(
                "窗口状态变更: channel_id={}, {} -> {}",
                self.channel_id, old_state, new_state
            );
            self.event_manager.emit(event_builders::load_state_changed(
                &self.channel_id,
                old_state,
                new_state,
            ));
        }
    }

    fn closed_error(&self) -> ChatSyncError {
        ChatSyncError::Closed(format!("channel {} is closed", self.channel_id))
    }

    /// 处理一条实时推送
    fn apply_live(&self, message: Message) -> Result<LiveOutcome> {
        let mut window = self.window.lock();
        match window.state() {
            state if state.is_ready() => Ok(self.insert_live(&mut window, message)),
            WindowState::LoadingInitial => {
                if window.buffer_live(message) {
                    Ok(LiveOutcome::Buffered)
                } else {
                    Ok(LiveOutcome::Duplicate)
                }
            }
            WindowState::Closed => Err(self.closed_error()),
            _ => Err(ChatSyncError::NotReady(format!(
                "channel {} is not initialized",
                self.channel_id
            ))),
        }
    }

    fn insert_live(&self, window: &mut MessageWindow, message: Message) -> LiveOutcome {
        if window.contains(&message.id) {
            debug!(
                "忽略重复的实时消息: channel_id={}, id={}",
                self.channel_id, message.id
            );
            return LiveOutcome::Duplicate;
        }

        let pending = window.outbox_mut().take_match(
            &message,
            self.config.reconcile_window_ms,
            now_millis(),
        );
        let outcome = self.insert_with_pending(window, message, pending);
        self.evict_if_needed(window);
        outcome
    }

    /// `append` 返回确认记录后，按已知的关联 ID 对账
    fn confirm_sent(&self, window: &mut MessageWindow, message: Message, client_msg_id: &str) {
        let pending = window.outbox_mut().remove(client_msg_id);
        if window.contains(&message.id) {
            // 实时推送已先一步送达
            if pending.is_some() {
                self.emit_diff(TimelineDiffKind::PendingRemoved {
                    client_msg_id: client_msg_id.to_string(),
                });
            }
            return;
        }
        self.insert_with_pending(window, message, pending);
        self.evict_if_needed(window);
    }

    fn insert_with_pending(
        &self,
        window: &mut MessageWindow,
        message: Message,
        pending: Option<PendingMessage>,
    ) -> LiveOutcome {
        match window.insert(message.clone()) {
            InsertOutcome::Inserted { index } => {
                let reconciled = pending.is_some();
                match pending {
                    Some(pending) => {
                        debug!(
                            "乐观消息已确认: channel_id={}, client_msg_id={}, id={}, elapsed_ms={}",
                            self.channel_id,
                            pending.client_msg_id,
                            message.id,
                            millis_since(pending.submitted_at)
                        );
                        self.emit_diff(TimelineDiffKind::PendingConfirmed {
                            client_msg_id: pending.client_msg_id,
                            index,
                            message,
                        })
                    }
                    None => self.emit_diff(TimelineDiffKind::Insert { index, message }),
                }
                LiveOutcome::Inserted { index, reconciled }
            }
            InsertOutcome::Duplicate => LiveOutcome::Duplicate,
        }
    }

    fn evict_if_needed(&self, window: &mut MessageWindow) {
        let Some(max_retained) = self.config.max_retained else {
            return;
        };
        let evicted = window.evict_oldest(max_retained);
        if !evicted.is_empty() {
            debug!(
                "淘汰最旧消息: channel_id={}, count={}, max_retained={}",
                self.channel_id,
                evicted.len(),
                max_retained
            );
            self.emit_diff(TimelineDiffKind::Evict {
                message_ids: evicted.into_iter().map(|m| m.id).collect(),
            });
        }
    }
}

struct LiveTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 单频道消息同步引擎
pub struct ChatSyncEngine {
    shared: Arc<Shared>,
    store: Arc<dyn MessageStore>,
    cancel: CancellationToken,
    live_task: Mutex<Option<LiveTask>>,
}

impl ChatSyncEngine {
    /// 创建引擎（尚未加载，状态为 Idle）
    pub fn new(
        channel_id: impl Into<String>,
        store: Arc<dyn MessageStore>,
        config: ChatSyncConfig,
        event_manager: Arc<EventManager>,
    ) -> Result<Self> {
        config.validate()?;
        let channel_id = channel_id.into();
        if channel_id.trim().is_empty() {
            return Err(ChatSyncError::InvalidInput("channel id is empty".into()));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                channel_id,
                config,
                window: Mutex::new(MessageWindow::new()),
                event_manager,
            }),
            store,
            cancel: CancellationToken::new(),
            live_task: Mutex::new(None),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.shared.channel_id
    }

    pub fn config(&self) -> &ChatSyncConfig {
        &self.shared.config
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.shared.event_manager
    }

    /// 只订阅本频道的事件
    pub fn subscribe_events(&self) -> FilteredEventReceiver {
        self.shared
            .event_manager
            .subscribe_filtered(EventFilter::new().with_channel_ids(vec![self.shared.channel_id.clone()]))
    }

    pub fn state(&self) -> WindowState {
        self.shared.window.lock().state()
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        self.shared.window.lock().snapshot(&self.shared.channel_id)
    }

    /// 当前已确认的消息（升序）
    pub fn messages(&self) -> Vec<Message> {
        self.shared.window.lock().messages().to_vec()
    }

    pub fn has_more_history(&self) -> bool {
        self.shared.window.lock().has_more_history()
    }

    /// 加载初始页并建立实时订阅
    ///
    /// 先订阅再拉取：两者之间追加的消息先缓冲，初始页到达后去重合并。
    /// 失败时窗口保持原样并回到 Idle，可以再次调用。
    pub async fn initialize(&self) -> Result<WindowSnapshot> {
        let channel_id = self.shared.channel_id.clone();
        let page_size = self.shared.config.page_size;

        {
            let mut window = self.shared.window.lock();
            match window.state() {
                WindowState::Idle => self.shared.transition(&mut window, WindowState::LoadingInitial),
                WindowState::LoadingInitial => {
                    return Err(ChatSyncError::NotReady(
                        "initial load already in flight".into(),
                    ))
                }
                WindowState::Closed => return Err(self.shared.closed_error()),
                // Ready / LoadingOlder
                _ => {
                    debug!("频道已初始化，跳过: channel_id={}", channel_id);
                    return Ok(window.snapshot(&channel_id));
                }
            }
        }

        info!("开始加载初始页: channel_id={}, page_size={}", channel_id, page_size);

        let subscription = match self.store.subscribe(&channel_id).await {
            Ok(subscription) => subscription,
            Err(e) => return Err(self.fail_initial(e.into_fetch_failed())),
        };
        if self.state() == WindowState::Closed {
            debug!("订阅建立时频道已关闭: channel_id={}", channel_id);
            return Err(self.shared.closed_error());
        }
        self.start_live_task(subscription);

        let result = self.store.fetch_recent(&channel_id, page_size).await;
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.stop_live_task().await;
                return Err(self.fail_initial(e.into_fetch_failed()));
            }
        };

        let mut window = self.shared.window.lock();
        if window.state() != WindowState::LoadingInitial {
            debug!("初始页返回时频道已关闭，丢弃结果: channel_id={}", channel_id);
            return Err(self.shared.closed_error());
        }

        window.replace_with_page(page, page_size);
        let buffered = window.take_buffered_live();
        let buffered_count = buffered.len();
        for message in buffered {
            window.insert(message);
        }
        if let Some(max_retained) = self.shared.config.max_retained {
            window.evict_oldest(max_retained);
        }

        self.shared.emit_diff(TimelineDiffKind::Reset {
            messages: window.messages().to_vec(),
        });
        self.shared.transition(&mut window, WindowState::Ready);

        info!(
            "初始页加载完成: channel_id={}, count={}, buffered_live={}, has_more_history={}",
            channel_id,
            window.len(),
            buffered_count,
            window.has_more_history()
        );
        Ok(window.snapshot(&channel_id))
    }

    /// 处理实时订阅推送的一条消息
    ///
    /// 通常由内部订阅任务调用；重复投递是幂等的。
    pub fn on_live_message(&self, message: Message) -> Result<LiveOutcome> {
        self.shared.apply_live(message)
    }

    /// 加载更早的一页历史
    ///
    /// 没有更多历史或已有请求在途时不做任何事；失败时窗口保持原样。
    pub async fn load_older(&self) -> Result<LoadOlderOutcome> {
        let channel_id = self.shared.channel_id.clone();
        let page_size = self.shared.config.page_size;

        let cursor = {
            let mut window = self.shared.window.lock();
            match window.state() {
                WindowState::Ready => {}
                WindowState::LoadingOlder => {
                    debug!("历史请求已在途，忽略: channel_id={}", channel_id);
                    return Ok(LoadOlderOutcome::AlreadyLoading);
                }
                WindowState::Closed => return Err(self.shared.closed_error()),
                WindowState::Idle | WindowState::LoadingInitial => {
                    return Err(ChatSyncError::NotReady(
                        "cannot load older messages before the initial load completes".into(),
                    ))
                }
            }
            if !window.has_more_history() {
                return Ok(LoadOlderOutcome::NoMoreHistory);
            }
            let Some(cursor) = window.oldest_loaded_timestamp() else {
                return Ok(LoadOlderOutcome::NoMoreHistory);
            };
            self.shared.transition(&mut window, WindowState::LoadingOlder);
            cursor
        };

        debug!(
            "加载更早历史: channel_id={}, before={}, limit={}",
            channel_id, cursor, page_size
        );
        let result = self.store.fetch_before(&channel_id, cursor, page_size).await;

        let mut window = self.shared.window.lock();
        if window.state() != WindowState::LoadingOlder {
            debug!("历史页返回时频道已关闭，丢弃结果: channel_id={}", channel_id);
            return Err(self.shared.closed_error());
        }

        match result {
            Ok(page) => {
                let fetched = page.len();
                let added = window.merge_older(page, cursor, page_size);
                let inserted = added.len();
                let at_head = added.iter().enumerate().all(|(i, (index, _))| i == *index);
                if at_head {
                    if !added.is_empty() {
                        self.shared.emit_diff(TimelineDiffKind::Prepend {
                            messages: added.into_iter().map(|(_, m)| m).collect(),
                        });
                    }
                } else {
                    // 有乱序实时消息落在历史页之间，逐条按最终位置插入
                    for (index, message) in added {
                        self.shared
                            .emit_diff(TimelineDiffKind::Insert { index, message });
                    }
                }
                self.shared.transition(&mut window, WindowState::Ready);

                let has_more_history = window.has_more_history();
                info!(
                    "历史页加载完成: channel_id={}, fetched={}, inserted={}, oldest={:?}, has_more_history={}",
                    channel_id,
                    fetched,
                    inserted,
                    window.oldest_loaded_timestamp(),
                    has_more_history
                );
                Ok(LoadOlderOutcome::Loaded {
                    fetched,
                    inserted,
                    has_more_history,
                })
            }
            Err(e) => {
                let err = e.into_fetch_failed();
                warn!("历史页加载失败: channel_id={}, error={}", channel_id, err);
                self.shared.transition(&mut window, WindowState::Ready);
                self.shared.event_manager.emit(event_builders::fetch_failed(
                    &channel_id,
                    FetchPhase::Older,
                    err.to_string(),
                ));
                Err(err)
            }
        }
    }

    /// 发送一条消息
    ///
    /// `user` 由调用方显式传入（已由外部身份服务解析并授权）。
    /// 开启乐观发送时，确认前窗口末尾会出现一条待确认消息。
    pub async fn send(&self, body: &str, user: &ChatUser) -> Result<Message> {
        let channel_id = self.shared.channel_id.clone();
        let config = &self.shared.config;

        let body = body.trim();
        if body.is_empty() {
            return Err(ChatSyncError::InvalidInput("message body is empty".into()));
        }
        if user.id.trim().is_empty() {
            return Err(ChatSyncError::InvalidInput("sender id is missing".into()));
        }

        let client_msg_id = Uuid::new_v4().to_string();
        let sender_name = user
            .display_name_or(&config.anonymous_sender_name)
            .to_string();

        {
            let mut window = self.shared.window.lock();
            match window.state() {
                state if state.is_ready() => {}
                WindowState::Closed => return Err(self.shared.closed_error()),
                _ => {
                    return Err(ChatSyncError::NotReady(
                        "cannot send before the initial load completes".into(),
                    ))
                }
            }
            if config.optimistic_send {
                let pending = PendingMessage {
                    client_msg_id: client_msg_id.clone(),
                    sender_id: user.id.clone(),
                    sender_name: sender_name.clone(),
                    body: body.to_string(),
                    submitted_at: now_millis(),
                };
                window.outbox_mut().push(pending.clone());
                self.shared
                    .emit_diff(TimelineDiffKind::PendingAdded { pending });
            }
        }

        let draft = MessageDraft {
            sender_id: user.id.clone(),
            sender_name,
            body: body.to_string(),
            client_msg_id: client_msg_id.clone(),
        };
        debug!(
            "提交消息: channel_id={}, client_msg_id={}, sender_id={}",
            channel_id, client_msg_id, draft.sender_id
        );
        let result = self.store.append(&channel_id, draft).await;

        let mut window = self.shared.window.lock();
        if window.state() == WindowState::Closed {
            debug!("发送返回时频道已关闭，不再更新窗口: channel_id={}", channel_id);
            return result.map_err(|e| e.into_send_failed());
        }

        match result {
            Ok(message) => {
                self.shared
                    .confirm_sent(&mut window, message.clone(), &client_msg_id);
                self.shared.event_manager.emit(event_builders::message_sent(
                    &channel_id,
                    &message.id,
                    &client_msg_id,
                ));
                info!(
                    "消息发送成功: channel_id={}, id={}, created_at={}",
                    channel_id, message.id, message.created_at
                );
                Ok(message)
            }
            Err(e) => {
                let err = e.into_send_failed();
                warn!(
                    "消息发送失败: channel_id={}, client_msg_id={}, error={}",
                    channel_id, client_msg_id, err
                );
                if window.outbox_mut().remove(&client_msg_id).is_some() {
                    self.shared.emit_diff(TimelineDiffKind::PendingRemoved {
                        client_msg_id: client_msg_id.clone(),
                    });
                }
                self.shared
                    .event_manager
                    .emit(event_builders::message_send_failed(
                        &channel_id,
                        &client_msg_id,
                        body,
                        err.to_string(),
                    ));
                Err(err)
            }
        }
    }

    /// 关闭频道视图：取消订阅（恰好一次）、丢弃窗口
    ///
    /// 在途的初始化 / 历史加载 / 发送返回后不会再修改窗口。可重复调用。
    pub async fn close(&self) {
        {
            let mut window = self.shared.window.lock();
            if window.state() == WindowState::Closed {
                return;
            }
            window.clear();
            self.shared.transition(&mut window, WindowState::Closed);
        }
        self.cancel.cancel();
        self.stop_live_task().await;
        info!("频道已关闭: channel_id={}", self.shared.channel_id);
    }

    fn fail_initial(&self, err: ChatSyncError) -> ChatSyncError {
        let mut window = self.shared.window.lock();
        if window.state() == WindowState::LoadingInitial {
            let dropped = window.take_buffered_live().len();
            self.shared.transition(&mut window, WindowState::Idle);
            self.shared.event_manager.emit(event_builders::fetch_failed(
                &self.shared.channel_id,
                FetchPhase::Initial,
                err.to_string(),
            ));
            error!(
                "初始页加载失败: channel_id={}, dropped_live={}, error={}",
                self.shared.channel_id, dropped, err
            );
        }
        err
    }

    fn start_live_task(&self, subscription: Subscription) {
        let token = self.cancel.child_token();
        let task_token = token.clone();
        let shared = self.shared.clone();

        let handle = tokio::spawn(async move {
            let mut subscription = subscription;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    next = subscription.recv() => match next {
                        Some(message) => {
                            if let Err(e) = shared.apply_live(message) {
                                debug!("丢弃实时消息: channel_id={}, reason={}", shared.channel_id, e);
                            }
                        }
                        None => {
                            warn!("实时订阅已结束: channel_id={}", shared.channel_id);
                            break;
                        }
                    },
                }
            }
            subscription.unsubscribe();
            debug!("实时订阅任务退出: channel_id={}", shared.channel_id);
        });

        let previous = self.live_task.lock().replace(LiveTask { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
    }

    async fn stop_live_task(&self) {
        let task = self.live_task.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!(
                    "实时订阅任务异常退出: channel_id={}, error={}",
                    self.shared.channel_id, e
                );
            }
        }
    }
}

impl Drop for ChatSyncEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ChatSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSyncEngine")
            .field("channel_id", &self.shared.channel_id)
            .field("state", &self.state())
            .finish()
    }
}
