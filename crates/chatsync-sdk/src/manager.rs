//! 频道管理器
//!
//! 按频道 ID 持有同步引擎，所有频道共用一个存储和一个事件管理器。

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ChatSyncConfig;
use crate::engine::ChatSyncEngine;
use crate::error::Result;
use crate::events::{ChatEvent, EventManager};
use crate::store::MessageStore;

/// 默认的公共聊天频道
pub const PUBLIC_CHAT_CHANNEL: &str = "public-chat";

pub struct ChatSyncManager {
    store: Arc<dyn MessageStore>,
    config: ChatSyncConfig,
    event_manager: Arc<EventManager>,
    channels: RwLock<HashMap<String, Arc<ChatSyncEngine>>>,
}

impl ChatSyncManager {
    pub fn new(store: Arc<dyn MessageStore>, config: ChatSyncConfig) -> Result<Self> {
        config.validate()?;
        let event_manager = Arc::new(EventManager::new(config.event_capacity));
        Ok(Self {
            store,
            config,
            event_manager,
            channels: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ChatSyncConfig {
        &self.config
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.event_manager
    }

    /// 订阅所有频道的事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_manager.subscribe()
    }

    /// 打开频道并完成初始加载
    ///
    /// 已打开的频道直接返回；初始化失败时引擎保留在 Idle 状态，再次调用会重试。
    pub async fn open_channel(&self, channel_id: &str) -> Result<Arc<ChatSyncEngine>> {
        let engine = self.get_or_create(channel_id)?;
        engine.initialize().await?;
        Ok(engine)
    }

    pub async fn open_public_chat(&self) -> Result<Arc<ChatSyncEngine>> {
        self.open_channel(PUBLIC_CHAT_CHANNEL).await
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<Arc<ChatSyncEngine>> {
        self.channels.read().get(channel_id).cloned()
    }

    /// 已打开的频道 ID（排序）
    pub fn open_channels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 关闭并移除频道，频道不存在时返回 false
    pub async fn close_channel(&self, channel_id: &str) -> bool {
        let engine = self.channels.write().remove(channel_id);
        match engine {
            Some(engine) => {
                engine.close().await;
                true
            }
            None => {
                debug!("关闭不存在的频道: channel_id={}", channel_id);
                false
            }
        }
    }

    /// 关闭全部频道
    pub async fn shutdown(&self) {
        let engines: Vec<Arc<ChatSyncEngine>> =
            self.channels.write().drain().map(|(_, e)| e).collect();
        if engines.is_empty() {
            return;
        }
        info!("关闭全部频道: count={}", engines.len());
        join_all(engines.iter().map(|engine| engine.close())).await;
        self.event_manager.clear_listeners();
    }

    fn get_or_create(&self, channel_id: &str) -> Result<Arc<ChatSyncEngine>> {
        if let Some(engine) = self.channels.read().get(channel_id) {
            return Ok(engine.clone());
        }

        let mut channels = self.channels.write();
        if let Some(engine) = channels.get(channel_id) {
            return Ok(engine.clone());
        }
        let engine = Arc::new(ChatSyncEngine::new(
            channel_id,
            self.store.clone(),
            self.config.clone(),
            self.event_manager.clone(),
        )?);
        channels.insert(channel_id.to_string(), engine.clone());
        debug!("创建频道引擎: channel_id={}", channel_id);
        Ok(engine)
    }
}

impl Drop for ChatSyncManager {
    fn drop(&mut self) {
        let open = self.channels.read().len();
        if open > 0 {
            warn!("管理器释放时仍有未关闭的频道: count={}", open);
        }
    }
}
