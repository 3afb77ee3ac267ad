//! ChatSync SDK - 频道消息同步引擎
//!
//! 为聊天界面维护每个频道的本地消息窗口：
//! - 📥 初始页加载（最近 N 条）与实时订阅
//! - 📜 向后分页加载更早的历史
//! - ✉️ 乐观发送，确认记录到达后精确对账
//! - 🔁 重复投递去重、按服务端时间戳有序
//! - ⚙️ 事件系统：展示层通过时间线差异驱动渲染
//!
//! 存储和传输由调用方通过 [`MessageStore`] 提供。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatsync_sdk::{ChatSyncConfig, ChatSyncManager, ChatUser, InMemoryMessageStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryMessageStore::new());
//!     let manager = ChatSyncManager::new(store, ChatSyncConfig::default())?;
//!
//!     // 打开公共频道并加载最近一页
//!     let channel = manager.open_public_chat().await?;
//!
//!     // 发送消息（用户由外部身份服务提供）
//!     let user = ChatUser::new("user123", "Ada");
//!     channel.send("Hello, World!", &user).await?;
//!
//!     // 向上滚动时加载更早的历史
//!     channel.load_older().await?;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod message;
pub mod reconcile;
pub mod store;
pub mod utils;
pub mod window;

pub use config::{ChatSyncConfig, ChatSyncConfigBuilder};
pub use engine::{ChatSyncEngine, LiveOutcome, LoadOlderOutcome};
pub use error::{ChatSyncError, Result, StoreError};
pub use events::{
    ChatEvent, EventFilter, EventManager, EventStats, FetchPhase, FilteredEventReceiver,
    TimelineDiffKind,
};
pub use manager::{ChatSyncManager, PUBLIC_CHAT_CHANNEL};
pub use message::{ChatUser, Message, MessageDraft};
pub use reconcile::PendingMessage;
pub use store::{InMemoryMessageStore, MessageStore, StoreResult, Subscription};
pub use window::{TimelineItem, WindowSnapshot, WindowState};
