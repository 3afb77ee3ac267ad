//! SDK 配置

use serde::{Deserialize, Serialize};

use crate::error::{ChatSyncError, Result};

/// 默认页大小（初始页和每次加载更早历史）
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// 默认乐观消息对账窗口（毫秒）
pub const DEFAULT_RECONCILE_WINDOW_MS: u64 = 30_000;

/// 默认匿名发送者名称
pub const DEFAULT_ANONYMOUS_SENDER_NAME: &str = "Anonymous";

/// 消息同步配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSyncConfig {
    /// 每页消息数量
    pub page_size: usize,
    /// 实时追加后本地最多保留的消息数（None 表示不限制）
    pub max_retained: Option<usize>,
    /// 是否在存储确认前显示乐观消息
    pub optimistic_send: bool,
    /// 启发式对账窗口（毫秒），仅在存储不回显客户端关联 ID 时使用
    pub reconcile_window_ms: u64,
    /// 事件广播通道容量
    pub event_capacity: usize,
    /// 显示名为空时使用的发送者名称
    pub anonymous_sender_name: String,
}

impl Default for ChatSyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_retained: None,
            optimistic_send: true,
            reconcile_window_ms: DEFAULT_RECONCILE_WINDOW_MS,
            event_capacity: 256,
            anonymous_sender_name: DEFAULT_ANONYMOUS_SENDER_NAME.to_string(),
        }
    }
}

impl ChatSyncConfig {
    pub fn builder() -> ChatSyncConfigBuilder {
        ChatSyncConfigBuilder::new()
    }

    /// 从 JSON 字符串加载，缺省字段取默认值
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ChatSyncError::Config(format!("invalid config json: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(ChatSyncError::Config("page_size must be greater than 0".into()));
        }
        if let Some(max) = self.max_retained {
            if max < self.page_size {
                return Err(ChatSyncError::Config(format!(
                    "max_retained ({}) must not be smaller than page_size ({})",
                    max, self.page_size
                )));
            }
        }
        if self.event_capacity == 0 {
            return Err(ChatSyncError::Config("event_capacity must be greater than 0".into()));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct ChatSyncConfigBuilder {
    config: ChatSyncConfig,
}

impl ChatSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ChatSyncConfig::default(),
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn max_retained(mut self, max_retained: usize) -> Self {
        self.config.max_retained = Some(max_retained);
        self
    }

    pub fn optimistic_send(mut self, enabled: bool) -> Self {
        self.config.optimistic_send = enabled;
        self
    }

    pub fn reconcile_window_ms(mut self, window_ms: u64) -> Self {
        self.config.reconcile_window_ms = window_ms;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn anonymous_sender_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.anonymous_sender_name = name.into();
        self
    }

    /// 构建并校验
    pub fn build(self) -> Result<ChatSyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatSyncConfig::default();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.max_retained, None);
        assert!(config.optimistic_send);
        assert_eq!(config.anonymous_sender_name, "Anonymous");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_validates() {
        let config = ChatSyncConfig::builder()
            .page_size(3)
            .max_retained(10)
            .optimistic_send(false)
            .build()
            .unwrap();
        assert_eq!(config.page_size, 3);
        assert_eq!(config.max_retained, Some(10));
        assert!(!config.optimistic_send);

        let err = ChatSyncConfig::builder().page_size(0).build().unwrap_err();
        assert!(matches!(err, ChatSyncError::Config(_)));

        let err = ChatSyncConfig::builder()
            .page_size(20)
            .max_retained(5)
            .build()
            .unwrap_err();
        assert!(matches!(err, ChatSyncError::Config(_)));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ChatSyncConfig::from_json(r#"{ "page_size": 50 }"#).unwrap();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.reconcile_window_ms, DEFAULT_RECONCILE_WINDOW_MS);

        assert!(ChatSyncConfig::from_json(r#"{ "page_size": 0 }"#).is_err());
        assert!(ChatSyncConfig::from_json("not json").is_err());
    }
}
