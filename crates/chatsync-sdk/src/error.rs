use thiserror::Error;

/// SDK 统一错误类型
///
/// 所有错误都可在 UI 层恢复（提示重试），不会导致进程退出。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatSyncError {
    /// 初始页或更早历史页拉取失败
    #[error("Fetch failed: {0}")]
    FetchFailed(String),
    /// 持久化追加失败
    #[error("Send failed: {0}")]
    SendFailed(String),
    /// 非法输入（空消息体、缺少发送者等）
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// 窗口尚未进入 Ready 状态
    #[error("Not ready: {0}")]
    NotReady(String),
    /// 频道视图已关闭
    #[error("Channel closed: {0}")]
    Closed(String),
    /// 配置错误
    #[error("Config error: {0}")]
    Config(String),
}

impl ChatSyncError {
    /// 获取错误类别字符串（用于事件和日志）
    pub fn kind(&self) -> &'static str {
        match self {
            ChatSyncError::FetchFailed(_) => "fetch_failed",
            ChatSyncError::SendFailed(_) => "send_failed",
            ChatSyncError::InvalidInput(_) => "invalid_input",
            ChatSyncError::NotReady(_) => "not_ready",
            ChatSyncError::Closed(_) => "closed",
            ChatSyncError::Config(_) => "config",
        }
    }

    /// 是否适合给用户展示“重试”入口
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatSyncError::FetchFailed(_) | ChatSyncError::SendFailed(_) | ChatSyncError::NotReady(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatSyncError>;

/// 外部消息存储返回的错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// 存储/网络不可用
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// 存储拒绝了请求（安全规则等）
    #[error("store rejected request: {0}")]
    Rejected(String),
    /// 请求超时
    #[error("store request timed out")]
    Timeout,
}

impl StoreError {
    /// 拉取阶段的存储错误统一映射为 FetchFailed
    pub fn into_fetch_failed(self) -> ChatSyncError {
        ChatSyncError::FetchFailed(self.to_string())
    }

    /// 追加阶段的存储错误统一映射为 SendFailed
    pub fn into_send_failed(self) -> ChatSyncError {
        ChatSyncError::SendFailed(self.to_string())
    }
}
