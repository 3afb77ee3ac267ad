//! 消息数据结构
//!
//! - `Message`：存储确认后的规范记录（id / created_at 由存储分配）
//! - `MessageDraft`：客户端提交给存储的草稿
//! - `ChatUser`：显式传入 `send()` 的当前会话用户

use serde::{Deserialize, Serialize};

/// 规范消息记录（创建后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// 存储分配的消息 ID，频道内唯一
    pub id: String,
    /// 发送者 ID
    pub sender_id: String,
    /// 发送时的显示名（冗余字段，不随资料修改回溯更新）
    pub sender_name: String,
    /// 消息正文，非空
    pub body: String,
    /// 服务端分配的单调逻辑时钟，唯一排序键
    pub created_at: u64,
    /// 客户端关联 ID（存储回显时存在，用于乐观消息精确对账）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        body: impl Into<String>,
        created_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            body: body.into(),
            created_at,
            client_msg_id: None,
        }
    }

    /// 设置客户端关联 ID
    pub fn with_client_msg_id(mut self, client_msg_id: impl Into<String>) -> Self {
        self.client_msg_id = Some(client_msg_id.into());
        self
    }
}

/// 发送草稿
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    /// 客户端生成的关联 ID（UUID v4），存储可选择回显
    pub client_msg_id: String,
}

/// 当前会话用户
///
/// 由外部身份服务解析并授权后传入，SDK 不做鉴权。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: String,
    pub display_name: String,
}

impl ChatUser {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// 显示名为空时回退到匿名名称
    pub fn display_name_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        let name = self.display_name.trim();
        if name.is_empty() {
            fallback
        } else {
            name
        }
    }
}

/// 规范化消息正文：去掉首尾空白，并把连续空白折叠为单个空格
pub fn normalize_body(body: &str) -> String {
    body.split_whitespace().collect::<Vec<_>>().join(" ")
}
