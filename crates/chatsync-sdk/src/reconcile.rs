//! 乐观消息对账
//!
//! 本地发送的消息在存储确认前以「待确认」条目展示。确认记录可能经由两条路径到达：
//! `append` 的返回值，或实时订阅推送。两条路径谁先到都必须只留下一条可见消息。
//!
//! 匹配规则（确定性）：
//! 1. 确认记录带 `client_msg_id` 时，只按它精确匹配；找不到就视为别人的消息。
//! 2. 存储未回显 `client_msg_id` 时，退化为启发式匹配：同一发送者、规范化后正文相同、
//!    提交时间在对账窗口内的最早一条待确认消息（FIFO）。

use serde::{Deserialize, Serialize};

use crate::message::{normalize_body, Message};

/// 待确认的本地消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// 客户端关联 ID，同时作为本地条目 ID
    pub client_msg_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    /// 本地提交时间（UTC 毫秒），只用于对账窗口
    pub submitted_at: u64,
}

impl PendingMessage {
    fn matches_content(&self, message: &Message) -> bool {
        self.sender_id == message.sender_id
            && normalize_body(&self.body) == normalize_body(&message.body)
    }
}

/// 待确认消息队列（按提交顺序）
#[derive(Debug, Default, Clone)]
pub struct PendingOutbox {
    entries: Vec<PendingMessage>,
}

impl PendingOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pending: PendingMessage) {
        self.entries.push(pending);
    }

    /// 按客户端关联 ID 移除
    pub fn remove(&mut self, client_msg_id: &str) -> Option<PendingMessage> {
        let pos = self
            .entries
            .iter()
            .position(|p| p.client_msg_id == client_msg_id)?;
        Some(self.entries.remove(pos))
    }

    /// 为一条确认记录找到并移除对应的待确认消息
    pub fn take_match(
        &mut self,
        message: &Message,
        window_ms: u64,
        now_ms: u64,
    ) -> Option<PendingMessage> {
        if let Some(client_msg_id) = message.client_msg_id.as_deref() {
            return self.remove(client_msg_id);
        }

        let pos = self.entries.iter().position(|p| {
            p.matches_content(message) && now_ms.saturating_sub(p.submitted_at) <= window_ms
        })?;
        Some(self.entries.remove(pos))
    }

    pub fn entries(&self) -> &[PendingMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str, sender: &str, body: &str, submitted_at: u64) -> PendingMessage {
        PendingMessage {
            client_msg_id: id.into(),
            sender_id: sender.into(),
            sender_name: "Ada".into(),
            body: body.into(),
            submitted_at,
        }
    }

    #[test]
    fn test_exact_match_by_client_id() {
        let mut outbox = PendingOutbox::new();
        outbox.push(pending("c1", "u1", "hello", 1_000));
        outbox.push(pending("c2", "u1", "hello", 1_000));

        let confirmed = Message::new("m1", "u1", "Ada", "hello", 31).with_client_msg_id("c2");
        let matched = outbox.take_match(&confirmed, 30_000, 2_000).unwrap();
        assert_eq!(matched.client_msg_id, "c2");
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_foreign_client_id_never_falls_back() {
        let mut outbox = PendingOutbox::new();
        outbox.push(pending("c1", "u1", "hello", 1_000));

        // 同一用户在另一台设备上发了相同内容
        let other_device = Message::new("m1", "u1", "Ada", "hello", 31).with_client_msg_id("x9");
        assert!(outbox.take_match(&other_device, 30_000, 2_000).is_none());
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_heuristic_match_is_fifo() {
        let mut outbox = PendingOutbox::new();
        outbox.push(pending("c1", "u1", "hello  world", 1_000));
        outbox.push(pending("c2", "u1", "hello world", 1_500));

        let confirmed = Message::new("m1", "u1", "Ada", " hello world ", 31);
        let matched = outbox.take_match(&confirmed, 30_000, 2_000).unwrap();
        assert_eq!(matched.client_msg_id, "c1");
    }

    #[test]
    fn test_heuristic_requires_sender_and_window() {
        let mut outbox = PendingOutbox::new();
        outbox.push(pending("c1", "u1", "hello", 1_000));

        let other_sender = Message::new("m1", "u2", "Bob", "hello", 31);
        assert!(outbox.take_match(&other_sender, 30_000, 2_000).is_none());

        let stale = Message::new("m2", "u1", "Ada", "hello", 32);
        assert!(outbox.take_match(&stale, 30_000, 40_000).is_none());

        assert!(outbox.take_match(&stale, 30_000, 31_000).is_some());
        assert!(outbox.is_empty());
    }
}
