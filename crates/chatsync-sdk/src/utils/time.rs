//! 时间工具
//!
//! 本地时间统一使用 UTC 毫秒时间戳，只用于事件时间戳和乐观消息的对账窗口；
//! 消息排序只看存储分配的 `created_at`，从不使用本地时钟。

use chrono::Utc;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// 距离给定时间戳已过去的毫秒数（时钟回拨时为 0）
pub fn millis_since(timestamp_ms: u64) -> u64 {
    now_millis().saturating_sub(timestamp_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_since() {
        let now = now_millis();
        assert!(now > 0);
        assert!(millis_since(now) < 10_000);
        assert_eq!(millis_since(u64::MAX), 0);
    }
}
