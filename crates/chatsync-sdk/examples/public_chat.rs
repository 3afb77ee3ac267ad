//! 公共频道演示
//!
//! 使用内存存储模拟两个用户在公共频道里聊天：初始页、实时推送、乐观发送、向上翻页。

use std::sync::Arc;
use std::time::Duration;

use chatsync_sdk::{
    ChatEvent, ChatSyncConfig, ChatSyncManager, ChatUser, InMemoryMessageStore, LoadOlderOutcome,
    Message, MessageStore, TimelineDiffKind, PUBLIC_CHAT_CHANNEL,
};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n💬 公共频道同步演示\n");
    println!("====================================\n");

    // 预置 12 条历史消息
    let store = InMemoryMessageStore::new();
    store.seed(
        PUBLIC_CHAT_CHANNEL,
        (1..=12u64).map(|i| Message::new(format!("h{}", i), "bob", "Bob", format!("历史消息 #{}", i), i)),
    );

    let config = ChatSyncConfig::builder().page_size(5).build()?;
    let manager = ChatSyncManager::new(Arc::new(store.clone()), config)?;

    let mut events = manager.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChatEvent::TimelineDiff { diff_kind, .. } => match diff_kind {
                    TimelineDiffKind::Reset { messages } => println!("  ↺ 时间线重置: {} 条", messages.len()),
                    TimelineDiffKind::Insert { index, message } => {
                        println!("  + [{}] {}: {}", index, message.sender_name, message.body)
                    }
                    TimelineDiffKind::Prepend { messages } => println!("  ⇡ 前插历史: {} 条", messages.len()),
                    TimelineDiffKind::Evict { message_ids } => println!("  - 淘汰: {:?}", message_ids),
                    TimelineDiffKind::PendingAdded { pending } => println!("  … 发送中: {}", pending.body),
                    TimelineDiffKind::PendingConfirmed { index, message, .. } => {
                        println!("  ✓ [{}] 已确认: {}", index, message.body)
                    }
                    TimelineDiffKind::PendingRemoved { client_msg_id } => {
                        println!("  ✗ 撤下乐观消息: {}", client_msg_id)
                    }
                },
                ChatEvent::LoadStateChanged { old_state, new_state, .. } => {
                    println!("  ⚙️  状态: {} -> {}", old_state, new_state)
                }
                ChatEvent::FetchFailed { phase, error, .. } => println!("  ⚠️  拉取失败 {:?}: {}", phase, error),
                ChatEvent::MessageSent { message_id, .. } => println!("  📤 已发送: {}", message_id),
                ChatEvent::MessageSendFailed { body, error, .. } => {
                    println!("  ⚠️  发送失败（可重试）: {} ({})", body, error)
                }
            }
        }
    });

    println!("📥 打开公共频道");
    let channel = manager.open_public_chat().await?;
    sleep(Duration::from_millis(50)).await;

    println!("\n✉️  Ada 发送消息");
    let ada = ChatUser::new("ada", "Ada");
    channel.send("大家好！", &ada).await?;

    println!("\n📡 Bob 在另一台设备上发言");
    store
        .append(
            PUBLIC_CHAT_CHANNEL,
            chatsync_sdk::MessageDraft {
                sender_id: "bob".into(),
                sender_name: "Bob".into(),
                body: "欢迎 Ada".into(),
                client_msg_id: "bob-device-1".into(),
            },
        )
        .await?;
    sleep(Duration::from_millis(50)).await;

    println!("\n📜 向上翻页直到没有更多历史");
    loop {
        match channel.load_older().await? {
            LoadOlderOutcome::Loaded { inserted, has_more_history, .. } => {
                println!("  加载 {} 条，还有更多: {}", inserted, has_more_history);
            }
            LoadOlderOutcome::NoMoreHistory => break,
            LoadOlderOutcome::AlreadyLoading => sleep(Duration::from_millis(10)).await,
        }
    }

    let snapshot = channel.snapshot();
    println!("\n📋 当前时间线（{} 条）:", snapshot.messages.len());
    for item in snapshot.timeline() {
        println!("  {}{}", if item.is_pending() { "… " } else { "" }, item.body());
    }

    manager.shutdown().await;
    sleep(Duration::from_millis(50)).await;
    printer.abort();

    println!("\n✅ 演示结束");
    Ok(())
}
