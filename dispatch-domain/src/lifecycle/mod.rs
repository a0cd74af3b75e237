//! 命令生命周期（lifecycle）
//!
//! - `LifecycleStage`：enqueued → executing → completed/failed/cancelled 五个通道；
//! - `LifecycleEvent`：一次状态迁移的只读快照；
//! - `LifecycleNotifier`：按通道扇出到订阅者，并提供异步事件流。
//!
pub mod event;
pub mod notifier;

pub use event::{LifecycleEvent, LifecycleStage};
pub use notifier::{LifecycleNotifier, SubscriptionId};
