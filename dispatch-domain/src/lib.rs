//! 命令调度领域层（dispatch-domain）
//!
//! 提供命令调度引擎所依赖的领域词汇与基础构件：
//! - 命令（`command`）：`Command` 协议、命令标识与类型擦除后的只读句柄 `CommandRef`
//! - 资源锁（`lock_key`、`lock_manager`）：实体级互斥，整组原子获取
//! - 执行结果（`result`）：校验结果与执行结果，预期失败以值表达而非错误
//! - 生命周期（`lifecycle`）：enqueued/executing/completed/failed/cancelled 五类事件的扇出
//! - 错误（`error`）：调度边界上的统一错误类型
//!
//! 本 crate 不包含调度循环本身，仅定义应用层调度器所需的协议与数据结构，
//! 以便处理器、观察者与调度实现之间保持解耦。
//!
//! 典型用法：
//! 1. 定义命令结构体，并通过 `#[command]` 宏或手写实现 `Command`；
//! 2. 通过 `lock_keys` 声明需要独占的实体；
//! 3. 在 `LifecycleNotifier` 上订阅关心的生命周期阶段。
//!
pub mod command;
pub mod error;
pub mod lifecycle;
pub mod lock_key;
pub mod lock_manager;
pub mod result;

pub use command::{Command, CommandId, CommandRef};
pub use error::{DispatchError, DispatchResult};
pub use lifecycle::{LifecycleEvent, LifecycleNotifier, LifecycleStage, SubscriptionId};
pub use lock_key::LockKey;
pub use lock_manager::{EntityLockManager, LockGuard};
pub use result::{ExecutionResult, Outcome, ValidationResult};

// 允许在本 crate 内部通过 ::dispatch_domain 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::dispatch_domain 路径。
extern crate self as dispatch_domain;
