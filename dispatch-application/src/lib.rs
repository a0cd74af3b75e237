//! 命令调度应用层（dispatch-application）
//!
//! 在 `dispatch-domain` 的协议之上提供进程内的异步命令调度器：
//! - `CommandHandler`：按命令类型注册的校验/执行策略；
//! - `HandlerRegistry`：以 `TypeId` 为键的处理器注册表，后注册者覆盖先注册者；
//! - `CommandDispatcher`：FIFO 队列 + 单一调度循环，负责校验、加锁、执行、释放与事件发布；
//! - `DispatcherConfig`：默认执行时限与事件流缓冲容量。
//!
pub mod command_handler;
pub mod config;
pub mod dispatcher;
mod in_flight;
pub mod registry;

pub use command_handler::CommandHandler;
pub use config::DispatcherConfig;
pub use dispatcher::CommandDispatcher;
pub use registry::HandlerRegistry;

// 处理器实现方需要的取消令牌类型
pub use tokio_util::sync::CancellationToken;
