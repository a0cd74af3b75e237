use async_trait::async_trait;
use dispatch_domain::command::Command;
use dispatch_domain::result::{ExecutionResult, ValidationResult};
use tokio_util::sync::CancellationToken;

/// 命令处理器：每种具体命令类型恰好绑定一个
///
/// - `validate`：纯同步、无副作用的前置条件检查，在加锁之前调用；默认总是通过；
/// - `execute`：执行副作用。应在挂起点观察 `cancel`，被取消时返回
///   `ExecutionResult::cancelled()` 而不是报错；返回 `Err` 表示不可预期的故障，
///   调度器会将其转换为携带原因的 `ExecutionError`。
#[async_trait]
pub trait CommandHandler<C>: Send + Sync
where
    C: Command,
{
    fn validate(&self, _cmd: &C) -> ValidationResult {
        ValidationResult::valid()
    }

    async fn execute(&self, cmd: &C, cancel: CancellationToken) -> anyhow::Result<ExecutionResult>;
}
