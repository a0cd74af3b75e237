//! 命令（Command）抽象
//!
//! 命令是调用方创建的不可变意图描述，本身不携带行为，由且仅由一个处理器消费。
//! 可选能力以默认方法表达，任意命令都可以同时具备零个或多个能力：
//! - `allows_concurrent_execution`：是否允许与其他命令并发执行（默认允许）；
//! - `lock_keys`：执行期间需要独占的资源（默认无）；
//! - `on_cancelled`：在执行前或执行中被取消时回调，恰好一次；
//! - `timeout`：可选的执行时限。
//!
//! 入队后命令被包装为类型擦除的 [`CommandRef`]，在生命周期事件中以只读方式传递。
//!
use crate::lock_key::LockKey;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 应用层命令
///
/// 关联常量：
/// - `NAME`：命令的稳定名称，用于日志、追踪与路由。避免依赖 `type_name::<T>()`。
pub trait Command: Send + Sync + 'static {
    /// 命令的稳定名称（建议常量字符串，不随重构变化）
    const NAME: &'static str;

    /// 为 `false` 时调度循环必须等待该命令结束后才会处理下一个命令
    fn allows_concurrent_execution(&self) -> bool {
        true
    }

    /// 执行期间需要独占的资源；为空表示不加锁
    fn lock_keys(&self) -> Vec<LockKey> {
        Vec::new()
    }

    /// 命令在执行前或执行中被取消时调用
    fn on_cancelled(&self) {}

    /// 单个命令的执行时限；`None` 时采用调度器的默认配置
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// 命令在调度器内的唯一标识，入队时按序分配
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(u64);

impl CommandId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

// 对象安全的命令视图，供类型擦除后调用可选能力
trait ErasedCommand: Send + Sync {
    fn name(&self) -> &'static str;
    fn allows_concurrent_execution(&self) -> bool;
    fn lock_keys(&self) -> Vec<LockKey>;
    fn on_cancelled(&self);
    fn timeout(&self) -> Option<Duration>;
    fn as_any(&self) -> &dyn Any;
}

impl<C: Command> ErasedCommand for C {
    fn name(&self) -> &'static str {
        C::NAME
    }

    fn allows_concurrent_execution(&self) -> bool {
        Command::allows_concurrent_execution(self)
    }

    fn lock_keys(&self) -> Vec<LockKey> {
        Command::lock_keys(self)
    }

    fn on_cancelled(&self) {
        Command::on_cancelled(self)
    }

    fn timeout(&self) -> Option<Duration> {
        Command::timeout(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 已入队命令的只读句柄
///
/// 克隆开销为一次引用计数；相等性按实例判断，同一命令的所有克隆彼此相等。
#[derive(Clone)]
pub struct CommandRef {
    id: CommandId,
    type_id: TypeId,
    command: Arc<dyn ErasedCommand>,
}

impl CommandRef {
    pub fn new<C: Command>(id: CommandId, command: C) -> Self {
        Self {
            id,
            type_id: TypeId::of::<C>(),
            command: Arc::new(command),
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.command.name()
    }

    /// 具体命令类型的 `TypeId`，用于路由到处理器
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is<C: Command>(&self) -> bool {
        self.type_id == TypeId::of::<C>()
    }

    pub fn downcast_ref<C: Command>(&self) -> Option<&C> {
        self.command.as_any().downcast_ref::<C>()
    }

    pub fn allows_concurrent_execution(&self) -> bool {
        self.command.allows_concurrent_execution()
    }

    pub fn lock_keys(&self) -> Vec<LockKey> {
        self.command.lock_keys()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.command.timeout()
    }

    /// 触发命令的取消回调；由调度器保证每个命令至多调用一次
    pub fn on_cancelled(&self) {
        self.command.on_cancelled()
    }
}

impl PartialEq for CommandRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.command, &other.command)
    }
}

impl Eq for CommandRef {}

impl fmt::Debug for CommandRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRef")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}
