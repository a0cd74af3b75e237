use crate::command_handler::CommandHandler;
use dashmap::DashMap;
use dispatch_domain::command::{Command, CommandRef};
use dispatch_domain::error::{DispatchError, DispatchResult};
use dispatch_domain::result::{ExecutionResult, ValidationResult};
use std::any::TypeId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) type ExecuteFuture =
    Pin<Box<dyn Future<Output = anyhow::Result<ExecutionResult>> + Send + 'static>>;

type ValidateFn = Arc<dyn Fn(&CommandRef) -> DispatchResult<ValidationResult> + Send + Sync>;

type ExecuteFn = Arc<dyn Fn(CommandRef, CancellationToken) -> ExecuteFuture + Send + Sync>;

/// 类型擦除后的处理器条目
#[derive(Clone)]
pub(crate) struct RegisteredHandler {
    validate: ValidateFn,
    execute: ExecuteFn,
}

impl RegisteredHandler {
    pub(crate) fn validate(&self, cmd: &CommandRef) -> DispatchResult<ValidationResult> {
        (self.validate)(cmd)
    }

    pub(crate) fn execute(&self, cmd: CommandRef, cancel: CancellationToken) -> ExecuteFuture {
        (self.execute)(cmd, cancel)
    }
}

/// 基于内存的处理器注册表
/// - 通过 TypeId 注册不同 Command 对应的 Handler
/// - 运行时以类型擦除方式进行调度
pub struct HandlerRegistry {
    handlers: DashMap<TypeId, (&'static str, RegisteredHandler)>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册命令处理器；同一命令类型重复注册时后者覆盖前者，返回是否发生了覆盖
    pub fn register<C, H>(&self, handler: Arc<H>) -> bool
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let validate: ValidateFn = {
            let handler = handler.clone();

            Arc::new(move |cmd: &CommandRef| match cmd.downcast_ref::<C>() {
                Some(c) => Ok(handler.validate(c)),
                None => Err(DispatchError::TypeMismatch {
                    expected: C::NAME,
                    found: cmd.name(),
                }),
            })
        };

        let execute: ExecuteFn = {
            let handler = handler.clone();

            Arc::new(move |cmd: CommandRef, cancel: CancellationToken| -> ExecuteFuture {
                let handler = handler.clone();

                Box::pin(async move {
                    // 正常情况下这里的 downcast 永远不会失败（键与闭包同一泛型 C）
                    match cmd.downcast_ref::<C>() {
                        Some(c) => handler.execute(c, cancel).await,
                        None => Err(DispatchError::TypeMismatch {
                            expected: C::NAME,
                            found: cmd.name(),
                        }
                        .into()),
                    }
                })
            })
        };

        let replaced = self
            .handlers
            .insert(
                TypeId::of::<C>(),
                (C::NAME, RegisteredHandler { validate, execute }),
            )
            .is_some();

        if replaced {
            tracing::debug!(command = C::NAME, "command handler replaced");
        }
        replaced
    }

    pub fn contains<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }

    /// 已注册的命令名列表（只读视图）
    pub fn registered_commands(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|e| e.value().0).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }

    // 克隆出条目，避免在执行期间持有分片锁
    pub(crate) fn resolve(&self, cmd: &CommandRef) -> Option<RegisteredHandler> {
        self.handlers
            .get(&cmd.type_id())
            .map(|entry| entry.value().1.clone())
    }
}
