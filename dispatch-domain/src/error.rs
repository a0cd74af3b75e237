//! 调度边界统一错误定义
//!
//! 预期内的失败（校验失败、资源被占用、取消）以 `ExecutionResult` 表达，不走错误通道；
//! 这里只收录两类情况：
//! - 调度器自身的前置条件违例（例如已销毁后继续入队）；
//! - 附着在 `ExecutionError` 结果上的诊断原因（处理器缺失、panic、超时等）。
//!
use std::any::Any;
use std::time::Duration;
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DispatchError {
    // --- 调度器前置条件 ---
    #[error("dispatcher has been disposed")]
    Disposed,
    #[error("no tokio runtime available to drive the dispatch loop")]
    RuntimeUnavailable,

    // --- 处理器绑定 ---
    #[error("handler not found: command={0}")]
    HandlerNotFound(&'static str),
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    // --- 执行故障 ---
    #[error("handler panicked: command={command}, message={message}")]
    HandlerPanicked {
        command: &'static str,
        message: String,
    },
    #[error("deadline exceeded: command={command}, timeout={timeout:?}")]
    DeadlineExceeded {
        command: &'static str,
        timeout: Duration,
    },
}

impl DispatchError {
    pub fn panicked(command: &'static str, payload: &(dyn Any + Send)) -> Self {
        Self::HandlerPanicked {
            command,
            message: panic_message(payload),
        }
    }
}

/// 统一 Result 类型别名
pub type DispatchResult<T> = Result<T, DispatchError>;

/// 从 panic 负载中提取可读信息
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
