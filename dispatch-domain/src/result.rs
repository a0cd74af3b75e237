//! 校验结果与执行结果
//!
//! 预期内的失败模式（前置条件不满足、资源被占用、用户取消）一律以值返回，
//! 只有不可预期的故障才会附带 `cause` 作为诊断信息。
//!
use crate::lifecycle::LifecycleStage;
use crate::lock_key::LockKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 前置条件校验结果，在加锁与执行之前同步产生
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationResult {
    error_message: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            error_message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error_message.is_none()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

/// 执行结局
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    ValidationFailed,
    EntityLocked,
    Cancelled,
    ExecutionError,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ValidationFailed => "validation_failed",
            Self::EntityLocked => "entity_locked",
            Self::Cancelled => "cancelled",
            Self::ExecutionError => "execution_error",
        }
    }

    /// 结局对应的终态生命周期通道
    pub fn terminal_stage(self) -> LifecycleStage {
        match self {
            Self::Success => LifecycleStage::Completed,
            Self::Cancelled => LifecycleStage::Cancelled,
            Self::ValidationFailed | Self::EntityLocked | Self::ExecutionError => {
                LifecycleStage::Failed
            }
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次执行尝试的不可变结果
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    outcome: Outcome,
    message: Option<String>,
    cause: Option<Arc<anyhow::Error>>,
}

impl ExecutionResult {
    fn new(outcome: Outcome, message: Option<String>) -> Self {
        Self {
            outcome,
            message,
            cause: None,
        }
    }

    pub fn success() -> Self {
        Self::new(Outcome::Success, None)
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(Outcome::ValidationFailed, Some(message.into()))
    }

    /// 资源被占用；消息中列出请求的锁键
    pub fn entity_locked(keys: &[LockKey]) -> Self {
        let keys = keys
            .iter()
            .map(LockKey::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Self::new(Outcome::EntityLocked, Some(format!("entity locked: {keys}")))
    }

    pub fn cancelled() -> Self {
        Self::new(Outcome::Cancelled, None)
    }

    /// 不可预期的故障，`cause` 作为诊断信息保留
    pub fn execution_error(cause: impl Into<anyhow::Error>) -> Self {
        let cause = cause.into();
        Self {
            outcome: Outcome::ExecutionError,
            message: Some(cause.to_string()),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(Arc::new(cause.into()));
        self
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    /// 尝试将原因还原为具体错误类型
    pub fn cause_as<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.cause()?.downcast_ref::<E>()
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.outcome),
            None => write!(f, "{}", self.outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;

    #[test]
    fn validation_result_defaults_to_valid() {
        assert!(ValidationResult::default().is_valid());

        let invalid = ValidationResult::invalid("station is cold");
        assert!(!invalid.is_valid());
        assert_eq!(invalid.error_message(), Some("station is cold"));
    }

    #[test]
    fn outcomes_map_to_terminal_channels() {
        assert_eq!(Outcome::Success.terminal_stage(), LifecycleStage::Completed);
        assert_eq!(Outcome::Cancelled.terminal_stage(), LifecycleStage::Cancelled);
        for failed in [
            Outcome::ValidationFailed,
            Outcome::EntityLocked,
            Outcome::ExecutionError,
        ] {
            assert_eq!(failed.terminal_stage(), LifecycleStage::Failed);
        }
    }

    #[test]
    fn execution_error_keeps_typed_cause() {
        let result = ExecutionResult::execution_error(DispatchError::HandlerNotFound("Attack"));

        assert_eq!(result.outcome(), Outcome::ExecutionError);
        assert_eq!(result.message(), Some("handler not found: command=Attack"));
        assert!(matches!(
            result.cause_as::<DispatchError>(),
            Some(DispatchError::HandlerNotFound("Attack"))
        ));

        // 克隆共享同一原因
        let cloned = result.clone();
        assert!(cloned.cause_as::<DispatchError>().is_some());
    }

    #[test]
    fn entity_locked_lists_keys() {
        let result = ExecutionResult::entity_locked(&[LockKey::from("card:1"), "oven".into()]);
        assert_eq!(result.to_string(), "entity_locked: entity locked: card:1, oven");
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&Outcome::EntityLocked).unwrap();
        assert_eq!(json, "\"entity_locked\"");
    }
}
