use crate::command::CommandRef;
use crate::result::ExecutionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 生命周期通道
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Enqueued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl LifecycleStage {
    pub const ALL: [LifecycleStage; 5] = [
        Self::Enqueued,
        Self::Executing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// completed/failed/cancelled 为终态，每个命令恰好产生一次
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Enqueued => 0,
            Self::Executing => 1,
            Self::Completed => 2,
            Self::Failed => 3,
            Self::Cancelled => 4,
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次状态迁移
///
/// `sequence` 在同一通知器内严格递增，时间戳精度不足以区分先后时以它为准。
#[derive(Clone, Debug)]
pub struct LifecycleEvent {
    pub stage: LifecycleStage,
    pub command: CommandRef,
    /// 仅终态事件携带
    pub result: Option<ExecutionResult>,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl LifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}
