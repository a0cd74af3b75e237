use async_trait::async_trait;
use dispatch_application::{
    CancellationToken, CommandDispatcher, CommandHandler, DispatcherConfig,
};
use dispatch_domain::{CommandId, ExecutionResult, LifecycleStage, Outcome, ValidationResult};
use dispatch_macros::command;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 在灶台上烹饪食材，期间独占灶台与食材
#[command(name = "kitchen.cook", on_cancelled = Cook::cleanup)]
struct Cook {
    #[lock_key(scope = "station")]
    station: String,
    #[lock_key(scope = "ingredient")]
    ingredient: String,
    minutes: u64,
}

impl Cook {
    fn cleanup(&self) {
        info!(station = %self.station, "cook cancelled, station cleared");
    }
}

/// 把卡片移到另一列；必须串行执行
#[command(name = "board.move", sequential)]
struct Move {
    #[lock_key(scope = "ingredient")]
    card: String,
    column: u32,
}

/// 没有注册处理器的命令
#[command(name = "arena.attack")]
struct Attack;

struct Kitchen;

#[async_trait]
impl CommandHandler<Cook> for Kitchen {
    fn validate(&self, cmd: &Cook) -> ValidationResult {
        if cmd.minutes == 0 {
            ValidationResult::invalid("cooking time must be positive")
        } else {
            ValidationResult::valid()
        }
    }

    async fn execute(
        &self,
        cmd: &Cook,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionResult> {
        // 一分钟折算为 10 毫秒
        let cooking = tokio::time::sleep(Duration::from_millis(cmd.minutes * 10));
        tokio::select! {
            _ = cooking => {
                let ready = format!("{} ready", cmd.ingredient);
                Ok(ExecutionResult::success().with_message(ready))
            }
            _ = cancel.cancelled() => Ok(ExecutionResult::cancelled()),
        }
    }
}

struct Board;

#[async_trait]
impl CommandHandler<Move> for Board {
    async fn execute(
        &self,
        cmd: &Move,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionResult> {
        let moved = format!("{} -> column {}", cmd.card, cmd.column);
        Ok(ExecutionResult::success().with_message(moved))
    }
}

#[derive(Serialize)]
struct Line {
    sequence: u64,
    id: CommandId,
    command: &'static str,
    stage: LifecycleStage,
    outcome: Option<Outcome>,
    message: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DispatcherConfig::builder()
        .default_timeout(Duration::from_secs(2))
        .build();
    let dispatcher = CommandDispatcher::with_config(config);
    dispatcher.register_handler::<Cook, _>(Arc::new(Kitchen));
    dispatcher.register_handler::<Move, _>(Arc::new(Board));

    let journal = Arc::new(Mutex::new(Vec::new()));
    for stage in [
        LifecycleStage::Completed,
        LifecycleStage::Failed,
        LifecycleStage::Cancelled,
    ] {
        let journal = journal.clone();
        dispatcher.notifier().subscribe(stage, move |event| {
            let line = Line {
                sequence: event.sequence,
                id: event.command.id(),
                command: event.command.name(),
                stage: event.stage,
                outcome: event.result.as_ref().map(|r| r.outcome()),
                message: event.result.as_ref().and_then(|r| r.message().map(str::to_owned)),
            };
            if let Ok(mut journal) = journal.lock() {
                journal.push(line);
            }
        });
    }

    // 烹饪占用食材 tomato，随后的移动命令因资源被占用而失败
    dispatcher.enqueue(Cook {
        station: "grill".into(),
        ingredient: "tomato".into(),
        minutes: 5,
    })?;
    dispatcher.enqueue(Move {
        card: "tomato".into(),
        column: 2,
    })?;
    dispatcher.enqueue(Attack)?;
    dispatcher.enqueue(Cook {
        station: "oven".into(),
        ingredient: "bread".into(),
        minutes: 0,
    })?;
    dispatcher.wait_idle().await;

    // 锁释放后重新提交
    dispatcher.enqueue(Move {
        card: "tomato".into(),
        column: 2,
    })?;
    dispatcher.wait_idle().await;

    // 长时间烹饪被中途取消
    let stew = dispatcher.enqueue(Cook {
        station: "stove".into(),
        ingredient: "stew".into(),
        minutes: 100,
    })?;
    while dispatcher.executing_command_count() == 0 {
        tokio::task::yield_now().await;
    }
    let cancelled = dispatcher.try_cancel(&stew).await;
    info!(cancelled, "stew cancellation requested");

    dispatcher.dispose().await;

    let lines = std::mem::take(&mut *journal.lock().unwrap_or_else(PoisonError::into_inner));
    println!("{}", serde_json::to_string_pretty(&lines)?);
    Ok(())
}
