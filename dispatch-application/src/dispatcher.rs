//! 命令调度器（CommandDispatcher）
//!
//! 进程内的异步命令调度：
//! - 入队即发布 enqueued，命令进入 FIFO 队列；
//! - 同一时刻至多存在一个调度循环任务，队列非空时按需启动、队列排空后退出；
//! - 循环逐个出队：查找处理器 → 校验 → 整组加锁 → 发布 executing → 派生执行任务；
//! - 不允许并发的命令会阻塞循环直至其执行结束；其余命令派生后循环立即继续；
//! - 执行任务结束时先释放锁，再发布唯一的终态事件（completed/failed/cancelled）。
//!
//! 取消分两层：每个调度器持有一个根令牌，每个执行中的命令持有其子令牌。
//! `try_cancel` 只作用于单个执行中的命令；`cancel_all` 触发根令牌并换上新令牌，
//! 同时排空队列，之后调度器仍可继续接收命令。
//!
use crate::command_handler::CommandHandler;
use crate::config::DispatcherConfig;
use crate::in_flight::{Completion, InFlight, InFlightTable};
use crate::registry::{HandlerRegistry, RegisteredHandler};
use dispatch_domain::command::{Command, CommandId, CommandRef};
use dispatch_domain::error::{DispatchError, DispatchResult};
use dispatch_domain::lifecycle::{LifecycleNotifier, LifecycleStage};
use dispatch_domain::lock_manager::{EntityLockManager, LockGuard};
use dispatch_domain::result::{ExecutionResult, Outcome};
use futures_util::FutureExt;
use futures_util::future::join_all;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 进程内命令调度器
///
/// 需在 tokio 运行时内入队命令。调度器不可克隆，需要共享时由调用方包一层 `Arc`。
/// 使用完毕后应调用 [`CommandDispatcher::dispose`]；直接丢弃时只能发出取消信号，
/// 无法等待执行中的命令收尾。
pub struct CommandDispatcher {
    shared: Arc<Shared>,
}

struct Shared {
    config: DispatcherConfig,
    registry: HandlerRegistry,
    locks: Arc<EntityLockManager>,
    notifier: LifecycleNotifier,
    state: Mutex<State>,
    next_id: AtomicU64,
    idle: Notify,
    // 准备阶段或入队过程结束时通知
    settled: Notify,
}

struct State {
    queue: VecDeque<CommandRef>,
    in_flight: InFlightTable,
    loop_running: bool,
    // 已出队、尚未登记为执行中也未发布终态的命令，记录其出队时的代次
    preparing: Option<u64>,
    // 已通过销毁检查、尚未入队或收尾的 enqueue 调用数
    enqueuing: usize,
    disposed: bool,
    root: CancellationToken,
    // 每次 cancel_all 换根令牌时递增
    epoch: u64,
}

impl State {
    fn is_idle(&self) -> bool {
        !self.loop_running && self.queue.is_empty() && self.in_flight.is_empty()
    }
}

// 通过校验与加锁、即将执行的命令
struct Prepared {
    handler: RegisteredHandler,
    guard: LockGuard,
    sequential: bool,
    timeout: Option<Duration>,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::with_config(DispatcherConfig::default())
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        let shared = Shared {
            config,
            registry: HandlerRegistry::new(),
            locks: Arc::new(EntityLockManager::new()),
            notifier: LifecycleNotifier::new(config.event_stream_capacity),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                in_flight: InFlightTable::default(),
                loop_running: false,
                preparing: None,
                enqueuing: 0,
                disposed: false,
                root: CancellationToken::new(),
                epoch: 0,
            }),
            next_id: AtomicU64::new(1),
            idle: Notify::new(),
            settled: Notify::new(),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// 生命周期事件的订阅入口
    pub fn notifier(&self) -> &LifecycleNotifier {
        &self.shared.notifier
    }

    pub fn lock_manager(&self) -> &EntityLockManager {
        &self.shared.locks
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    /// 为命令类型 `C` 注册处理器，重复注册时后者覆盖前者
    pub fn register_handler<C, H>(&self, handler: Arc<H>)
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        self.shared.registry.register::<C, H>(handler);
    }

    /// 命令入队
    ///
    /// 分配标识并立即发布 enqueued；若当前没有调度循环则启动一个。
    /// 不在 tokio 运行时内调用时返回 `RuntimeUnavailable`，调度器已销毁时返回 `Disposed`。
    pub fn enqueue<C: Command>(&self, command: C) -> DispatchResult<CommandRef> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::RuntimeUnavailable)?;
        {
            let mut state = self.shared.lock_state();
            if state.disposed {
                return Err(DispatchError::Disposed);
            }
            // dispose 需等到本次调用收尾后才能清空订阅者
            state.enqueuing += 1;
        }

        let id = CommandId::new(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let command = CommandRef::new(id, command);
        debug!(command = command.name(), %id, "command enqueued");
        // 先发布再入队，保证 enqueued 总是先于该命令的任何后续事件
        self.shared
            .notifier
            .publish(LifecycleStage::Enqueued, &command, None);

        let start_loop = {
            let mut state = self.shared.lock_state();
            if state.disposed {
                None
            } else {
                state.enqueuing -= 1;
                state.queue.push_back(command.clone());
                Some(!std::mem::replace(&mut state.loop_running, true))
            }
        };

        let outcome = match start_loop {
            // 发布 enqueued 之后被销毁：该命令以取消收尾
            None => {
                self.shared.cancel_unstarted(&command);
                self.shared.lock_state().enqueuing -= 1;
                Err(DispatchError::Disposed)
            }
            Some(true) => {
                runtime.spawn(self.shared.clone().run_loop());
                Ok(command)
            }
            Some(false) => Ok(command),
        };
        self.shared.settled.notify_waiters();
        outcome
    }

    /// 取消一个正在执行的命令
    ///
    /// 仅对已登记为执行中、尚未产生终态事件的命令有效；排队中、仍在校验或已结束的命令返回 `false`。
    /// 执行任务总在 executing 发布之后才启动，因此 cancelled 仍排在 executing 之后。
    /// 返回 `true` 时，该命令的锁已释放且 cancelled 事件已发布。
    pub async fn try_cancel(&self, command: &CommandRef) -> bool {
        let completion = self.shared.lock_state().in_flight.request_cancel(command);
        let Some(completion) = completion else {
            debug!(command = command.name(), id = %command.id(), "command not executing, nothing to cancel");
            return false;
        };

        info!(command = command.name(), id = %command.id(), "cancelling command");
        completion.wait().await;
        true
    }

    /// 取消全部命令：排队中的直接以取消收尾，执行中的收到取消信号并等待其结束
    ///
    /// 返回后没有任何命令持有锁；调度器保持可用。
    pub async fn cancel_all(&self) {
        let (epoch, drained, completions) = {
            let mut state = self.shared.lock_state();
            state.root.cancel();
            state.root = CancellationToken::new();
            let epoch = state.epoch;
            state.epoch += 1;
            let drained: Vec<CommandRef> = state.queue.drain(..).collect();
            (epoch, drained, state.in_flight.request_cancel_all())
        };

        info!(
            queued = drained.len(),
            executing = completions.len(),
            "cancelling all commands"
        );
        for command in &drained {
            self.shared.cancel_unstarted(command);
        }
        join_all(completions.into_iter().map(Completion::wait)).await;
        // 旧根令牌下正在准备的命令会看到令牌已取消，等它以取消收尾；
        // 新根令牌下出队的命令与本次取消无关
        self.shared
            .wait_until(|state| state.preparing.is_none_or(|popped| popped > epoch))
            .await;
        self.shared.notify_if_idle();
    }

    pub fn queued_command_count(&self) -> usize {
        self.shared.lock_state().queue.len()
    }

    pub fn executing_command_count(&self) -> usize {
        self.shared.lock_state().in_flight.len()
    }

    /// 队列为空、没有执行中的命令且调度循环未运行
    pub fn is_idle(&self) -> bool {
        self.shared.lock_state().is_idle()
    }

    /// 等待调度器进入空闲状态
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.shared.idle.notified());
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock_state().disposed
    }

    /// 销毁调度器：拒绝新命令，取消全部命令并等待收尾，随后清空订阅、处理器与锁表
    ///
    /// 重复调用无副作用。
    pub async fn dispose(&self) {
        let first = {
            let mut state = self.shared.lock_state();
            !std::mem::replace(&mut state.disposed, true)
        };
        if !first {
            return;
        }

        info!("disposing command dispatcher");
        self.cancel_all().await;
        // 与销毁竞争的 enqueue 可能刚发布 enqueued，等它发布终态后再摘除订阅者
        self.shared.wait_until(|state| state.enqueuing == 0).await;
        self.shared.notifier.clear();
        self.shared.registry.clear();
        self.shared.locks.clear();
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        let drained: Vec<CommandRef> = {
            let mut state = self.shared.lock_state();
            state.disposed = true;
            state.root.cancel();
            // 执行中的命令由各自的执行任务发布 cancelled，此处不等待
            let _ = state.in_flight.request_cancel_all();
            state.queue.drain(..).collect()
        };
        for command in &drained {
            self.shared.cancel_unstarted(command);
        }
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_loop(self: Arc<Self>) {
        debug!("dispatch loop started");
        loop {
            let next = {
                let mut state = self.lock_state();
                let next = if state.disposed {
                    None
                } else {
                    state
                        .queue
                        .pop_front()
                        .map(|command| (command, state.root.clone()))
                };
                let epoch = state.epoch;
                state.preparing = next.as_ref().map(|_| epoch);
                if next.is_none() {
                    state.loop_running = false;
                }
                next
            };

            let Some((command, root)) = next else {
                break;
            };
            self.process(command, root).await;
        }
        debug!("dispatch loop stopped");
        self.notify_if_idle();
    }

    async fn process(self: &Arc<Self>, command: CommandRef, root: CancellationToken) {
        let prepared = match self.prepare(&command) {
            Ok(prepared) => prepared,
            Err(result) => {
                self.publish_terminal(&command, result);
                self.settle_preparation();
                return;
            }
        };

        let entry = InFlight::new(command.clone(), root.child_token());
        let registered = {
            let mut state = self.lock_state();
            // 出队之后、登记之前发生了 cancel_all
            let aborted = root.is_cancelled() || state.disposed;
            if !aborted {
                state.in_flight.insert(entry.clone());
                state.preparing = None;
            }
            !aborted
        };
        if !registered {
            drop(prepared.guard);
            self.cancel_unstarted(&command);
            self.settle_preparation();
            return;
        }
        self.settled.notify_waiters();

        debug!(
            command = command.name(),
            id = %command.id(),
            keys = ?prepared.guard.keys(),
            "command executing"
        );
        self.notifier
            .publish(LifecycleStage::Executing, &command, None);

        let Prepared {
            handler,
            guard,
            sequential,
            timeout,
        } = prepared;
        let task = tokio::spawn(self.clone().execute(entry, handler, guard, timeout));

        // 根令牌取消会经子令牌传到执行任务，任务随即收尾，这里照常等待
        if sequential && task.await.is_err() {
            warn!(command = command.name(), id = %command.id(), "sequential command task aborted");
        }
    }

    fn settle_preparation(&self) {
        self.lock_state().preparing = None;
        self.settled.notify_waiters();
    }

    /// 等待状态满足条件，条件只在准备阶段或入队结束时重新检查
    async fn wait_until(&self, ready: impl Fn(&State) -> bool) {
        loop {
            let mut notified = std::pin::pin!(self.settled.notified());
            notified.as_mut().enable();
            if ready(&self.lock_state()) {
                return;
            }
            notified.await;
        }
    }

    /// 查找处理器、校验、整组加锁；任一步失败即给出终态结果，不会重试
    fn prepare(&self, command: &CommandRef) -> Result<Prepared, ExecutionResult> {
        let Some(handler) = self.registry.resolve(command) else {
            warn!(command = command.name(), id = %command.id(), "no handler registered");
            return Err(ExecutionResult::execution_error(
                DispatchError::HandlerNotFound(command.name()),
            ));
        };

        let validation = guarded(command, || handler.validate(command))?
            .map_err(ExecutionResult::execution_error)?;
        if !validation.is_valid() {
            let message = validation.error_message().unwrap_or("validation failed");
            debug!(command = command.name(), id = %command.id(), reason = message, "command rejected");
            return Err(ExecutionResult::validation_failed(message));
        }

        let (keys, sequential, timeout) = guarded(command, || {
            (
                command.lock_keys(),
                !command.allows_concurrent_execution(),
                command.timeout(),
            )
        })?;

        let Some(guard) = self.locks.try_acquire_guard(&keys) else {
            debug!(command = command.name(), id = %command.id(), ?keys, "entity locked");
            return Err(ExecutionResult::entity_locked(&keys));
        };

        Ok(Prepared {
            handler,
            guard,
            sequential,
            timeout: timeout.or(self.config.default_timeout),
        })
    }

    async fn execute(
        self: Arc<Self>,
        entry: Arc<InFlight>,
        handler: RegisteredHandler,
        guard: LockGuard,
        timeout: Option<Duration>,
    ) {
        let command = entry.command().clone();
        let token = entry.token().clone();
        let run = AssertUnwindSafe(handler.execute(command.clone(), token.clone())).catch_unwind();
        // 取消后不再等待处理器自行返回，直接丢弃其 future
        let watched = async {
            tokio::select! {
                biased;
                outcome = run => settle(&command, outcome),
                _ = token.cancelled() => {
                    debug!(command = command.name(), id = %command.id(), "handler dropped after cancellation");
                    ExecutionResult::cancelled().with_message("cancellation requested")
                }
            }
        };

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, watched).await {
                Ok(result) => result,
                Err(_) => {
                    entry.token().cancel();
                    warn!(command = command.name(), id = %command.id(), ?limit, "command deadline exceeded");
                    ExecutionResult::cancelled()
                        .with_message("deadline exceeded")
                        .with_cause(DispatchError::DeadlineExceeded {
                            command: command.name(),
                            timeout: limit,
                        })
                }
            },
            None => watched.await,
        };

        // 锁必须先于终态事件释放
        drop(guard);
        self.finish(&entry, result);
    }

    fn finish(&self, entry: &InFlight, result: ExecutionResult) {
        let command = entry.command();
        let cancel_requested = {
            let mut state = self.lock_state();
            state.in_flight.remove(command.id());
            entry.cancel_requested()
        };

        // 已请求取消的命令无论处理器返回什么都以取消收尾
        let result = if cancel_requested && result.outcome() != Outcome::Cancelled {
            ExecutionResult::cancelled().with_message("cancellation requested")
        } else {
            result
        };
        if result.outcome() == Outcome::Cancelled {
            invoke_on_cancelled(command);
        }

        self.publish_terminal(command, result);
        entry.mark_done();
        self.notify_if_idle();
    }

    /// 未进入执行即被取消的命令
    fn cancel_unstarted(&self, command: &CommandRef) {
        invoke_on_cancelled(command);
        self.publish_terminal(
            command,
            ExecutionResult::cancelled().with_message("cancelled before execution"),
        );
    }

    fn publish_terminal(&self, command: &CommandRef, result: ExecutionResult) {
        let stage = result.outcome().terminal_stage();
        debug!(
            command = command.name(),
            id = %command.id(),
            outcome = %result.outcome(),
            "command finished"
        );
        self.notifier.publish(stage, command, Some(result));
    }

    fn notify_if_idle(&self) {
        if self.lock_state().is_idle() {
            self.idle.notify_waiters();
        }
    }
}

// 在隔离 panic 的前提下调用命令或处理器的同步代码
fn guarded<T>(command: &CommandRef, f: impl FnOnce() -> T) -> Result<T, ExecutionResult> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let err = DispatchError::panicked(command.name(), &*payload);
        warn!(command = command.name(), id = %command.id(), error = %err, "synchronous callback panicked");
        ExecutionResult::execution_error(err)
    })
}

fn settle(
    command: &CommandRef,
    outcome: Result<anyhow::Result<ExecutionResult>, Box<dyn Any + Send>>,
) -> ExecutionResult {
    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            warn!(command = command.name(), id = %command.id(), error = %err, "command handler failed");
            ExecutionResult::execution_error(err)
        }
        Err(payload) => {
            let err = DispatchError::panicked(command.name(), &*payload);
            warn!(command = command.name(), id = %command.id(), error = %err, "command handler panicked");
            ExecutionResult::execution_error(err)
        }
    }
}

fn invoke_on_cancelled(command: &CommandRef) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| command.on_cancelled())) {
        let err = DispatchError::panicked(command.name(), &*payload);
        warn!(command = command.name(), id = %command.id(), error = %err, "on_cancelled callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dispatch_domain::lock_key::LockKey;
    use dispatch_domain::result::ValidationResult;
    use std::sync::atomic::AtomicUsize;

    struct Stir {
        pot: u32,
    }

    impl Command for Stir {
        const NAME: &'static str = "Stir";

        fn lock_keys(&self) -> Vec<LockKey> {
            vec![LockKey::scoped("pot", self.pot)]
        }
    }

    struct StirHandler {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler<Stir> for StirHandler {
        fn validate(&self, cmd: &Stir) -> ValidationResult {
            if cmd.pot == 0 {
                ValidationResult::invalid("no pot")
            } else {
                ValidationResult::valid()
            }
        }

        async fn execute(
            &self,
            _cmd: &Stir,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ExecutionResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult::success())
        }
    }

    fn outcomes(dispatcher: &CommandDispatcher) -> Arc<Mutex<Vec<(u64, Outcome)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for stage in [
            LifecycleStage::Completed,
            LifecycleStage::Failed,
            LifecycleStage::Cancelled,
        ] {
            let seen = seen.clone();
            dispatcher.notifier().subscribe(stage, move |event| {
                let outcome = event.result.as_ref().map(|r| r.outcome());
                if let Some(outcome) = outcome {
                    seen.lock()
                        .unwrap()
                        .push((event.command.id().value(), outcome));
                }
            });
        }
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn enqueue_runs_handler_and_goes_idle() {
        let dispatcher = CommandDispatcher::new();
        let handler = Arc::new(StirHandler {
            runs: AtomicUsize::new(0),
        });
        dispatcher.register_handler::<Stir, _>(handler.clone());
        let seen = outcomes(&dispatcher);

        let cmd = dispatcher.enqueue(Stir { pot: 1 }).unwrap();
        assert_eq!(cmd.id().value(), 1);

        tokio::time::timeout(Duration::from_secs(2), dispatcher.wait_idle())
            .await
            .unwrap();
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().as_slice(), &[(1, Outcome::Success)]);
        assert_eq!(dispatcher.lock_manager().held_count(), 0);
        assert!(dispatcher.is_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_and_unhandled_commands_fail_without_running() {
        struct Taste;
        impl Command for Taste {
            const NAME: &'static str = "Taste";
        }

        let dispatcher = CommandDispatcher::new();
        let handler = Arc::new(StirHandler {
            runs: AtomicUsize::new(0),
        });
        dispatcher.register_handler::<Stir, _>(handler.clone());
        let seen = outcomes(&dispatcher);

        dispatcher.enqueue(Stir { pot: 0 }).unwrap();
        dispatcher.enqueue(Taste).unwrap();
        tokio::time::timeout(Duration::from_secs(2), dispatcher.wait_idle())
            .await
            .unwrap();

        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(1, Outcome::ValidationFailed), (2, Outcome::ExecutionError)]
        );
    }

    #[test]
    fn enqueue_outside_runtime_is_rejected() {
        let dispatcher = CommandDispatcher::new();
        let err = dispatcher.enqueue(Stir { pot: 1 }).unwrap_err();

        assert!(matches!(err, DispatchError::RuntimeUnavailable));
        assert_eq!(dispatcher.queued_command_count(), 0);
    }

    #[tokio::test]
    async fn dispose_rejects_further_commands() {
        let dispatcher = CommandDispatcher::new();
        dispatcher.dispose().await;
        dispatcher.dispose().await;

        assert!(dispatcher.is_disposed());
        assert!(matches!(
            dispatcher.enqueue(Stir { pot: 1 }),
            Err(DispatchError::Disposed)
        ));
    }

    #[tokio::test]
    async fn cancelling_unknown_command_returns_false() {
        let dispatcher = CommandDispatcher::new();
        let stranger = CommandRef::new(CommandId::new(1), Stir { pot: 1 });

        assert!(!dispatcher.try_cancel(&stranger).await);
        dispatcher.cancel_all().await;
        assert!(dispatcher.is_idle());
    }

    #[tokio::test]
    async fn panicking_validation_becomes_execution_error() {
        struct Boil;
        impl Command for Boil {
            const NAME: &'static str = "Boil";
        }

        struct BoilHandler;

        #[async_trait]
        impl CommandHandler<Boil> for BoilHandler {
            fn validate(&self, _cmd: &Boil) -> ValidationResult {
                panic!("thermometer broke");
            }

            async fn execute(
                &self,
                _cmd: &Boil,
                _cancel: CancellationToken,
            ) -> anyhow::Result<ExecutionResult> {
                Ok(ExecutionResult::success())
            }
        }

        let dispatcher = CommandDispatcher::new();
        dispatcher.register_handler::<Boil, _>(Arc::new(BoilHandler));
        let seen = outcomes(&dispatcher);

        dispatcher.enqueue(Boil).unwrap();
        tokio::time::timeout(Duration::from_secs(2), dispatcher.wait_idle())
            .await
            .unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(1, Outcome::ExecutionError)]
        );
    }
}
