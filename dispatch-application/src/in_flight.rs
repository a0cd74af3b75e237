//! 在途命令登记表
//!
//! 记录已进入 executing 阶段、尚未产生终态事件的命令，供取消查找使用。
//! 表本身不加锁，所有读写都发生在调度器状态锁内；取消请求只做标记并触发令牌，
//! 终态事件始终由执行任务自己发出，从而保证每个命令恰好一个终态事件。
//!
use dispatch_domain::command::{CommandId, CommandRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub(crate) struct InFlight {
    command: CommandRef,
    token: CancellationToken,
    cancel_requested: AtomicBool,
    done: watch::Sender<bool>,
}

impl InFlight {
    pub(crate) fn new(command: CommandRef, token: CancellationToken) -> Arc<Self> {
        let (done, _rx) = watch::channel(false);
        Arc::new(Self {
            command,
            token,
            cancel_requested: AtomicBool::new(false),
            done,
        })
    }

    pub(crate) fn command(&self) -> &CommandRef {
        &self.command
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// 标记取消并触发令牌，返回可等待执行结束的接收端
    pub(crate) fn request_cancel(&self) -> Completion {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.token.cancel();
        Completion(self.done.subscribe())
    }

    /// 终态事件发出后调用
    pub(crate) fn mark_done(&self) {
        self.done.send_replace(true);
    }
}

/// 等待某个在途命令结束（锁已释放、终态事件已发出）
pub(crate) struct Completion(watch::Receiver<bool>);

impl Completion {
    pub(crate) async fn wait(mut self) {
        // 发送端被丢弃同样意味着执行任务已经结束
        let _ = self.0.wait_for(|finished| *finished).await;
    }
}

#[derive(Default)]
pub(crate) struct InFlightTable {
    entries: HashMap<CommandId, Arc<InFlight>>,
}

impl InFlightTable {
    pub(crate) fn insert(&mut self, entry: Arc<InFlight>) {
        self.entries.insert(entry.command().id(), entry);
    }

    pub(crate) fn remove(&mut self, id: CommandId) -> Option<Arc<InFlight>> {
        self.entries.remove(&id)
    }

    /// 仅当登记的正是同一个命令实例时才发起取消
    pub(crate) fn request_cancel(&self, command: &CommandRef) -> Option<Completion> {
        self.entries
            .get(&command.id())
            .filter(|entry| entry.command() == command)
            .map(|entry| entry.request_cancel())
    }

    pub(crate) fn request_cancel_all(&self) -> Vec<Completion> {
        self.entries
            .values()
            .map(|entry| entry.request_cancel())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_domain::command::Command;
    use std::time::Duration;

    struct Bake;

    impl Command for Bake {
        const NAME: &'static str = "Bake";
    }

    fn entry(id: u64) -> Arc<InFlight> {
        InFlight::new(
            CommandRef::new(CommandId::new(id), Bake),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn cancel_request_signals_token_and_waits_for_done() {
        let mut table = InFlightTable::default();
        let bake = entry(1);
        table.insert(bake.clone());

        let completion = table.request_cancel(bake.command()).unwrap();
        assert!(bake.cancel_requested());
        assert!(bake.token().is_cancelled());

        let waiter = tokio::spawn(completion.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        table.remove(CommandId::new(1));
        bake.mark_done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn completion_resolves_when_entry_is_dropped() {
        let bake = entry(2);
        let completion = bake.request_cancel();
        drop(bake);

        tokio::time::timeout(Duration::from_secs(1), completion.wait())
            .await
            .unwrap();
    }

    #[test]
    fn only_registered_instances_are_cancellable() {
        let mut table = InFlightTable::default();
        table.insert(entry(1));
        table.insert(entry(2));

        let stranger = CommandRef::new(CommandId::new(9), Bake);
        assert!(table.request_cancel(&stranger).is_none());
        // 相同 ID、不同实例同样不可取消
        let impostor = CommandRef::new(CommandId::new(1), Bake);
        assert!(table.request_cancel(&impostor).is_none());
        assert_eq!(table.request_cancel_all().len(), 2);
        assert_eq!(table.len(), 2);
    }
}
