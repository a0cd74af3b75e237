//! 生命周期通知器（LifecycleNotifier）
//!
//! 五个相互独立的通道，每个通道可挂载零个或多个订阅者：
//! - 订阅者在发布方的调用栈上同步执行，慢订阅者会直接拖慢调度吞吐；
//! - 发布时先在读锁下快照订阅者列表，调用订阅者时不持有任何锁；
//! - 单个订阅者 panic 会被捕获并记录，不影响其他订阅者与调度循环；
//! - 另提供基于 `tokio::sync::broadcast` 的 `'static` 事件流，便于在 `tokio::spawn` 中消费，
//!   落后的接收端会跳过丢失的事件而不是报错。
//!
//! 同一命令的事件按发布顺序送达；不同命令之间不保证顺序。
//!
use super::event::{LifecycleEvent, LifecycleStage};
use crate::command::CommandRef;
use crate::error::panic_message;
use crate::result::ExecutionResult;
use chrono::Utc;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, future, stream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

type Subscriber = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

type Channels = [Vec<(SubscriptionId, Subscriber)>; 5];

/// 订阅句柄，用于显式退订
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct LifecycleNotifier {
    channels: RwLock<Channels>,
    stream_tx: RwLock<Option<broadcast::Sender<LifecycleEvent>>>,
    next_subscription: AtomicU64,
    next_sequence: AtomicU64,
}

impl Default for LifecycleNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LifecycleNotifier {
    /// `stream_capacity` 为事件流的广播缓冲区容量
    pub fn new(stream_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(stream_capacity.max(1));
        Self {
            channels: RwLock::new(Channels::default()),
            stream_tx: RwLock::new(Some(tx)),
            next_subscription: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// 在指定通道上挂载订阅者
    pub fn subscribe<F>(&self, stage: LifecycleStage, subscriber: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.write_channels()[stage.index()].push((id, Arc::new(subscriber)));
        id
    }

    pub fn on_enqueued<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.subscribe(LifecycleStage::Enqueued, subscriber)
    }

    pub fn on_executing<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.subscribe(LifecycleStage::Executing, subscriber)
    }

    pub fn on_completed<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.subscribe(LifecycleStage::Completed, subscriber)
    }

    pub fn on_failed<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.subscribe(LifecycleStage::Failed, subscriber)
    }

    pub fn on_cancelled<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.subscribe(LifecycleStage::Cancelled, subscriber)
    }

    /// 退订；句柄不存在时返回 `false`
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut channels = self.write_channels();
        for subscribers in channels.iter_mut() {
            if let Some(pos) = subscribers.iter().position(|(sid, _)| *sid == id) {
                subscribers.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, stage: LifecycleStage) -> usize {
        self.read_channels()[stage.index()].len()
    }

    /// 返回 `'static` 生命周期的事件流
    ///
    /// 通知器被 `clear` 之后返回的流立即结束。
    pub fn stream(&self) -> BoxStream<'static, LifecycleEvent> {
        let rx = match self.stream_sender().as_ref() {
            Some(tx) => tx.subscribe(),
            None => return Box::pin(stream::empty()),
        };

        let events = BroadcastStream::new(rx).filter_map(|item| {
            future::ready(match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "lifecycle stream lagged, events dropped");
                    None
                }
            })
        });
        Box::pin(events)
    }

    /// 构造事件并扇出到对应通道与事件流
    pub fn publish(
        &self,
        stage: LifecycleStage,
        command: &CommandRef,
        result: Option<ExecutionResult>,
    ) -> LifecycleEvent {
        let event = LifecycleEvent {
            stage,
            command: command.clone(),
            result,
            timestamp: Utc::now(),
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
        };
        self.emit(&event);
        event
    }

    /// 退订全部订阅者并关闭事件流
    pub fn clear(&self) {
        for subscribers in self.write_channels().iter_mut() {
            subscribers.clear();
        }
        // 丢弃发送端后，已有的事件流在取完缓冲后自然结束
        self.stream_sender_mut().take();
    }

    fn emit(&self, event: &LifecycleEvent) {
        let subscribers: Vec<Subscriber> = self.read_channels()[event.stage.index()]
            .iter()
            .map(|(_, s)| s.clone())
            .collect();

        for subscriber in subscribers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                tracing::warn!(
                    stage = %event.stage,
                    command = event.command.name(),
                    id = %event.command.id(),
                    panic = %panic_message(&*payload),
                    "lifecycle subscriber panicked"
                );
            }
        }

        if let Some(tx) = self.stream_sender().as_ref() {
            // 若当前无流订阅者，broadcast 的 send 会返回错误，这里视为非致命并忽略
            let _ = tx.send(event.clone());
        }
    }

    fn read_channels(&self) -> RwLockReadGuard<'_, Channels> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_channels(&self) -> RwLockWriteGuard<'_, Channels> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn stream_sender(&self) -> RwLockReadGuard<'_, Option<broadcast::Sender<LifecycleEvent>>> {
        self.stream_tx.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn stream_sender_mut(
        &self,
    ) -> RwLockWriteGuard<'_, Option<broadcast::Sender<LifecycleEvent>>> {
        self.stream_tx.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandId};
    use crate::result::Outcome;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Cook;

    impl Command for Cook {
        const NAME: &'static str = "Cook";
    }

    fn cook(id: u64) -> CommandRef {
        CommandRef::new(CommandId::new(id), Cook)
    }

    #[test]
    fn delivers_only_to_matching_channel_in_order() {
        let notifier = LifecycleNotifier::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for stage in LifecycleStage::ALL {
            let seen = seen.clone();
            notifier.subscribe(stage, move |e| seen.lock().unwrap().push(e.stage));
        }

        let cmd = cook(1);
        notifier.publish(LifecycleStage::Enqueued, &cmd, None);
        notifier.publish(LifecycleStage::Executing, &cmd, None);
        notifier.publish(
            LifecycleStage::Completed,
            &cmd,
            Some(ExecutionResult::success()),
        );

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                LifecycleStage::Enqueued,
                LifecycleStage::Executing,
                LifecycleStage::Completed
            ]
        );
    }

    #[test]
    fn sequence_is_strictly_increasing() {
        let notifier = LifecycleNotifier::default();
        let cmd = cook(1);

        let a = notifier.publish(LifecycleStage::Enqueued, &cmd, None);
        let b = notifier.publish(LifecycleStage::Executing, &cmd, None);
        assert!(b.sequence > a.sequence);
        assert!(b.timestamp >= a.timestamp);
    }

    #[test]
    fn unsubscribe_detaches_single_subscriber() {
        let notifier = LifecycleNotifier::default();
        let hits = Arc::new(Mutex::new(0));

        let first = {
            let hits = hits.clone();
            notifier.on_failed(move |_| *hits.lock().unwrap() += 1)
        };
        {
            let hits = hits.clone();
            notifier.on_failed(move |_| *hits.lock().unwrap() += 10);
        }

        assert!(notifier.unsubscribe(first));
        assert!(!notifier.unsubscribe(first));
        assert_eq!(notifier.subscriber_count(LifecycleStage::Failed), 1);

        notifier.publish(LifecycleStage::Failed, &cook(1), None);
        assert_eq!(*hits.lock().unwrap(), 10);
    }

    #[test]
    fn panicking_subscriber_does_not_starve_others() {
        let notifier = LifecycleNotifier::default();
        let hits = Arc::new(Mutex::new(0));

        notifier.on_completed(|_| panic!("subscriber bug"));
        {
            let hits = hits.clone();
            notifier.on_completed(move |_| *hits.lock().unwrap() += 1);
        }

        notifier.publish(LifecycleStage::Completed, &cook(1), None);
        notifier.publish(LifecycleStage::Completed, &cook(2), None);
        assert_eq!(*hits.lock().unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stream_observes_published_events() {
        let notifier = LifecycleNotifier::new(16);
        let mut events = notifier.stream();

        let cmd = cook(5);
        notifier.publish(LifecycleStage::Enqueued, &cmd, None);
        notifier.publish(
            LifecycleStage::Cancelled,
            &cmd,
            Some(ExecutionResult::cancelled()),
        );

        let first = events.next().await.unwrap();
        let second = events.next().await.unwrap();
        assert_eq!(first.stage, LifecycleStage::Enqueued);
        assert_eq!(second.command, cmd);
        assert_eq!(
            second.result.map(|r| r.outcome()),
            Some(Outcome::Cancelled)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clear_detaches_subscribers_and_ends_streams() {
        let notifier = LifecycleNotifier::default();
        let mut events = notifier.stream();
        notifier.on_enqueued(|_| {});

        notifier.clear();

        assert_eq!(notifier.subscriber_count(LifecycleStage::Enqueued), 0);
        let ended = tokio::time::timeout(Duration::from_secs(1), events.next()).await;
        assert!(matches!(ended, Ok(None)));
        assert!(notifier.stream().next().await.is_none());
    }
}
