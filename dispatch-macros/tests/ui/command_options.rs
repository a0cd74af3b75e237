use dispatch_domain::command::Command;
use dispatch_domain::lock_key::LockKey;
use dispatch_macros::command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

static REFUNDS: AtomicUsize = AtomicUsize::new(0);

#[command(name = "kitchen.cook", timeout_ms = 250, on_cancelled = Self::refund)]
struct Cook {
    #[lock_key(scope = "station")]
    station: String,
    #[lock_key]
    ingredient: Option<String>,
    #[lock_key(each, scope = "tool")]
    tools: Vec<u8>,
}

impl Cook {
    fn refund(&self) {
        REFUNDS.fetch_add(1, Ordering::SeqCst);
    }
}

// tuple 结构体同样支持
#[command]
struct Swap(#[lock_key] String, #[lock_key] String);

fn main() {
    let cook = Cook {
        station: "a".into(),
        ingredient: Some("b".into()),
        tools: vec![1, 2],
    };
    assert_eq!(
        cook.lock_keys(),
        vec![
            LockKey::from("station:a"),
            "b".into(),
            "tool:1".into(),
            "tool:2".into()
        ]
    );
    assert_eq!(cook.timeout(), Some(Duration::from_millis(250)));
    assert!(cook.allows_concurrent_execution());

    // None 字段不产生锁键
    let bare = Cook {
        station: "a".into(),
        ingredient: None,
        tools: Vec::new(),
    };
    assert_eq!(bare.lock_keys(), vec![LockKey::from("station:a")]);

    cook.on_cancelled();
    assert_eq!(REFUNDS.load(Ordering::SeqCst), 1);

    let swap = Swap("x".into(), "y".into());
    assert_eq!(Swap::NAME, "Swap");
    assert_eq!(swap.lock_keys(), vec![LockKey::from("x"), LockKey::from("y")]);
}
