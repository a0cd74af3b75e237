use dispatch_domain::command::Command;
use dispatch_domain::lock_key::LockKey;
use dispatch_macros::command;

#[command]
struct Ping;

#[command(name = "card.move", sequential)]
struct Move {
    #[lock_key(scope = "card")]
    card: u32,
    to: (i32, i32),
}

fn main() {
    assert_eq!(Ping::NAME, "Ping");
    assert!(Ping.allows_concurrent_execution());
    assert!(Ping.lock_keys().is_empty());
    assert_eq!(Ping.timeout(), None);

    let m = Move { card: 7, to: (1, 2) };
    assert_eq!(Move::NAME, "card.move");
    assert!(!m.allows_concurrent_execution());
    assert_eq!(m.lock_keys(), vec![LockKey::from("card:7")]);
    assert_eq!(m.to, (1, 2));
}
