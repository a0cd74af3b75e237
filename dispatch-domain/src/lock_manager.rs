//! 实体锁管理器（EntityLockManager）
//!
//! 维护当前被占用的锁键集合，提供“整组要么全部获取、要么一个都不获取”的原子加锁：
//! - `try_acquire`：非阻塞；任一键已被占用则立即返回 `false`，不留下部分锁；
//! - `release`：幂等释放，未持有的键直接忽略；
//! - `try_acquire_guard`：返回 RAII 守卫，守卫析构时释放恰好本次获取的键。
//!
//! 所有操作都在同一把互斥锁的临界区内完成，临界区内不调用任何外部代码。
//! 是否重试由调用方（调度器）决定，管理器本身从不等待。
//!
use crate::lock_key::LockKey;
use std::borrow::Borrow;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct EntityLockManager {
    held: Mutex<HashSet<LockKey>>,
}

impl EntityLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试原子地获取整组锁键
    ///
    /// 键会先去重并过滤空键；过滤后为空视为无需加锁，直接成功。
    pub fn try_acquire<'a, I>(&self, keys: I) -> bool
    where
        I: IntoIterator<Item = &'a LockKey>,
    {
        let keys = normalize(keys);
        self.acquire_normalized(&keys)
    }

    /// 与 `try_acquire` 相同，但成功时返回在析构时自动释放的守卫
    pub fn try_acquire_guard<'a, I>(self: &Arc<Self>, keys: I) -> Option<LockGuard>
    where
        I: IntoIterator<Item = &'a LockKey>,
    {
        let keys = normalize(keys);
        if !self.acquire_normalized(&keys) {
            return None;
        }

        Some(LockGuard {
            manager: Arc::clone(self),
            keys,
        })
    }

    /// 释放给定锁键；释放未持有的键为空操作
    pub fn release<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a LockKey>,
    {
        let mut held = self.held();
        for key in keys {
            held.remove(key);
        }
    }

    pub fn is_held<Q>(&self, key: &Q) -> bool
    where
        LockKey: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.held().contains(key)
    }

    /// 当前持有锁键的快照（诊断用）
    pub fn held_keys(&self) -> HashSet<LockKey> {
        self.held().clone()
    }

    pub fn held_count(&self) -> usize {
        self.held().len()
    }

    /// 清空全部锁（调度器销毁时使用）
    pub fn clear(&self) {
        self.held().clear();
    }

    fn acquire_normalized(&self, keys: &[LockKey]) -> bool {
        if keys.is_empty() {
            return true;
        }

        let mut held = self.held();
        if keys.iter().any(|k| held.contains(k)) {
            return false;
        }
        held.extend(keys.iter().cloned());
        true
    }

    // 临界区内不会 panic，中毒只可能来自外部线程，直接沿用内部数据
    fn held(&self) -> MutexGuard<'_, HashSet<LockKey>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn normalize<'a, I>(keys: I) -> Vec<LockKey>
where
    I: IntoIterator<Item = &'a LockKey>,
{
    let mut seen = HashSet::new();
    keys.into_iter()
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(*k))
        .cloned()
        .collect()
}

/// 锁守卫：析构时释放获取到的全部锁键
#[must_use = "dropping the guard releases the locks immediately"]
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<EntityLockManager>,
    keys: Vec<LockKey>,
}

impl LockGuard {
    /// 实际持有的锁键（已去重、已过滤空键）
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.keys.is_empty() {
            self.manager.release(&self.keys);
        }
    }
}
