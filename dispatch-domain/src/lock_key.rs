//! 资源锁键（LockKey）
//!
//! 标识一个需要在命令执行期间被独占的资源（卡牌、工位、食材……）。
//! 锁键对调度器而言是不透明的，仅按字符串内容比较相等。
//!
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// 不透明的资源标识，克隆开销为一次引用计数
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(Arc<str>);

impl LockKey {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    /// 带作用域前缀的锁键：`scoped("card", 7)` => `card:7`
    ///
    /// 不同类别的实体可能共享同一个原始 ID，作用域用于避免误冲突。
    pub fn scoped(scope: &str, id: impl fmt::Display) -> Self {
        Self(format!("{scope}:{id}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 空键等价于“未指定”，加锁前会被过滤
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockKey({:?})", &*self.0)
    }
}

impl AsRef<str> for LockKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for LockKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LockKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LockKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&String> for LockKey {
    fn from(value: &String) -> Self {
        Self::new(value.as_str())
    }
}
