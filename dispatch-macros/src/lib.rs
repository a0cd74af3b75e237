use proc_macro::TokenStream;

mod command;

/// 命令宏
/// - 为结构体实现 `::dispatch_domain::command::Command`
/// - 支持参数：
///   - `name = "..."`：命令稳定名称，默认取结构体名
///   - `sequential`：不允许并发执行，调度循环会等待其结束
///   - `timeout_ms = N`：执行时限（毫秒）
///   - `on_cancelled = Self::method`：取消回调，签名为 `fn(&Self)`
/// - 字段标记 `#[lock_key]` 表示执行期间需要独占该字段所指向的资源：
///   - 字段值通过 `Display` 转为锁键；`Option<T>` 字段仅在 `Some` 时参与
///   - `#[lock_key(each)]`：字段为集合，逐个元素生成锁键
///   - `#[lock_key(scope = "card")]`：生成带作用域的锁键 `card:<value>`
///
/// ```ignore
/// #[command(name = "kitchen.cook", timeout_ms = 500)]
/// struct Cook {
///     #[lock_key(scope = "station")]
///     station: u32,
///     #[lock_key(scope = "ingredient")]
///     ingredient: String,
/// }
/// ```
#[proc_macro_attribute]
pub fn command(attr: TokenStream, item: TokenStream) -> TokenStream {
    command::expand(attr, item)
}
