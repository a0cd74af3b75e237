use bon::Builder;
use std::time::Duration;

/// 调度器配置
#[derive(Builder, Clone, Copy, Debug)]
pub struct DispatcherConfig {
    /// 命令未声明 `timeout` 时采用的执行时限；`None` 表示不限时
    pub default_timeout: Option<Duration>,
    /// 生命周期事件流的广播缓冲区容量
    #[builder(default = 256)]
    pub event_stream_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            event_stream_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let cfg = DispatcherConfig::builder()
            .default_timeout(Duration::from_secs(5))
            .build();

        assert_eq!(cfg.default_timeout, Some(Duration::from_secs(5)));
        assert_eq!(cfg.event_stream_capacity, 256);
    }

    #[test]
    fn default_has_no_deadline() {
        let cfg = DispatcherConfig::default();
        assert!(cfg.default_timeout.is_none());
    }
}
