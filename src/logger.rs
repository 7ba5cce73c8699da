//! 日志初始化
//!
//! 基于 `tracing-subscriber`：EnvFilter + 可读文本或 JSON 行输出。
//! `RUST_LOG` 优先于配置中的 `logging.level`。重复初始化不会报错。

use crate::config::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// 解析过滤指令；无效时回退到 `info`
fn resolve_env_filter(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("[LOGGER] 无效的日志级别 '{}': {}，使用 info", level, e);
        EnvFilter::new("info")
    })
}

/// 安装全局 tracing subscriber
///
/// 返回是否由本次调用完成安装（已有全局 subscriber 时返回 false）。
pub fn init(config: &LoggingConfig) -> bool {
    let filter = resolve_env_filter(&config.level);
    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init()
    };

    match result {
        Ok(()) => {
            tracing::debug!("[LOGGER] 日志已初始化: level={}, json={}", config.level, config.json);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(&LoggingConfig::default());
        // 已有全局 subscriber，第二次调用返回 false 且不 panic
        assert!(!init(&LoggingConfig {
            level: "debug".to_string(),
            json: true,
        }));
    }

    #[test]
    fn test_level_from_config() {
        // 仅在未设置 RUST_LOG 时才会走到配置级别
        if std::env::var("RUST_LOG").is_err() {
            let filter = resolve_env_filter("debug");
            assert_eq!(filter.to_string(), "debug");
        }
    }
}
