//! 网关配置
//!
//! YAML 格式，默认路径 `<config_dir>/completion-gateway/config.yaml`。
//! 所有字段都有默认值，配置文件可以只写需要覆盖的部分。

use crate::error::{GatewayError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 网关配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 请求未指定模型时使用的模型名
    pub default_model: String,
    pub logging: LoggingConfig,
    pub streaming: StreamingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_model: "default".to_string(),
            logging: LoggingConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter 指令，如 `info` 或 `completion_gateway=debug`
    pub level: String,
    /// 输出 JSON 行而不是可读文本
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// 流式输出配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// 随 Content-Type 一起发送的额外响应头（保持配置顺序）
    pub extra_headers: IndexMap<String, String>,
    /// 写入器与 HTTP 响应体之间的 mpsc 缓冲帧数
    pub channel_buffer: usize,
    /// OpenAI SSE 是否总是附带 usage 尾块
    pub include_usage: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        let mut extra_headers = IndexMap::new();
        extra_headers.insert("Cache-Control".to_string(), "no-cache".to_string());
        extra_headers.insert("Connection".to_string(), "keep-alive".to_string());
        extra_headers.insert("X-Accel-Buffering".to_string(), "no".to_string());
        Self {
            extra_headers,
            channel_buffer: 64,
            include_usage: false,
        }
    }
}

impl StreamingConfig {
    /// 额外响应头列表
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.extra_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl GatewayConfig {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("completion-gateway")
            .join("config.yaml")
    }

    /// 从文件加载配置
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            GatewayError::Config(format!("解析配置文件失败 {}: {}", path.display(), e))
        })?;
        config.validate()?;
        tracing::info!("[CONFIG] 已加载配置: {}", path.display());
        Ok(config)
    }

    /// 文件不存在时使用默认配置
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("[CONFIG] 配置文件不存在，使用默认配置: {}", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// 保存配置（自动创建父目录）
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)
            .map_err(|e| GatewayError::Config(format!("序列化配置失败: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.streaming.channel_buffer == 0 {
            return Err(GatewayError::Config(
                "streaming.channel_buffer 必须大于 0".to_string(),
            ));
        }
        if let Some(name) = self
            .streaming
            .extra_headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case("content-type"))
        {
            return Err(GatewayError::Config(format!(
                "streaming.extra_headers 不能覆盖 {}",
                name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_headers_order() {
        let config = StreamingConfig::default();
        let names: Vec<_> = config.header_pairs().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Cache-Control", "Connection", "X-Accel-Buffering"]);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: GatewayConfig = serde_yaml::from_str(
            "default_model: qwen2\nlogging:\n  json: true\n",
        )
        .unwrap();
        assert_eq!(config.default_model, "qwen2");
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.streaming, StreamingConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = GatewayConfig::default();
        config.streaming.include_usage = true;
        config
            .streaming
            .extra_headers
            .insert("X-Gateway".to_string(), "1".to_string());
        config.save(&path).unwrap();

        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.streaming.header_pairs().last().map(|(k, _)| k.as_str()),
            Some("X-Gateway")
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = GatewayConfig::load_or_default(&dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        std::fs::write(&path, "streaming:\n  channel_buffer: 0\n").unwrap();
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(GatewayError::Config(_))
        ));

        std::fs::write(
            &path,
            "streaming:\n  extra_headers:\n    content-type: text/plain\n",
        )
        .unwrap();
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(GatewayError::Config(_))
        ));

        std::fs::write(&path, "logging: [1, 2").unwrap();
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_default_path_location() {
        let path = GatewayConfig::default_path();
        assert!(path.ends_with("completion-gateway/config.yaml"));
    }
}
