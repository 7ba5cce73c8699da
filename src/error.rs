//! 网关错误类型
//!
//! 定义协议写入器、输出通道和配置加载过程中可能发生的错误

use thiserror::Error;

/// 输出通道错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// 通道已关闭（客户端断开或已调用 close）
    #[error("输出通道已关闭")]
    Closed,

    /// 响应头只能写入一次
    #[error("响应头已发送")]
    HeadersAlreadySent,

    /// 传输层错误
    #[error("传输层错误: {0}")]
    Transport(String),
}

/// 网关错误
#[derive(Error, Debug)]
pub enum GatewayError {
    /// 输出通道错误
    #[error("输出通道错误: {0}")]
    Channel(#[from] ChannelError),

    /// 线格式序列化失败
    #[error("序列化失败: {0}")]
    Encode(#[from] serde_json::Error),

    /// 调用顺序不符合协议状态机
    #[error("非法的调用顺序: {0}")]
    InvalidSequence(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// 创建调用顺序错误
    pub fn invalid_sequence(message: impl Into<String>) -> Self {
        Self::InvalidSequence(message.into())
    }

    /// 是否由客户端断开导致
    pub fn is_disconnect(&self) -> bool {
        matches!(self, GatewayError::Channel(ChannelError::Closed))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
