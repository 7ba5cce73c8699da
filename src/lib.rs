//! 流式补全网关
//!
//! 将推理引擎输出的统一事件流（`StreamEvent`）编码为多种客户端协议：
//!
//! - OpenAI Chat Completions SSE
//! - Ollama 风格 NDJSON
//! - Anthropic Messages SSE
//! - Open Responses SSE
//!
//! 同时提供 Anthropic Messages 请求到规范请求的转换。

pub mod config;
pub mod error;
pub mod logger;
pub mod models;
pub mod server_utils;
pub mod stream;
pub mod translator;

pub use config::{GatewayConfig, LoggingConfig, StreamingConfig};
pub use error::{ChannelError, GatewayError, Result};
pub use models::AnyValue;
pub use stream::{
    FinishReason, MemoryChannel, MpscChannel, OutputChannel, OutputFormat, ProtocolWriter,
    ResponseMeta, StreamEvent, StreamPipeline,
};
pub use translator::{decode_request, InboundFormat, TranslateError, TranslateErrorKind};
