//! 协议转换层
//!
//! 将不同前端协议的入站请求解码并转换为规范请求（`ChatCompletionRequest`）。
//!
//! # 架构设计
//!
//! ```text
//! translator/
//! ├── traits.rs       # 转换器 trait 与错误类型
//! └── anthropic.rs    # Anthropic Messages → 规范请求
//! ```
//!
//! # 使用示例
//!
//! ```ignore
//! use completion_gateway::translator::{decode_request, InboundFormat};
//!
//! let format = InboundFormat::from_path("/v1/messages");
//! let request = decode_request(format, &body)?;
//! ```

pub mod anthropic;
pub mod traits;

// 重新导出核心类型
pub use anthropic::{convert_anthropic_to_canonical, AnthropicRequestTranslator};
pub use traits::{RequestTranslator, TranslateError, TranslateErrorKind};

use crate::models::anthropic::AnthropicMessagesRequest;
use crate::models::openai::ChatCompletionRequest;

/// 入站请求格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFormat {
    /// Anthropic Messages 请求体
    Anthropic,
    /// 规范请求体（OpenAI 兼容）
    Canonical,
}

impl InboundFormat {
    /// 根据请求路径判断入站格式
    pub fn from_path(path: &str) -> Self {
        if path.trim_end_matches('/').ends_with("/v1/messages") {
            Self::Anthropic
        } else {
            Self::Canonical
        }
    }
}

/// 解码入站请求体并转换为规范请求
pub fn decode_request(
    format: InboundFormat,
    body: &[u8],
) -> Result<ChatCompletionRequest, TranslateError> {
    match format {
        InboundFormat::Anthropic => {
            let request: AnthropicMessagesRequest = serde_json::from_slice(body).map_err(|e| {
                tracing::warn!("[TRANSLATE] Anthropic 请求解码失败: {}", e);
                TranslateError::decode(&e, body)
            })?;
            AnthropicRequestTranslator::new().translate_request(request)
        }
        InboundFormat::Canonical => {
            let request: ChatCompletionRequest = serde_json::from_slice(body).map_err(|e| {
                tracing::warn!("[TRANSLATE] 规范请求解码失败: {}", e);
                TranslateError::decode(&e, body)
            })?;
            if request.model.trim().is_empty() {
                return Err(TranslateError::missing_field("model"));
            }
            if request.messages.is_empty() {
                return Err(TranslateError::invalid_request("messages must not be empty"));
            }
            Ok(request)
        }
    }
}
