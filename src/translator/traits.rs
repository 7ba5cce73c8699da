//! 协议转换器 Trait 定义
//!
//! - `RequestTranslator`: 将前端协议请求转换为规范请求
//! - `TranslateError`: 转换失败时携带错误类别与原始数据

/// 请求转换器 Trait
///
/// 转换是纯函数：无状态、无副作用，同一输入总是得到同一输出。
///
/// # 类型参数
///
/// - `Input`: 前端请求类型（如 `AnthropicMessagesRequest`）
/// - `Output`: 规范请求类型（`ChatCompletionRequest`）
/// - `Error`: 转换错误类型
pub trait RequestTranslator {
    /// 前端请求类型
    type Input;
    /// 规范请求类型
    type Output;
    /// 转换错误类型
    type Error: std::error::Error + Send + Sync + 'static;

    /// 转换请求
    fn translate_request(&self, request: Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 转换错误类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateError {
    /// 错误类型
    pub kind: TranslateErrorKind,
    /// 错误消息
    pub message: String,
    /// 原始数据（用于调试）
    pub source_data: Option<String>,
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TranslateError {}

/// 转换错误类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateErrorKind {
    /// 无效的请求结构（空消息列表、未知角色等）
    InvalidRequest,
    /// 缺少必要字段
    MissingField,
    /// 无法转换的内容（如 assistant 消息中的 tool_result）
    UnsupportedContent,
    /// JSON 解码失败
    Decode,
}

impl std::fmt::Display for TranslateErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "InvalidRequest"),
            Self::MissingField => write!(f, "MissingField"),
            Self::UnsupportedContent => write!(f, "UnsupportedContent"),
            Self::Decode => write!(f, "Decode"),
        }
    }
}

impl TranslateError {
    /// 创建新的转换错误
    pub fn new(kind: TranslateErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source_data: None,
        }
    }

    /// 带原始数据创建错误
    pub fn with_source(
        kind: TranslateErrorKind,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source_data: Some(source.into()),
        }
    }

    /// 创建无效请求错误
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(TranslateErrorKind::InvalidRequest, message)
    }

    /// 创建不支持内容错误
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(TranslateErrorKind::UnsupportedContent, message)
    }

    /// 创建缺少字段错误
    pub fn missing_field(field: &str) -> Self {
        Self::new(
            TranslateErrorKind::MissingField,
            format!("Missing required field: {}", field),
        )
    }

    /// 创建解码错误；原始报文截断保存
    pub fn decode(error: &serde_json::Error, body: &[u8]) -> Self {
        const MAX_SOURCE: usize = 512;
        let source = String::from_utf8_lossy(&body[..body.len().min(MAX_SOURCE)]).into_owned();
        Self::with_source(TranslateErrorKind::Decode, error.to_string(), source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_error_display() {
        let err = TranslateError::new(TranslateErrorKind::InvalidRequest, "test error");
        assert_eq!(format!("{}", err), "InvalidRequest: test error");
    }

    #[test]
    fn test_missing_field_message() {
        let err = TranslateError::missing_field("model");
        assert_eq!(err.kind, TranslateErrorKind::MissingField);
        assert_eq!(err.message, "Missing required field: model");
        assert!(err.source_data.is_none());
    }

    #[test]
    fn test_decode_error_keeps_truncated_source() {
        let body = vec![b'x'; 2048];
        let json_err = serde_json::from_slice::<serde_json::Value>(&body).unwrap_err();
        let err = TranslateError::decode(&json_err, &body);
        assert_eq!(err.kind, TranslateErrorKind::Decode);
        assert_eq!(err.source_data.map(|s| s.len()), Some(512));
    }
}
