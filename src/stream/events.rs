//! 统一流事件类型
//!
//! 推理引擎输出的中间表示，解耦引擎与各前端协议写入器。
//!
//! # 顺序约定
//!
//! - 最多一个 `RoleAnnounced`，且必须最先出现
//! - 之后是 `TextDelta` 与工具调用事件的任意交错
//! - 最后恰好一个终止事件（`Finished` 或 `Error`）

use serde::{Deserialize, Serialize};

/// 统一流事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// 角色声明
    RoleAnnounced { role: String },

    /// 文本增量
    TextDelta { text: String },

    /// 工具调用开始
    ToolCallStarted {
        /// 工具调用 ID
        call_id: String,
        /// 工具名称
        name: String,
        /// 工具调用在本次响应中的序号
        index: usize,
    },

    /// 工具调用参数增量（部分 JSON）
    ToolArgumentsDelta {
        call_id: String,
        index: usize,
        partial_json: String,
    },

    /// 正常结束
    Finished { reason: FinishReason },

    /// 上游错误
    Error { message: String },

    /// 心跳，保持连接活跃
    Ping,
}

impl StreamEvent {
    /// 是否为终止事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finished { .. } | StreamEvent::Error { .. })
    }

    pub fn text(text: impl Into<String>) -> Self {
        StreamEvent::TextDelta { text: text.into() }
    }

    pub fn finished(reason: FinishReason) -> Self {
        StreamEvent::Finished { reason }
    }

    pub fn tool_call_started(call_id: impl Into<String>, name: impl Into<String>, index: usize) -> Self {
        StreamEvent::ToolCallStarted {
            call_id: call_id.into(),
            name: name.into(),
            index,
        }
    }

    pub fn tool_arguments(
        call_id: impl Into<String>,
        index: usize,
        partial_json: impl Into<String>,
    ) -> Self {
        StreamEvent::ToolArgumentsDelta {
            call_id: call_id.into(),
            index,
            partial_json: partial_json.into(),
        }
    }
}

/// 结束原因
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FinishReason {
    /// 正常结束
    #[default]
    Stop,
    /// 达到最大 token 数
    Length,
    /// 需要工具调用
    ToolCalls,
    /// 内容过滤
    ContentFilter,
    /// 其他原因
    Other(String),
}

impl FinishReason {
    /// 从字符串解析（同时接受 OpenAI 与 Anthropic 的写法）
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "tool_calls" | "tool_use" => Self::ToolCalls,
            "content_filter" | "refusal" => Self::ContentFilter,
            _ => Self::Other(s.to_string()),
        }
    }

    /// OpenAI `finish_reason`
    pub fn to_openai_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Other(s) => s,
        }
    }

    /// Anthropic `stop_reason`
    pub fn to_anthropic_str(&self) -> &str {
        match self {
            Self::Stop => "end_turn",
            Self::Length => "max_tokens",
            Self::ToolCalls => "tool_use",
            Self::ContentFilter => "refusal",
            Self::Other(s) => s,
        }
    }

    /// Ollama `done_reason`
    pub fn to_ollama_str(&self) -> &str {
        match self {
            Self::Length => "length",
            Self::Other(s) => s,
            _ => "stop",
        }
    }
}

/// 估算 token 数量（约 4 字符 = 1 token，至少为 1）
///
/// 仅用于 usage 字段的参考值，不是精确的分词结果。
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    std::cmp::max(1, chars / 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_parse() {
        assert_eq!(FinishReason::parse("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::parse("length"), FinishReason::Length);
        assert_eq!(FinishReason::parse("tool_use"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::parse("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(
            FinishReason::parse("pause_turn"),
            FinishReason::Other("pause_turn".to_string())
        );
    }

    #[test]
    fn test_finish_reason_render() {
        assert_eq!(FinishReason::Stop.to_openai_str(), "stop");
        assert_eq!(FinishReason::ToolCalls.to_openai_str(), "tool_calls");
        assert_eq!(FinishReason::Stop.to_anthropic_str(), "end_turn");
        assert_eq!(FinishReason::Length.to_anthropic_str(), "max_tokens");
        assert_eq!(FinishReason::ToolCalls.to_anthropic_str(), "tool_use");
        assert_eq!(FinishReason::ToolCalls.to_ollama_str(), "stop");
        assert_eq!(FinishReason::Length.to_ollama_str(), "length");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        // 按字符而非字节计数
        assert_eq!(estimate_tokens("你好世界你好世界"), 2);
    }

    #[test]
    fn test_terminal_events() {
        assert!(StreamEvent::finished(FinishReason::Stop).is_terminal());
        assert!(StreamEvent::Error {
            message: "boom".to_string()
        }
        .is_terminal());
        assert!(!StreamEvent::text("x").is_terminal());
        assert!(!StreamEvent::Ping.is_terminal());
    }
}
