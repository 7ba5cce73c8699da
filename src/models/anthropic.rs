//! Anthropic Messages API 数据模型
//!
//! - 入站请求 `AnthropicMessagesRequest`（联合类型字段：字符串或内容块数组）
//! - 流式事件 `AnthropicStreamEvent`（`event: <type>\ndata: <json>`）

use super::json_value::AnyValue;
use serde::de::{DeserializeOwned, Error as DeError};
use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// 入站请求
// ============================================================================

/// Anthropic Messages 请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicMessagesRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<AnthropicToolChoice>,
}

/// 字符串或内容块数组
///
/// 解码顺序固定：先尝试字符串，再尝试内容块数组，两者都不匹配时报错，
/// 不做任何默认回退。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TextOrBlocks<T> {
    Text(String),
    Blocks(Vec<T>),
}

impl<'de, T> Deserialize<'de> for TextOrBlocks<T>
where
    T: DeserializeOwned,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // 以 AnyValue 缓冲，tool input 等对象保持原始键顺序
        let value = AnyValue::deserialize(deserializer)?;
        match value {
            AnyValue::String(s) => Ok(TextOrBlocks::Text(s)),
            AnyValue::Array(_) => serde_json::to_string(&value)
                .and_then(|json| serde_json::from_str::<Vec<T>>(&json))
                .map(TextOrBlocks::Blocks)
                .map_err(|e| D::Error::custom(format!("string variant rejected; block list variant failed: {e}"))),
            other => Err(D::Error::custom(format!(
                "expected a string or a list of content blocks, found {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &AnyValue) -> &'static str {
    match value {
        AnyValue::Null => "null",
        AnyValue::Bool(_) => "boolean",
        AnyValue::Int(_) | AnyValue::Double(_) => "number",
        AnyValue::String(_) => "string",
        AnyValue::Array(_) => "array",
        AnyValue::Object(_) => "object",
    }
}

/// system 字段
pub type SystemPrompt = TextOrBlocks<SystemBlock>;

/// 消息内容
pub type AnthropicContent = TextOrBlocks<ContentBlock>;

/// tool_result 内容
pub type ToolResultContent = TextOrBlocks<ContentBlock>;

impl SystemPrompt {
    /// 折叠为纯文本，文本块之间以换行连接
    pub fn to_text(&self) -> String {
        match self {
            TextOrBlocks::Text(s) => s.clone(),
            TextOrBlocks::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// system 内容块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

/// 内容块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: AnyValue,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// 图片来源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

impl ImageSource {
    /// 转换为 URL（base64 转为 data URL）
    pub fn to_url(&self) -> String {
        match self {
            ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
            ImageSource::Url { url } => url.clone(),
        }
    }
}

/// 工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: AnyValue,
}

/// 工具选择
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicToolChoice {
    Auto,
    Any,
    None,
    Tool { name: String },
}

// ============================================================================
// 流式事件
// ============================================================================

/// Anthropic SSE 事件
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent<'a> {
    MessageStart {
        message: MessageStartBody<'a>,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockStart<'a>,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta<'a>,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody<'a>,
        usage: OutputUsage,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicErrorBody<'a>,
    },
}

impl AnthropicStreamEvent<'_> {
    /// SSE `event:` 名称
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
            Self::Ping => "ping",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageStartBody<'a> {
    pub id: &'a str,
    #[serde(rename = "type")]
    pub object_type: &'a str,
    pub role: &'a str,
    pub model: &'a str,
    pub content: Vec<serde_json::Value>,
    pub stop_reason: Option<&'a str>,
    pub stop_sequence: Option<&'a str>,
    pub usage: StartUsage,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StartUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockStart<'a> {
    Text {
        text: &'a str,
    },
    ToolUse {
        id: &'a str,
        name: &'a str,
        input: serde_json::Map<String, serde_json::Value>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta<'a> {
    TextDelta { text: &'a str },
    InputJsonDelta { partial_json: &'a str },
}

#[derive(Debug, Serialize)]
pub struct MessageDeltaBody<'a> {
    pub stop_reason: &'a str,
    pub stop_sequence: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OutputUsage {
    pub output_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct AnthropicErrorBody<'a> {
    #[serde(rename = "type")]
    pub error_type: &'a str,
    pub message: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_string_before_blocks() {
        let msg: AnthropicMessage =
            serde_json::from_str(r#"{"role":"user","content":"hello"}"#).unwrap();
        assert_eq!(msg.content, TextOrBlocks::Text("hello".to_string()));

        let msg: AnthropicMessage = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"hi"},{"type":"tool_result","tool_use_id":"abc","content":"42"}]}"#,
        )
        .unwrap();
        let TextOrBlocks::Blocks(blocks) = msg.content else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert!(matches!(
            &blocks[1],
            ContentBlock::ToolResult { tool_use_id, content: Some(TextOrBlocks::Text(c)), .. }
                if tool_use_id == "abc" && c == "42"
        ));
    }

    #[test]
    fn test_content_union_rejects_other_shapes() {
        let err = serde_json::from_str::<AnthropicMessage>(r#"{"role":"user","content":7}"#)
            .unwrap_err();
        assert!(err.to_string().contains("expected a string or a list of content blocks"));

        let err = serde_json::from_str::<AnthropicMessage>(
            r#"{"role":"user","content":[{"type":"video"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("block list variant failed"));
    }

    #[test]
    fn test_system_blocks_to_text() {
        let system: SystemPrompt = serde_json::from_str(
            r#"[{"type":"text","text":"Line 1"},{"type":"text","text":"Line 2"}]"#,
        )
        .unwrap();
        assert_eq!(system.to_text(), "Line 1\nLine 2");
    }

    #[test]
    fn test_tool_choice_variants() {
        let any: AnthropicToolChoice = serde_json::from_str(r#"{"type":"any"}"#).unwrap();
        assert_eq!(any, AnthropicToolChoice::Any);
        let tool: AnthropicToolChoice =
            serde_json::from_str(r#"{"type":"tool","name":"search"}"#).unwrap();
        assert_eq!(
            tool,
            AnthropicToolChoice::Tool {
                name: "search".to_string()
            }
        );
    }

    #[test]
    fn test_stream_event_shapes() {
        let event = AnthropicStreamEvent::ContentBlockStart {
            index: 1,
            content_block: ContentBlockStart::ToolUse {
                id: "t1",
                name: "search",
                input: serde_json::Map::new(),
            },
        };
        assert_eq!(event.event_name(), "content_block_start");
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"search","input":{}}}"#
        );

        let stop = AnthropicStreamEvent::MessageStop;
        assert_eq!(serde_json::to_string(&stop).unwrap(), r#"{"type":"message_stop"}"#);
    }
}
