//! Anthropic 请求转换为规范请求
//!
//! 将 Anthropic Messages 请求转换为推理引擎消费的 `ChatCompletionRequest`。
//!
//! # 转换规则
//!
//! - `system`（字符串或文本块）→ 首条 `system` 消息，文本块以换行连接
//! - 含 `tool_result` 的 user 消息拆分为每个结果一条 `tool` 消息，
//!   剩余文本/图片另起一条 user 消息
//! - assistant 的 `tool_use` → `tool_calls`（参数为 input 的 JSON 字符串）
//! - `tool_choice`: auto→auto, none→none, any→auto（规范请求没有“必须调用任一工具”模式）

use crate::models::anthropic::{
    AnthropicMessage, AnthropicMessagesRequest, AnthropicTool, AnthropicToolChoice, ContentBlock,
    TextOrBlocks, ToolResultContent,
};
use crate::models::openai::{
    ChatCompletionRequest, ChatMessage, ContentPart, FunctionCall, FunctionDefinition, ImageUrl,
    MessageContent, Tool, ToolCall, ToolChoice, ToolChoiceMode,
};
use crate::translator::traits::{RequestTranslator, TranslateError};

/// Anthropic 到规范请求转换器
#[derive(Debug, Clone, Default)]
pub struct AnthropicRequestTranslator;

impl AnthropicRequestTranslator {
    /// 创建新的转换器
    pub fn new() -> Self {
        Self
    }
}

impl RequestTranslator for AnthropicRequestTranslator {
    type Input = AnthropicMessagesRequest;
    type Output = ChatCompletionRequest;
    type Error = TranslateError;

    fn translate_request(&self, request: Self::Input) -> Result<Self::Output, Self::Error> {
        convert_anthropic_to_canonical(&request)
    }
}

// ============================================================================
// 转换函数
// ============================================================================

/// 将 Anthropic MessagesRequest 转换为规范请求
pub fn convert_anthropic_to_canonical(
    request: &AnthropicMessagesRequest,
) -> Result<ChatCompletionRequest, TranslateError> {
    if request.model.trim().is_empty() {
        return Err(TranslateError::missing_field("model"));
    }
    if request.messages.is_empty() {
        return Err(TranslateError::invalid_request("messages must not be empty"));
    }

    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        let text = system.to_text();
        if !text.is_empty() {
            messages.push(ChatMessage::text("system", text));
        }
    }

    for (index, message) in request.messages.iter().enumerate() {
        match message.role.as_str() {
            "user" => convert_user_message(message, &mut messages)?,
            "assistant" => messages.push(convert_assistant_message(message)?),
            other => {
                return Err(TranslateError::invalid_request(format!(
                    "messages[{index}]: unknown role '{other}'"
                )));
            }
        }
    }

    let tools = request
        .tools
        .as_ref()
        .map(|tools| tools.iter().map(convert_tool).collect::<Vec<_>>())
        .filter(|tools| !tools.is_empty());

    tracing::debug!(
        "[ANTHROPIC_TRANSLATE] model={}, messages={} -> {}, tools={}",
        request.model,
        request.messages.len(),
        messages.len(),
        tools.as_ref().map(Vec::len).unwrap_or(0)
    );

    Ok(ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_tokens: request.max_tokens,
        stop: request.stop_sequences.clone(),
        stream: request.stream,
        stream_options: None,
        tools,
        tool_choice: request.tool_choice.as_ref().map(convert_tool_choice),
    })
}

/// user 消息：tool_result 拆分为独立的 tool 消息
/// `is_error: true` 的工具结果前缀
pub const TOOL_ERROR_PREFIX: &str = "Error: ";

fn convert_user_message(
    message: &AnthropicMessage,
    out: &mut Vec<ChatMessage>,
) -> Result<(), TranslateError> {
    let blocks = match &message.content {
        TextOrBlocks::Text(text) => {
            out.push(ChatMessage::text("user", text.clone()));
            return Ok(());
        }
        TextOrBlocks::Blocks(blocks) => blocks,
    };

    let mut parts: Vec<ContentPart> = Vec::new();
    let mut has_image = false;
    let mut has_tool_result = false;

    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                has_tool_result = true;
                let mut text = tool_result_text(content.as_ref());
                // tool 消息没有错误标记，用前缀区分失败的调用
                if is_error.unwrap_or(false) {
                    tracing::debug!("[TRANSLATE] 工具调用 {} 返回错误", tool_use_id);
                    text = format!("{TOOL_ERROR_PREFIX}{text}");
                }
                out.push(ChatMessage::tool_result(tool_use_id.clone(), text));
            }
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => {
                has_image = true;
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: source.to_url(),
                        detail: None,
                    },
                });
            }
            ContentBlock::ToolUse { id, .. } => {
                return Err(TranslateError::unsupported(format!(
                    "tool_use block '{id}' is not allowed in a user message"
                )));
            }
        }
    }

    // tool 消息必须紧跟在 assistant 的 tool_calls 之后，其余文本放在它们后面
    // 只有工具结果时不再追加空的 user 消息
    if has_tool_result && parts.is_empty() {
        return Ok(());
    }

    let content = if has_image {
        MessageContent::Parts(parts)
    } else {
        MessageContent::Text(MessageContent::Parts(parts).as_text())
    };
    out.push(ChatMessage {
        role: "user".to_string(),
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
    });
    Ok(())
}

/// assistant 消息：文本作为内容，tool_use 转为 tool_calls
fn convert_assistant_message(message: &AnthropicMessage) -> Result<ChatMessage, TranslateError> {
    let blocks = match &message.content {
        TextOrBlocks::Text(text) => return Ok(ChatMessage::text("assistant", text.clone())),
        TextOrBlocks::Blocks(blocks) => blocks,
    };

    let mut texts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: if input.is_null() {
                        "{}".to_string()
                    } else {
                        input.to_json_string()
                    },
                },
            }),
            ContentBlock::Image { .. } => {
                tracing::warn!("[ANTHROPIC_TRANSLATE] assistant 消息中的图片被忽略");
            }
            ContentBlock::ToolResult { tool_use_id, .. } => {
                return Err(TranslateError::unsupported(format!(
                    "tool_result block '{tool_use_id}' is not allowed in an assistant message"
                )));
            }
        }
    }

    let text = texts.join("\n");
    let content = if text.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(MessageContent::Text(text))
    };

    Ok(ChatMessage {
        role: "assistant".to_string(),
        content,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    })
}

/// tool_result 内容折叠为纯文本
fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(TextOrBlocks::Text(text)) => text.clone(),
        Some(TextOrBlocks::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn convert_tool(tool: &AnthropicTool) -> Tool {
    Tool {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

fn convert_tool_choice(choice: &AnthropicToolChoice) -> ToolChoice {
    match choice {
        AnthropicToolChoice::Auto | AnthropicToolChoice::Any => {
            ToolChoice::Mode(ToolChoiceMode::Auto)
        }
        AnthropicToolChoice::None => ToolChoice::Mode(ToolChoiceMode::None),
        AnthropicToolChoice::Tool { name } => ToolChoice::function(name.clone()),
    }
}
