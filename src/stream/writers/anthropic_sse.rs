//! Anthropic SSE 写入器
//!
//! 将流事件编码为 Anthropic Messages API SSE 格式。
//!
//! # 格式说明
//!
//! ```text
//! event: message_start
//! data: {"type":"message_start","message":{...}}
//!
//! event: content_block_start
//! data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}
//!
//! event: content_block_delta
//! data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}
//!
//! event: content_block_stop
//! data: {"type":"content_block_stop","index":0}
//!
//! event: message_delta
//! data: {"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":1}}
//!
//! event: message_stop
//! data: {"type":"message_stop"}
//! ```
//!
//! 没有 `[DONE]`，`message_stop` 之后关闭连接即结束。
//!
//! # 内容块规则
//!
//! 每个内容块都必须显式关闭后才能打开下一个。唯一的隐式关闭是
//! 文本块 → tool_use 块；其余非法转换返回 `InvalidSequence`。
//!
//! 统一事件适配中，另一个 tool_use 块仍打开时到达的工具调用会连同参数
//! 增量一起暂存，在 `finish` 时依次写成完整的 tool_use 块。

use super::{
    fallback_error_json, sse_event_frame, DeferredToolCalls, FrameSink, ProtocolWriter,
    CONTENT_TYPE_EVENT_STREAM,
};
use crate::error::{GatewayError, Result};
use crate::models::anthropic::{
    AnthropicErrorBody, AnthropicStreamEvent, BlockDelta, ContentBlockStart, MessageDeltaBody,
    MessageStartBody, OutputUsage, StartUsage,
};
use crate::stream::channel::OutputChannel;
use crate::stream::events::{estimate_tokens, FinishReason};
use async_trait::async_trait;

/// 当前打开的内容块
#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenBlock {
    Text,
    ToolUse { id: String },
}

/// Anthropic SSE 写入器
#[derive(Debug)]
pub struct AnthropicSseWriter<C> {
    sink: FrameSink<C>,
    /// 消息 ID
    message_id: String,
    /// 模型名称
    model: String,
    /// 输入 token 数量
    input_tokens: u32,
    /// 估算的输出 token 数量
    output_tokens: u32,
    /// 当前内容块索引
    current_block_index: u32,
    open_block: Option<OpenBlock>,
    /// 是否已发送 message_start
    message_started: bool,
    deferred_tools: DeferredToolCalls,
}

impl<C: OutputChannel> AnthropicSseWriter<C> {
    pub fn new(channel: C, model: impl Into<String>) -> Self {
        Self::with_id(
            channel,
            format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model,
            0,
        )
    }

    /// 使用指定的消息 ID 与输入 token 数创建写入器
    pub fn with_id(
        channel: C,
        message_id: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u32,
    ) -> Self {
        Self {
            sink: FrameSink::new(channel, CONTENT_TYPE_EVENT_STREAM, Vec::new()),
            message_id: message_id.into(),
            model: model.into(),
            input_tokens,
            output_tokens: 0,
            current_block_index: 0,
            open_block: None,
            message_started: false,
            deferred_tools: DeferredToolCalls::default(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.sink.set_extra_headers(headers);
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn output_tokens(&self) -> u32 {
        self.output_tokens
    }

    pub fn current_block_index(&self) -> u32 {
        self.current_block_index
    }

    pub fn has_open_text_block(&self) -> bool {
        self.open_block == Some(OpenBlock::Text)
    }

    pub fn channel(&self) -> &C {
        self.sink.channel()
    }

    fn encode(event: &AnthropicStreamEvent<'_>) -> serde_json::Result<String> {
        serde_json::to_string(event).map(|json| sse_event_frame(event.event_name(), &json))
    }

    /// 发送已编码的事件；编码失败时记录日志并立即关闭连接
    async fn send_event(&mut self, encoded: serde_json::Result<String>) -> Result<()> {
        match encoded {
            Ok(frame) => self.sink.send(frame).await,
            Err(e) => {
                tracing::error!("[ANTHROPIC_SSE] 事件序列化失败，关闭连接: {}", e);
                self.sink.abort().await;
                Err(e.into())
            }
        }
    }

    /// 重置全部计数器并发送 `message_start`
    pub async fn message_start(
        &mut self,
        id: &str,
        model: &str,
        input_tokens: u32,
    ) -> Result<()> {
        self.message_id = id.to_string();
        self.model = model.to_string();
        self.input_tokens = input_tokens;
        self.output_tokens = 0;
        self.current_block_index = 0;
        self.open_block = None;
        self.message_started = true;
        self.deferred_tools = DeferredToolCalls::default();

        let encoded = Self::encode(&AnthropicStreamEvent::MessageStart {
            message: MessageStartBody {
                id: &self.message_id,
                object_type: "message",
                role: "assistant",
                model: &self.model,
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: StartUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                },
            },
        });
        self.send_event(encoded).await
    }

    /// 文本增量；必要时先打开文本块
    pub async fn append_text(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        match self.open_block {
            Some(OpenBlock::ToolUse { .. }) => {
                return Err(GatewayError::invalid_sequence(
                    "tool_use 块未关闭时不能追加文本",
                ));
            }
            Some(OpenBlock::Text) => {}
            None => {
                let encoded = Self::encode(&AnthropicStreamEvent::ContentBlockStart {
                    index: self.current_block_index,
                    content_block: ContentBlockStart::Text { text: "" },
                });
                self.send_event(encoded).await?;
                self.open_block = Some(OpenBlock::Text);
            }
        }

        self.output_tokens += estimate_tokens(text);
        let encoded = Self::encode(&AnthropicStreamEvent::ContentBlockDelta {
            index: self.current_block_index,
            delta: BlockDelta::TextDelta { text },
        });
        self.send_event(encoded).await
    }

    /// 关闭当前内容块并推进索引
    pub async fn block_stop(&mut self) -> Result<()> {
        if self.open_block.is_none() {
            return Err(GatewayError::invalid_sequence("没有打开的内容块"));
        }
        let encoded = Self::encode(&AnthropicStreamEvent::ContentBlockStop {
            index: self.current_block_index,
        });
        self.send_event(encoded).await?;
        self.current_block_index += 1;
        self.open_block = None;
        Ok(())
    }

    /// 打开 tool_use 块；打开中的文本块会先被关闭
    pub async fn start_tool_use_block(&mut self, tool_id: &str, tool_name: &str) -> Result<()> {
        match self.open_block {
            Some(OpenBlock::Text) => self.block_stop().await?,
            Some(OpenBlock::ToolUse { .. }) => {
                return Err(GatewayError::invalid_sequence(
                    "上一个 tool_use 块未关闭时不能打开新的 tool_use 块",
                ));
            }
            None => {}
        }

        let encoded = Self::encode(&AnthropicStreamEvent::ContentBlockStart {
            index: self.current_block_index,
            content_block: ContentBlockStart::ToolUse {
                id: tool_id,
                name: tool_name,
                input: serde_json::Map::new(),
            },
        });
        self.send_event(encoded).await?;
        self.open_block = Some(OpenBlock::ToolUse {
            id: tool_id.to_string(),
        });
        Ok(())
    }

    /// 工具输入增量
    pub async fn append_tool_input_delta(&mut self, partial_json: &str) -> Result<()> {
        if partial_json.is_empty() {
            return Ok(());
        }
        if !matches!(self.open_block, Some(OpenBlock::ToolUse { .. })) {
            return Err(GatewayError::invalid_sequence(
                "没有打开的 tool_use 块，无法追加输入",
            ));
        }
        self.output_tokens += estimate_tokens(partial_json);
        let encoded = Self::encode(&AnthropicStreamEvent::ContentBlockDelta {
            index: self.current_block_index,
            delta: BlockDelta::InputJsonDelta { partial_json },
        });
        self.send_event(encoded).await
    }

    /// 关闭打开的块，然后发送 `message_delta` 与 `message_stop`
    pub async fn finish(&mut self, stop_reason: &str) -> Result<()> {
        if self.open_block.is_some() {
            self.block_stop().await?;
        }

        let encoded = Self::encode(&AnthropicStreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason,
                stop_sequence: None,
            },
            usage: OutputUsage {
                output_tokens: self.output_tokens,
            },
        });
        self.send_event(encoded).await?;

        let encoded = Self::encode(&AnthropicStreamEvent::MessageStop);
        self.send_event(encoded).await
    }

    /// 专用的 `error` 事件
    pub async fn error(&mut self, message: &str) -> Result<()> {
        let event = AnthropicStreamEvent::Error {
            error: AnthropicErrorBody {
                error_type: "api_error",
                message,
            },
        };
        let frame = Self::encode(&event).unwrap_or_else(|e| {
            tracing::warn!("[ANTHROPIC_SSE] 错误事件序列化失败，使用兜底 JSON: {}", e);
            sse_event_frame("error", &fallback_error_json(message))
        });
        self.sink.send(frame).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        let encoded = Self::encode(&AnthropicStreamEvent::Ping);
        self.send_event(encoded).await
    }

    /// 关闭连接（不写 `[DONE]`）
    pub async fn end(&mut self) -> Result<()> {
        self.sink.close().await
    }

    async fn ensure_message_started(&mut self) -> Result<()> {
        if self.message_started {
            return Ok(());
        }
        let id = self.message_id.clone();
        let model = self.model.clone();
        self.message_start(&id, &model, self.input_tokens).await
    }

    /// 关闭打开的块后，把暂存的工具调用写成完整的 tool_use 块
    async fn flush_deferred_tools(&mut self) -> Result<()> {
        if self.deferred_tools.is_empty() {
            return Ok(());
        }
        if self.open_block.is_some() {
            self.block_stop().await?;
        }
        for call in self.deferred_tools.take() {
            tracing::debug!("[ANTHROPIC_SSE] 写出暂存的工具调用: {}", call.call_id);
            self.start_tool_use_block(&call.call_id, &call.name).await?;
            self.append_tool_input_delta(&call.arguments).await?;
            self.block_stop().await?;
        }
        Ok(())
    }
}

/// 统一事件适配：自行处理 tool_use 块的显式关闭
#[async_trait]
impl<C: OutputChannel> ProtocolWriter for AnthropicSseWriter<C> {
    async fn announce_role(&mut self, _role: &str) -> Result<()> {
        self.ensure_message_started().await
    }

    async fn append_text(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.ensure_message_started().await?;
        if matches!(self.open_block, Some(OpenBlock::ToolUse { .. })) {
            self.block_stop().await?;
        }
        AnthropicSseWriter::append_text(self, text).await
    }

    async fn start_tool_call(&mut self, call_id: &str, name: &str, _index: usize) -> Result<()> {
        self.ensure_message_started().await?;
        if matches!(self.open_block, Some(OpenBlock::ToolUse { .. })) {
            // 当前块的参数可能还没写完，先暂存
            self.deferred_tools.defer(call_id, name);
            return Ok(());
        }
        self.start_tool_use_block(call_id, name).await
    }

    async fn append_tool_arguments(
        &mut self,
        call_id: &str,
        _index: usize,
        partial_json: &str,
    ) -> Result<()> {
        if partial_json.is_empty() {
            return Ok(());
        }
        let block_open =
            matches!(&self.open_block, Some(OpenBlock::ToolUse { id }) if id == call_id);
        if !block_open {
            if self.deferred_tools.append(call_id, partial_json) {
                return Ok(());
            }
            tracing::warn!(
                "[ANTHROPIC_SSE] 工具调用 {} 的块未打开，丢弃参数增量",
                call_id
            );
            return Ok(());
        }
        self.append_tool_input_delta(partial_json).await
    }

    async fn finish(&mut self, reason: &FinishReason) -> Result<()> {
        self.ensure_message_started().await?;
        self.flush_deferred_tools().await?;
        AnthropicSseWriter::finish(self, reason.to_anthropic_str()).await
    }

    async fn error(&mut self, message: &str) -> Result<()> {
        AnthropicSseWriter::error(self, message).await
    }

    async fn ping(&mut self) -> Result<()> {
        self.ensure_message_started().await?;
        AnthropicSseWriter::ping(self).await
    }

    async fn end(&mut self) -> Result<()> {
        AnthropicSseWriter::end(self).await
    }
}
