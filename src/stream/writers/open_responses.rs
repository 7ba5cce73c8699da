//! Open Responses SSE 写入器
//!
//! 事件帧与 Anthropic 相同（`event:` + `data:`），事件名为点分字符串。
//! 每个事件携带严格递增的 `sequence_number`（从 1 开始，不重用、不跳号），
//! `response.completed` / `response.failed` 之后写 `data: [DONE]` 再关闭。
//!
//! 同一时刻只有一个输出项（消息或函数调用）处于打开状态；
//! `output_index` 只在输出项完成时前进。
//!
//! 统一事件适配中，函数调用输出项打开期间到达的其他工具调用连同参数
//! 增量一起暂存，在 `finish` 时依次写成完整的函数调用输出项。

use super::{
    escape_json_string, sse_event_frame, DeferredToolCalls, FrameSink, ProtocolWriter,
    CONTENT_TYPE_EVENT_STREAM, DONE_FRAME,
};
use crate::error::{GatewayError, Result};
use crate::models::open_responses::{
    OpenResponsesEvent, OutputContent, OutputItem, ResponseError, ResponseObject, ResponseUsage,
    SequencedEvent, RESPONSE_FAILED,
};
use crate::stream::channel::OutputChannel;
use crate::stream::events::{estimate_tokens, FinishReason};
use async_trait::async_trait;

/// 当前打开的输出项
#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenItem {
    Message {
        id: String,
    },
    FunctionCall {
        id: String,
        call_id: String,
        name: String,
    },
}

/// Open Responses 写入器
#[derive(Debug)]
pub struct OpenResponsesWriter<C> {
    sink: FrameSink<C>,
    response_id: String,
    model: String,
    created_at: i64,
    /// 最近一次分配的序号
    sequence_number: u64,
    current_output_index: u32,
    open_item: Option<OpenItem>,
    /// 当前输出项的累积文本（消息文本或函数参数）
    accumulated_text: String,
    /// 已完成的输出项
    output: Vec<OutputItem>,
    input_tokens: u32,
    output_tokens: u32,
    created_sent: bool,
    deferred_tools: DeferredToolCalls,
}

impl<C: OutputChannel> OpenResponsesWriter<C> {
    pub fn new(channel: C, model: impl Into<String>) -> Self {
        Self::with_id(
            channel,
            format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model,
            0,
        )
    }

    pub fn with_id(
        channel: C,
        response_id: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u32,
    ) -> Self {
        Self {
            sink: FrameSink::new(channel, CONTENT_TYPE_EVENT_STREAM, Vec::new()),
            response_id: response_id.into(),
            model: model.into(),
            created_at: chrono::Utc::now().timestamp(),
            sequence_number: 0,
            current_output_index: 0,
            open_item: None,
            accumulated_text: String::new(),
            output: Vec::new(),
            input_tokens,
            output_tokens: 0,
            created_sent: false,
            deferred_tools: DeferredToolCalls::default(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.sink.set_extra_headers(headers);
        self
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn current_output_index(&self) -> u32 {
        self.current_output_index
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn channel(&self) -> &C {
        self.sink.channel()
    }

    /// 分配下一个序号（先自增后返回）
    pub fn next_sequence_number(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }

    fn encode(event: &OpenResponsesEvent<'_>, sequence_number: u64) -> serde_json::Result<String> {
        serde_json::to_string(&SequencedEvent {
            event,
            sequence_number,
        })
        .map(|json| sse_event_frame(event.event_name(), &json))
    }

    /// 发送已编码的事件；编码失败时记录日志并立即关闭连接
    async fn send_event(&mut self, encoded: serde_json::Result<String>) -> Result<()> {
        match encoded {
            Ok(frame) => self.sink.send(frame).await,
            Err(e) => {
                tracing::error!("[OPEN_RESPONSES] 事件序列化失败，关闭连接: {}", e);
                self.sink.abort().await;
                Err(e.into())
            }
        }
    }

    fn response_object<'a>(
        &'a self,
        status: &'a str,
        output: &'a [OutputItem],
        usage: Option<ResponseUsage>,
        error: Option<ResponseError<'a>>,
    ) -> ResponseObject<'a> {
        ResponseObject {
            id: &self.response_id,
            object: "response",
            created_at: self.created_at,
            model: &self.model,
            status,
            output,
            usage,
            error,
        }
    }

    fn usage(&self) -> ResponseUsage {
        ResponseUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
        }
    }

    fn expect_message(&self) -> Result<String> {
        match &self.open_item {
            Some(OpenItem::Message { id }) => Ok(id.clone()),
            _ => Err(GatewayError::invalid_sequence("没有打开的消息输出项")),
        }
    }

    fn expect_function_call(&self) -> Result<(String, String, String)> {
        match &self.open_item {
            Some(OpenItem::FunctionCall { id, call_id, name }) => {
                Ok((id.clone(), call_id.clone(), name.clone()))
            }
            _ => Err(GatewayError::invalid_sequence("没有打开的函数调用输出项")),
        }
    }

    fn ensure_no_open_item(&self) -> Result<()> {
        if self.open_item.is_some() {
            return Err(GatewayError::invalid_sequence(
                "上一个输出项未完成时不能打开新的输出项",
            ));
        }
        Ok(())
    }

    // ========================================================================
    // 响应生命周期
    // ========================================================================

    /// 重置全部计数器并发送 `response.created`（status = in_progress）
    pub async fn response_created(&mut self) -> Result<()> {
        self.sequence_number = 0;
        self.current_output_index = 0;
        self.open_item = None;
        self.accumulated_text.clear();
        self.output.clear();
        self.output_tokens = 0;
        self.created_sent = true;
        self.deferred_tools = DeferredToolCalls::default();

        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::ResponseCreated {
                response: self.response_object("in_progress", &[], None, None),
            },
            seq,
        );
        self.send_event(encoded).await
    }

    /// 发送 `response.completed`，携带已完成的输出项与 usage
    ///
    /// 结束原因为 `length` 时 status 为 `incomplete`。
    pub async fn response_completed(&mut self, reason: &FinishReason) -> Result<()> {
        let status = match reason {
            FinishReason::Length => "incomplete",
            _ => "completed",
        };
        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::ResponseCompleted {
                response: self.response_object(status, &self.output, Some(self.usage()), None),
            },
            seq,
        );
        self.send_event(encoded).await
    }

    /// 发送 `response.failed`
    pub async fn error(&mut self, message: &str) -> Result<()> {
        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::ResponseFailed {
                response: self.response_object(
                    "failed",
                    &self.output,
                    None,
                    Some(ResponseError {
                        code: "server_error",
                        message,
                    }),
                ),
            },
            seq,
        );
        let frame = encoded.unwrap_or_else(|e| {
            tracing::warn!("[OPEN_RESPONSES] 失败事件序列化失败，使用兜底 JSON: {}", e);
            sse_event_frame(
                RESPONSE_FAILED,
                &fallback_failed_json(&self.response_id, seq, message),
            )
        });
        self.sink.send(frame).await
    }

    /// 写出 `data: [DONE]` 后关闭通道
    pub async fn end(&mut self) -> Result<()> {
        self.sink.send(DONE_FRAME.to_string()).await?;
        self.sink.close().await
    }

    // ========================================================================
    // 消息输出项
    // ========================================================================

    pub async fn message_item_added(&mut self, item_id: &str) -> Result<()> {
        self.ensure_no_open_item()?;
        self.open_item = Some(OpenItem::Message {
            id: item_id.to_string(),
        });
        self.accumulated_text.clear();

        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::OutputItemAdded {
                output_index: self.current_output_index,
                item: OutputItem::Message {
                    id: item_id.to_string(),
                    role: "assistant".to_string(),
                    status: "in_progress".to_string(),
                    content: Vec::new(),
                },
            },
            seq,
        );
        self.send_event(encoded).await
    }

    pub async fn append_text(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let item_id = self.expect_message()?;
        self.accumulated_text.push_str(text);
        self.output_tokens += estimate_tokens(text);

        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::OutputTextDelta {
                item_id: &item_id,
                output_index: self.current_output_index,
                content_index: 0,
                delta: text,
            },
            seq,
        );
        self.send_event(encoded).await
    }

    pub async fn text_done(&mut self) -> Result<()> {
        let item_id = self.expect_message()?;
        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::OutputTextDone {
                item_id: &item_id,
                output_index: self.current_output_index,
                content_index: 0,
                text: &self.accumulated_text,
            },
            seq,
        );
        self.send_event(encoded).await
    }

    /// 完成消息输出项，之后才推进 output_index
    pub async fn message_item_done(&mut self) -> Result<()> {
        let item_id = self.expect_message()?;
        let item = OutputItem::Message {
            id: item_id,
            role: "assistant".to_string(),
            status: "completed".to_string(),
            content: vec![OutputContent::OutputText {
                text: std::mem::take(&mut self.accumulated_text),
                annotations: Vec::new(),
            }],
        };
        self.complete_item(item).await
    }

    // ========================================================================
    // 函数调用输出项
    // ========================================================================

    pub async fn function_call_item_added(
        &mut self,
        item_id: &str,
        call_id: &str,
        name: &str,
    ) -> Result<()> {
        self.ensure_no_open_item()?;
        self.open_item = Some(OpenItem::FunctionCall {
            id: item_id.to_string(),
            call_id: call_id.to_string(),
            name: name.to_string(),
        });
        self.accumulated_text.clear();

        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::OutputItemAdded {
                output_index: self.current_output_index,
                item: OutputItem::FunctionCall {
                    id: item_id.to_string(),
                    call_id: call_id.to_string(),
                    name: name.to_string(),
                    arguments: String::new(),
                    status: "in_progress".to_string(),
                },
            },
            seq,
        );
        self.send_event(encoded).await
    }

    pub async fn append_function_call_arguments_delta(&mut self, delta: &str) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let (item_id, _, _) = self.expect_function_call()?;
        self.accumulated_text.push_str(delta);
        self.output_tokens += estimate_tokens(delta);

        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::FunctionCallArgumentsDelta {
                item_id: &item_id,
                output_index: self.current_output_index,
                delta,
            },
            seq,
        );
        self.send_event(encoded).await
    }

    pub async fn function_call_arguments_done(&mut self) -> Result<()> {
        let (item_id, _, _) = self.expect_function_call()?;
        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::FunctionCallArgumentsDone {
                item_id: &item_id,
                output_index: self.current_output_index,
                arguments: &self.accumulated_text,
            },
            seq,
        );
        self.send_event(encoded).await
    }

    /// 完成函数调用输出项，之后才推进 output_index
    pub async fn function_call_item_done(&mut self) -> Result<()> {
        let (id, call_id, name) = self.expect_function_call()?;
        let item = OutputItem::FunctionCall {
            id,
            call_id,
            name,
            arguments: std::mem::take(&mut self.accumulated_text),
            status: "completed".to_string(),
        };
        self.complete_item(item).await
    }

    async fn complete_item(&mut self, item: OutputItem) -> Result<()> {
        let seq = self.next_sequence_number();
        let encoded = Self::encode(
            &OpenResponsesEvent::OutputItemDone {
                output_index: self.current_output_index,
                item: item.clone(),
            },
            seq,
        );
        self.send_event(encoded).await?;

        self.output.push(item);
        self.open_item = None;
        self.current_output_index += 1;
        Ok(())
    }

    // ========================================================================
    // 统一事件适配
    // ========================================================================

    async fn ensure_created(&mut self) -> Result<()> {
        if self.created_sent {
            return Ok(());
        }
        self.response_created().await
    }

    /// 按输出项类型发送完成事件
    async fn close_open_item(&mut self) -> Result<()> {
        match self.open_item {
            Some(OpenItem::Message { .. }) => {
                self.text_done().await?;
                self.message_item_done().await
            }
            Some(OpenItem::FunctionCall { .. }) => {
                self.function_call_arguments_done().await?;
                self.function_call_item_done().await
            }
            None => Ok(()),
        }
    }

    /// 关闭打开的输出项后，把暂存的工具调用写成完整的函数调用输出项
    async fn flush_deferred_tools(&mut self) -> Result<()> {
        if self.deferred_tools.is_empty() {
            return Ok(());
        }
        self.close_open_item().await?;
        for call in self.deferred_tools.take() {
            tracing::debug!("[OPEN_RESPONSES] 写出暂存的工具调用: {}", call.call_id);
            let item_id = format!("fc_{}", uuid::Uuid::new_v4().simple());
            self.function_call_item_added(&item_id, &call.call_id, &call.name)
                .await?;
            self.append_function_call_arguments_delta(&call.arguments)
                .await?;
            self.close_open_item().await?;
        }
        Ok(())
    }
}

/// 手工拼装的 `response.failed` 事件，保留序号
fn fallback_failed_json(response_id: &str, sequence_number: u64, message: &str) -> String {
    format!(
        r#"{{"type":"response.failed","sequence_number":{},"response":{{"id":"{}","object":"response","status":"failed","error":{{"code":"server_error","message":"{}"}}}}}}"#,
        sequence_number,
        escape_json_string(response_id),
        escape_json_string(message)
    )
}

#[async_trait]
impl<C: OutputChannel> ProtocolWriter for OpenResponsesWriter<C> {
    async fn announce_role(&mut self, _role: &str) -> Result<()> {
        self.ensure_created().await
    }

    async fn append_text(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.ensure_created().await?;
        if matches!(self.open_item, Some(OpenItem::FunctionCall { .. })) {
            self.close_open_item().await?;
        }
        if self.open_item.is_none() {
            let item_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
            self.message_item_added(&item_id).await?;
        }
        OpenResponsesWriter::append_text(self, text).await
    }

    async fn start_tool_call(&mut self, call_id: &str, name: &str, _index: usize) -> Result<()> {
        self.ensure_created().await?;
        if matches!(self.open_item, Some(OpenItem::FunctionCall { .. })) {
            // 当前函数调用的参数可能还没写完，先暂存
            self.deferred_tools.defer(call_id, name);
            return Ok(());
        }
        self.close_open_item().await?;
        let item_id = format!("fc_{}", uuid::Uuid::new_v4().simple());
        self.function_call_item_added(&item_id, call_id, name).await
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
        let item_open = matches!(
            &self.open_item,
            Some(OpenItem::FunctionCall { call_id: open, .. }) if open == call_id
        );
        if !item_open {
            if self.deferred_tools.append(call_id, partial_json) {
                return Ok(());
            }
            tracing::warn!(
                "[OPEN_RESPONSES] 工具调用 {} 没有打开的输出项，丢弃参数增量",
                call_id
            );
            return Ok(());
        }
        self.append_function_call_arguments_delta(partial_json).await
    }

    async fn finish(&mut self, reason: &FinishReason) -> Result<()> {
        self.ensure_created().await?;
        self.flush_deferred_tools().await?;
        self.close_open_item().await?;
        self.response_completed(reason).await
    }

    async fn error(&mut self, message: &str) -> Result<()> {
        self.ensure_created().await?;
        OpenResponsesWriter::error(self, message).await
    }

    /// 以 SSE 注释保活，不占用序号
    async fn ping(&mut self) -> Result<()> {
        self.sink.send(": ping\n\n".to_string()).await
    }

    async fn end(&mut self) -> Result<()> {
        OpenResponsesWriter::end(self).await
    }
}
