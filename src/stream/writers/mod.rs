//! 协议写入器
//!
//! 将统一的 `StreamEvent` 编码为不同前端协议的线格式并写入输出通道。
//!
//! # 支持的格式
//!
//! - OpenAI SSE (`data: {...}`, 以 `data: [DONE]` 结束)
//! - Ollama NDJSON (每行一个 JSON，`done: true` 为最后一行)
//! - Anthropic SSE (`event: xxx\ndata: {...}`)
//! - Open Responses SSE (点分事件名 + sequence_number)
//!
//! 每个写入器只服务一个响应，构造后按状态机推进，`end()` 之后即丢弃。

pub mod anthropic_sse;
pub mod ndjson;
pub mod open_responses;
pub mod openai_sse;

pub use anthropic_sse::AnthropicSseWriter;
pub use ndjson::NdjsonWriter;
pub use open_responses::OpenResponsesWriter;
pub use openai_sse::OpenAiSseWriter;

use crate::error::Result;
use crate::stream::channel::OutputChannel;
use crate::stream::events::{FinishReason, StreamEvent};
use async_trait::async_trait;
use bytes::Bytes;

pub const CONTENT_TYPE_EVENT_STREAM: &str = "text/event-stream";
pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// 协议写入器公共接口
///
/// 调用方必须按顺序调用（同一实例不支持并发），每个操作最多完成一次
/// 编码 + 写入 + flush。空的文本/参数增量不会产生任何字节。
#[async_trait]
pub trait ProtocolWriter: Send {
    async fn announce_role(&mut self, role: &str) -> Result<()>;

    async fn append_text(&mut self, text: &str) -> Result<()>;

    async fn start_tool_call(&mut self, call_id: &str, name: &str, index: usize) -> Result<()>;

    async fn append_tool_arguments(
        &mut self,
        call_id: &str,
        index: usize,
        partial_json: &str,
    ) -> Result<()>;

    async fn finish(&mut self, reason: &FinishReason) -> Result<()>;

    /// 上游错误，写出协议对应的错误帧；调用方随后应调用 `end()`
    async fn error(&mut self, message: &str) -> Result<()>;

    /// 心跳
    async fn ping(&mut self) -> Result<()>;

    /// 写出终止标记（如协议需要）并关闭通道
    async fn end(&mut self) -> Result<()>;

    /// 将单个流事件分派到对应操作
    async fn handle(&mut self, event: &StreamEvent) -> Result<()> {
        match event {
            StreamEvent::RoleAnnounced { role } => self.announce_role(role).await,
            StreamEvent::TextDelta { text } => self.append_text(text).await,
            StreamEvent::ToolCallStarted {
                call_id,
                name,
                index,
            } => self.start_tool_call(call_id, name, *index).await,
            StreamEvent::ToolArgumentsDelta {
                call_id,
                index,
                partial_json,
            } => {
                self.append_tool_arguments(call_id, *index, partial_json)
                    .await
            }
            StreamEvent::Finished { reason } => self.finish(reason).await,
            StreamEvent::Error { message } => self.error(message).await,
            StreamEvent::Ping => self.ping().await,
        }
    }
}

/// 帧写入器
///
/// 负责首帧前一次性写出响应头，以及每帧 write + flush。
#[derive(Debug)]
pub struct FrameSink<C> {
    channel: C,
    content_type: &'static str,
    extra_headers: Vec<(String, String)>,
    headers_sent: bool,
}

impl<C: OutputChannel> FrameSink<C> {
    pub fn new(channel: C, content_type: &'static str, extra_headers: Vec<(String, String)>) -> Self {
        Self {
            channel,
            content_type,
            extra_headers,
            headers_sent: false,
        }
    }

    /// 替换额外响应头（仅在首帧之前有效）
    pub fn set_extra_headers(&mut self, headers: Vec<(String, String)>) {
        if self.headers_sent {
            tracing::warn!("[WRITER] 响应头已发送，忽略新的额外响应头");
            return;
        }
        self.extra_headers = headers;
    }

    async fn ensure_headers(&mut self) -> Result<()> {
        if self.headers_sent {
            return Ok(());
        }
        let mut headers = Vec::with_capacity(self.extra_headers.len() + 1);
        headers.push(("Content-Type".to_string(), self.content_type.to_string()));
        headers.extend(
            self.extra_headers
                .iter()
                .filter(|(k, _)| !k.eq_ignore_ascii_case("content-type"))
                .cloned(),
        );
        self.channel.write_headers(&headers).await?;
        self.headers_sent = true;
        Ok(())
    }

    /// 写出一帧并立即 flush
    pub async fn send(&mut self, frame: String) -> Result<()> {
        self.ensure_headers().await?;
        self.channel.write_bytes(Bytes::from(frame)).await?;
        self.channel.flush().await?;
        Ok(())
    }

    /// 关闭通道（先补发响应头，保证空响应也带正确的 Content-Type）
    pub async fn close(&mut self) -> Result<()> {
        if self.channel.is_closed() {
            return Ok(());
        }
        self.ensure_headers().await?;
        self.channel.flush().await?;
        self.channel.close().await?;
        Ok(())
    }

    /// 编码失败后立即关闭，避免发送不完整的帧
    pub async fn abort(&mut self) {
        if let Err(e) = self.channel.close().await {
            tracing::warn!("[WRITER] 关闭通道失败: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }
}

/// 暂存的工具调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeferredToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// 另一个工具块仍在流式输出时到达的工具调用
///
/// 只允许一个工具块实时输出的协议（Anthropic、Open Responses）
/// 先按到达顺序缓存这些调用及其参数增量，结束时再整块写出。
#[derive(Debug, Default)]
pub(crate) struct DeferredToolCalls {
    calls: Vec<DeferredToolCall>,
}

impl DeferredToolCalls {
    pub fn defer(&mut self, call_id: &str, name: &str) {
        self.calls.push(DeferredToolCall {
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments: String::new(),
        });
    }

    /// 追加参数增量；该调用未被暂存时返回 false
    pub fn append(&mut self, call_id: &str, partial_json: &str) -> bool {
        match self.calls.iter_mut().find(|c| c.call_id == call_id) {
            Some(call) => {
                call.arguments.push_str(partial_json);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn take(&mut self) -> Vec<DeferredToolCall> {
        std::mem::take(&mut self.calls)
    }
}

/// SSE `data:` 帧
pub fn sse_data_frame(json: &str) -> String {
    format!("data: {json}\n\n")
}

/// SSE 具名事件帧
pub fn sse_event_frame(event: &str, json: &str) -> String {
    format!("event: {event}\ndata: {json}\n\n")
}

/// 手工拼装的最小错误 JSON，用于序列化失败时的兜底
pub fn fallback_error_json(message: &str) -> String {
    format!(
        r#"{{"error":{{"message":"{}","type":"server_error"}}}}"#,
        escape_json_string(message)
    )
}

/// JSON 字符串转义
pub fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
