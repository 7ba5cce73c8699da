//! OpenAI SSE 写入器
//!
//! 将流事件编码为 OpenAI Chat Completions SSE 格式。
//!
//! # 格式说明
//!
//! ```text
//! data: {"id":"chatcmpl-xxx","object":"chat.completion.chunk","created":1234567890,"model":"gpt-4","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}
//!
//! data: [DONE]
//! ```

use super::{
    fallback_error_json, sse_data_frame, FrameSink, ProtocolWriter, CONTENT_TYPE_EVENT_STREAM,
    DONE_FRAME,
};
use crate::error::Result;
use crate::models::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkUsage, ErrorBody, ErrorEnvelope,
    FunctionCallDelta, ToolCallDelta,
};
use crate::stream::channel::OutputChannel;
use crate::stream::events::{estimate_tokens, FinishReason};
use async_trait::async_trait;

/// OpenAI SSE 写入器
#[derive(Debug)]
pub struct OpenAiSseWriter<C> {
    sink: FrameSink<C>,
    /// 响应 ID
    response_id: String,
    /// 模型名称
    model: String,
    /// 创建时间戳（构造时固定）
    created: i64,
    /// 估算的输出 token 数
    completion_tokens: u32,
}

impl<C: OutputChannel> OpenAiSseWriter<C> {
    /// 创建新的写入器
    pub fn new(channel: C, model: impl Into<String>) -> Self {
        Self::with_id(
            channel,
            format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model,
        )
    }

    /// 使用指定的响应 ID 创建写入器
    pub fn with_id(channel: C, response_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            sink: FrameSink::new(channel, CONTENT_TYPE_EVENT_STREAM, Vec::new()),
            response_id: response_id.into(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            completion_tokens: 0,
        }
    }

    /// 设置首帧前附带的额外响应头
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.sink.set_extra_headers(headers);
        self
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn completion_tokens(&self) -> u32 {
        self.completion_tokens
    }

    pub fn channel(&self) -> &C {
        self.sink.channel()
    }

    fn chunk<'a>(
        &'a self,
        delta: ChunkDelta<'a>,
        finish_reason: Option<&'a str>,
    ) -> ChatCompletionChunk<'a> {
        ChatCompletionChunk {
            id: &self.response_id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    /// 编码并发送内容块；编码失败时记录日志并立即关闭连接
    async fn send_chunk(&mut self, encoded: serde_json::Result<String>) -> Result<()> {
        match encoded {
            Ok(json) => self.sink.send(sse_data_frame(&json)).await,
            Err(e) => {
                tracing::error!("[OPENAI_SSE] 响应块序列化失败，关闭连接: {}", e);
                self.sink.abort().await;
                Err(e.into())
            }
        }
    }

    /// 角色块：delta 只含 role 与空 content，必须是第一个响应体帧
    pub async fn announce_role(&mut self, role: &str) -> Result<()> {
        let encoded = serde_json::to_string(&self.chunk(
            ChunkDelta {
                role: Some(role),
                content: Some(""),
                tool_calls: None,
            },
            None,
        ));
        self.send_chunk(encoded).await
    }

    /// 文本增量
    pub async fn append_text(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.completion_tokens += estimate_tokens(text);
        let encoded = serde_json::to_string(&self.chunk(
            ChunkDelta {
                content: Some(text),
                ..Default::default()
            },
            None,
        ));
        self.send_chunk(encoded).await
    }

    /// 工具调用开始：携带 id 与函数名，不带参数
    pub async fn start_tool_call(&mut self, call_id: &str, name: &str, index: usize) -> Result<()> {
        let encoded = serde_json::to_string(&self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: Some(call_id),
                    call_type: Some("function"),
                    function: FunctionCallDelta {
                        name: Some(name),
                        arguments: None,
                    },
                }]),
                ..Default::default()
            },
            None,
        ));
        self.send_chunk(encoded).await
    }

    /// 工具参数增量：后续增量只按 index 关联，不重复 id/name
    pub async fn append_tool_arguments(&mut self, index: usize, partial_json: &str) -> Result<()> {
        if partial_json.is_empty() {
            return Ok(());
        }
        self.completion_tokens += estimate_tokens(partial_json);
        let encoded = serde_json::to_string(&self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: None,
                    call_type: None,
                    function: FunctionCallDelta {
                        name: None,
                        arguments: Some(partial_json),
                    },
                }]),
                ..Default::default()
            },
            None,
        ));
        self.send_chunk(encoded).await
    }

    /// 结束块：空 delta + finish_reason
    pub async fn finish(&mut self, reason: &FinishReason) -> Result<()> {
        let encoded =
            serde_json::to_string(&self.chunk(ChunkDelta::default(), Some(reason.to_openai_str())));
        self.send_chunk(encoded).await
    }

    /// `stream_options.include_usage` 的 usage 尾块（choices 为空）
    pub async fn usage(&mut self, prompt_tokens: u32) -> Result<()> {
        let chunk = ChatCompletionChunk {
            id: &self.response_id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            choices: Vec::new(),
            usage: Some(ChunkUsage {
                prompt_tokens,
                completion_tokens: self.completion_tokens,
                total_tokens: prompt_tokens + self.completion_tokens,
            }),
        };
        let encoded = serde_json::to_string(&chunk);
        self.send_chunk(encoded).await
    }

    /// 错误帧；序列化失败时退回手工拼装的 JSON
    pub async fn error(&mut self, message: &str) -> Result<()> {
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                message,
                error_type: "server_error",
                code: None,
            },
        };
        let json = serde_json::to_string(&envelope).unwrap_or_else(|e| {
            tracing::warn!("[OPENAI_SSE] 错误帧序列化失败，使用兜底 JSON: {}", e);
            fallback_error_json(message)
        });
        self.sink.send(sse_data_frame(&json)).await
    }

    /// 心跳（SSE 注释）
    pub async fn ping(&mut self) -> Result<()> {
        self.sink.send(": ping\n\n".to_string()).await
    }

    /// 写出 `data: [DONE]` 后关闭通道
    pub async fn end(&mut self) -> Result<()> {
        self.sink.send(DONE_FRAME.to_string()).await?;
        self.sink.close().await
    }
}

#[async_trait]
impl<C: OutputChannel> ProtocolWriter for OpenAiSseWriter<C> {
    async fn announce_role(&mut self, role: &str) -> Result<()> {
        OpenAiSseWriter::announce_role(self, role).await
    }

    async fn append_text(&mut self, text: &str) -> Result<()> {
        OpenAiSseWriter::append_text(self, text).await
    }

    async fn start_tool_call(&mut self, call_id: &str, name: &str, index: usize) -> Result<()> {
        OpenAiSseWriter::start_tool_call(self, call_id, name, index).await
    }

    async fn append_tool_arguments(
        &mut self,
        _call_id: &str,
        index: usize,
        partial_json: &str,
    ) -> Result<()> {
        OpenAiSseWriter::append_tool_arguments(self, index, partial_json).await
    }

    async fn finish(&mut self, reason: &FinishReason) -> Result<()> {
        OpenAiSseWriter::finish(self, reason).await
    }

    async fn error(&mut self, message: &str) -> Result<()> {
        OpenAiSseWriter::error(self, message).await
    }

    async fn ping(&mut self) -> Result<()> {
        OpenAiSseWriter::ping(self).await
    }

    async fn end(&mut self) -> Result<()> {
        OpenAiSseWriter::end(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::channel::MemoryChannel;

    fn writer() -> (OpenAiSseWriter<MemoryChannel>, MemoryChannel) {
        let channel = MemoryChannel::new();
        let handle = channel.clone();
        (
            OpenAiSseWriter::with_id(channel, "chatcmpl-test", "llama-3"),
            handle,
        )
    }

    fn parse_frame(frame: &str) -> serde_json::Value {
        let json = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .expect("not an SSE data frame");
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_hello_stream_frames() {
        let (mut w, handle) = writer();

        w.announce_role("assistant").await.unwrap();
        w.append_text("Hel").await.unwrap();
        w.append_text("lo").await.unwrap();
        w.finish(&FinishReason::Stop).await.unwrap();
        w.end().await.unwrap();

        let frames = handle.frames();
        assert_eq!(frames.len(), 5);

        let role = parse_frame(&frames[0]);
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["id"], "chatcmpl-test");
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(role["choices"][0]["delta"]["content"], "");

        assert_eq!(parse_frame(&frames[1])["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(parse_frame(&frames[2])["choices"][0]["delta"]["content"], "lo");

        let finish = parse_frame(&frames[3]);
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(finish["choices"][0]["delta"], serde_json::json!({}));

        assert_eq!(frames[4], "data: [DONE]\n\n");
        assert!(handle.closed());
        assert_eq!(
            handle.header("Content-Type").as_deref(),
            Some("text/event-stream")
        );
        // 每帧一次 flush，关闭前再 flush 一次
        assert_eq!(handle.flush_count(), 6);
    }

    #[tokio::test]
    async fn test_created_fixed_for_stream() {
        let (mut w, handle) = writer();
        w.append_text("a").await.unwrap();
        w.append_text("b").await.unwrap();

        let frames = handle.frames();
        assert_eq!(parse_frame(&frames[0])["created"], parse_frame(&frames[1])["created"]);
    }

    #[tokio::test]
    async fn test_tool_call_deltas() {
        let (mut w, handle) = writer();

        w.start_tool_call("call_1", "read_file", 0).await.unwrap();
        w.append_tool_arguments(0, "{\"path\":").await.unwrap();

        let frames = handle.frames();
        let start = parse_frame(&frames[0]);
        let call = &start["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 0);
        assert_eq!(call["id"], "call_1");
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["name"], "read_file");
        assert!(call["function"].get("arguments").is_none());

        let delta = parse_frame(&frames[1]);
        let call = &delta["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 0);
        assert!(call.get("id").is_none());
        assert!(call["function"].get("name").is_none());
        assert_eq!(call["function"]["arguments"], "{\"path\":");
    }

    #[tokio::test]
    async fn test_empty_deltas_write_nothing() {
        let (mut w, handle) = writer();
        w.append_text("").await.unwrap();
        w.append_tool_arguments(0, "").await.unwrap();

        assert_eq!(handle.body_len(), 0);
        assert!(handle.headers().is_none());
    }

    #[tokio::test]
    async fn test_error_frame() {
        let (mut w, handle) = writer();
        w.error("model \"x\" crashed").await.unwrap();
        w.end().await.unwrap();

        let frames = handle.frames();
        let err = parse_frame(&frames[0]);
        assert_eq!(err["error"]["message"], "model \"x\" crashed");
        assert_eq!(err["error"]["type"], "server_error");
        assert_eq!(frames[1], DONE_FRAME);
    }

    #[tokio::test]
    async fn test_usage_trailer() {
        let (mut w, handle) = writer();
        w.append_text("abcdefgh").await.unwrap();
        w.finish(&FinishReason::Length).await.unwrap();
        w.usage(10).await.unwrap();

        let frames = handle.frames();
        let usage = parse_frame(&frames[2]);
        assert_eq!(usage["choices"], serde_json::json!([]));
        assert_eq!(usage["usage"]["prompt_tokens"], 10);
        assert_eq!(usage["usage"]["completion_tokens"], 2);
        assert_eq!(usage["usage"]["total_tokens"], 12);
        assert_eq!(parse_frame(&frames[1])["choices"][0]["finish_reason"], "length");
    }

    #[tokio::test]
    async fn test_extra_headers_sent_once() {
        let channel = MemoryChannel::new();
        let handle = channel.clone();
        let mut w = OpenAiSseWriter::new(channel, "m")
            .with_headers(vec![("Cache-Control".to_string(), "no-cache".to_string())]);

        w.append_text("x").await.unwrap();
        w.append_text("y").await.unwrap();

        let headers = handle.headers().unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].1, "text/event-stream");
        assert_eq!(handle.header("cache-control").as_deref(), Some("no-cache"));
        assert!(w.response_id().starts_with("chatcmpl-"));
    }
}
