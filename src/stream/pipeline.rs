//! 统一流处理管道
//!
//! 根据请求协商出的输出格式构造写入器，将推理引擎的 `StreamEvent` 流
//! 1:1 转发为写入器调用。
//!
//! # 使用示例
//!
//! ```ignore
//! use completion_gateway::stream::pipeline::{OutputFormat, ResponseMeta, StreamPipeline};
//!
//! let format = OutputFormat::negotiate("/v1/chat/completions", None);
//! let pipeline = StreamPipeline::new(format, ResponseMeta::new("llama-3"), channel, &config.streaming);
//! pipeline.run(events).await?;
//! ```

use crate::config::{GatewayConfig, StreamingConfig};
use crate::error::Result;
use crate::models::openai::ChatCompletionRequest;
use crate::stream::channel::OutputChannel;
use crate::stream::events::{estimate_tokens, StreamEvent};
use crate::stream::writers::{
    AnthropicSseWriter, NdjsonWriter, OpenAiSseWriter, OpenResponsesWriter, ProtocolWriter,
    CONTENT_TYPE_EVENT_STREAM, CONTENT_TYPE_NDJSON,
};
use futures::{Stream, StreamExt};

/// 上游在终止事件之前结束时发送给客户端的错误信息
const UPSTREAM_ENDED_MESSAGE: &str = "upstream stream ended before completion";

/// 输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// OpenAI Chat Completions SSE
    #[default]
    OpenAiSse,
    /// Ollama NDJSON
    Ndjson,
    /// Anthropic Messages SSE
    AnthropicSse,
    /// Open Responses SSE
    OpenResponsesSse,
}

impl OutputFormat {
    /// 根据请求路径与 Accept 头选择输出格式
    pub fn negotiate(path: &str, accept: Option<&str>) -> Self {
        let path = path.trim_end_matches('/');
        if path.ends_with("/v1/messages") {
            return Self::AnthropicSse;
        }
        if path.ends_with("/v1/responses") {
            return Self::OpenResponsesSse;
        }
        let wants_ndjson = accept
            .map(|a| a.to_ascii_lowercase().contains(CONTENT_TYPE_NDJSON))
            .unwrap_or(false);
        if path.ends_with("/api/chat") || wants_ndjson {
            return Self::Ndjson;
        }
        Self::OpenAiSse
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Ndjson => CONTENT_TYPE_NDJSON,
            _ => CONTENT_TYPE_EVENT_STREAM,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAiSse => "openai_sse",
            Self::Ndjson => "ndjson",
            Self::AnthropicSse => "anthropic_sse",
            Self::OpenResponsesSse => "open_responses_sse",
        }
    }
}

/// 单个响应的元数据
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// 响应 ID；为空时由写入器按协议前缀生成
    pub id: Option<String>,
    /// 模型名称
    pub model: String,
    /// 输入 token 数（用于 usage 字段）
    pub prompt_tokens: u32,
    /// 是否输出 usage 尾块（仅 OpenAI SSE）
    pub include_usage: bool,
}

impl ResponseMeta {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_prompt_tokens(mut self, prompt_tokens: u32) -> Self {
        self.prompt_tokens = prompt_tokens;
        self
    }

    pub fn with_include_usage(mut self, include_usage: bool) -> Self {
        self.include_usage = include_usage;
        self
    }

    /// 由规范请求生成响应元信息
    ///
    /// 模型名为空时使用 `default_model`；输入 token 按消息文本估算。
    pub fn for_request(request: &ChatCompletionRequest, config: &GatewayConfig) -> Self {
        let model = if request.model.trim().is_empty() {
            config.default_model.clone()
        } else {
            request.model.clone()
        };
        let prompt_text: String = request
            .messages
            .iter()
            .map(|m| m.text_content())
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(model)
            .with_prompt_tokens(estimate_tokens(&prompt_text))
            .with_include_usage(request.include_usage() || config.streaming.include_usage)
    }
}

/// 写入器封装
enum FormatWriter<C> {
    OpenAi(OpenAiSseWriter<C>),
    Ndjson(NdjsonWriter<C>),
    Anthropic(AnthropicSseWriter<C>),
    OpenResponses(OpenResponsesWriter<C>),
}

impl<C: OutputChannel> FormatWriter<C> {
    fn as_writer(&mut self) -> &mut dyn ProtocolWriter {
        match self {
            FormatWriter::OpenAi(w) => w,
            FormatWriter::Ndjson(w) => w,
            FormatWriter::Anthropic(w) => w,
            FormatWriter::OpenResponses(w) => w,
        }
    }
}

/// 管道运行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    /// 转发给写入器的事件数
    pub forwarded: usize,
    /// 终止事件之后被忽略的事件数
    pub ignored: usize,
    /// 上游是否以终止事件结束
    pub upstream_terminated: bool,
}

/// 统一流处理管道
///
/// 一个管道只服务一个响应，`run` 消费自身。
pub struct StreamPipeline<C> {
    format: OutputFormat,
    meta: ResponseMeta,
    writer: FormatWriter<C>,
}

impl<C: OutputChannel> StreamPipeline<C> {
    /// 创建新的管道
    pub fn new(
        format: OutputFormat,
        meta: ResponseMeta,
        channel: C,
        config: &StreamingConfig,
    ) -> Self {
        let headers = config.header_pairs();
        let model = meta.model.clone();
        let id = meta.id.clone();

        let writer = match format {
            OutputFormat::OpenAiSse => {
                let writer = match id {
                    Some(id) => OpenAiSseWriter::with_id(channel, id, model),
                    None => OpenAiSseWriter::new(channel, model),
                };
                FormatWriter::OpenAi(writer.with_headers(headers))
            }
            OutputFormat::Ndjson => {
                FormatWriter::Ndjson(NdjsonWriter::new(channel, model).with_headers(headers))
            }
            OutputFormat::AnthropicSse => {
                let writer = match id {
                    Some(id) => AnthropicSseWriter::with_id(channel, id, model, meta.prompt_tokens),
                    None => AnthropicSseWriter::with_id(
                        channel,
                        format!("msg_{}", uuid::Uuid::new_v4().simple()),
                        model,
                        meta.prompt_tokens,
                    ),
                };
                FormatWriter::Anthropic(writer.with_headers(headers))
            }
            OutputFormat::OpenResponsesSse => {
                let writer = match id {
                    Some(id) => {
                        OpenResponsesWriter::with_id(channel, id, model, meta.prompt_tokens)
                    }
                    None => OpenResponsesWriter::with_id(
                        channel,
                        format!("resp_{}", uuid::Uuid::new_v4().simple()),
                        model,
                        meta.prompt_tokens,
                    ),
                };
                FormatWriter::OpenResponses(writer.with_headers(headers))
            }
        };

        let meta = ResponseMeta {
            include_usage: meta.include_usage || config.include_usage,
            ..meta
        };

        tracing::debug!(
            "[PIPELINE] 创建管道: format={}, model={}",
            format.name(),
            meta.model
        );

        Self {
            format,
            meta,
            writer,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// 转发单个事件
    async fn forward(&mut self, event: &StreamEvent) -> Result<()> {
        self.writer.as_writer().handle(event).await?;

        if let (StreamEvent::Finished { .. }, FormatWriter::OpenAi(w)) = (event, &mut self.writer) {
            if self.meta.include_usage {
                w.usage(self.meta.prompt_tokens).await?;
            }
        }
        Ok(())
    }

    /// 消费事件流直到终止事件，然后关闭输出
    ///
    /// 终止事件之后的事件会被忽略；上游在终止事件之前结束时，
    /// 写出错误帧并正常关闭。写入失败（包括客户端断开）立即返回。
    pub async fn run<S>(mut self, events: S) -> Result<PipelineStats>
    where
        S: Stream<Item = StreamEvent> + Send,
    {
        futures::pin_mut!(events);
        let mut stats = PipelineStats::default();

        while let Some(event) = events.next().await {
            if stats.upstream_terminated {
                stats.ignored += 1;
                tracing::warn!("[PIPELINE] 终止事件之后收到事件，忽略: {:?}", event);
                continue;
            }

            if let Err(e) = self.forward(&event).await {
                self.log_failure(&e);
                return Err(e);
            }
            stats.forwarded += 1;

            if event.is_terminal() {
                stats.upstream_terminated = true;
                if let Err(e) = self.writer.as_writer().end().await {
                    self.log_failure(&e);
                    return Err(e);
                }
            }
        }

        if !stats.upstream_terminated {
            tracing::warn!(
                "[PIPELINE] 上游在终止事件之前结束 (format={})",
                self.format.name()
            );
            let writer = self.writer.as_writer();
            let result = match writer.error(UPSTREAM_ENDED_MESSAGE).await {
                Ok(()) => writer.end().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.log_failure(&e);
                return Err(e);
            }
        }

        tracing::info!(
            "[PIPELINE] 响应完成: format={}, model={}, events={}",
            self.format.name(),
            self.meta.model,
            stats.forwarded
        );
        Ok(stats)
    }

    fn log_failure(&self, error: &crate::error::GatewayError) {
        if error.is_disconnect() {
            tracing::info!("[PIPELINE] 客户端已断开 (format={})", self.format.name());
        } else {
            tracing::error!(
                "[PIPELINE] 写入失败 (format={}): {}",
                self.format.name(),
                error
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::ChatMessage;
    use crate::stream::channel::MemoryChannel;
    use crate::stream::events::FinishReason;
    use crate::stream::writers::DONE_FRAME;

    fn config() -> StreamingConfig {
        StreamingConfig::default()
    }

    #[test]
    fn test_meta_for_request() {
        let mut request = ChatCompletionRequest {
            model: " ".to_string(),
            messages: vec![ChatMessage::text("user", "abcdefgh")],
            ..Default::default()
        };
        let mut gateway = GatewayConfig::default();
        gateway.default_model = "qwen2".to_string();

        let meta = ResponseMeta::for_request(&request, &gateway);
        assert_eq!(meta.model, "qwen2");
        assert_eq!(meta.prompt_tokens, 2);
        assert!(!meta.include_usage);

        request.model = "llama3".to_string();
        gateway.streaming.include_usage = true;
        let meta = ResponseMeta::for_request(&request, &gateway);
        assert_eq!(meta.model, "llama3");
        assert!(meta.include_usage);
    }

    fn hello_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::RoleAnnounced {
                role: "assistant".to_string(),
            },
            StreamEvent::text("Hel"),
            StreamEvent::text("lo"),
            StreamEvent::finished(FinishReason::Stop),
        ]
    }

    #[test]
    fn test_negotiate_format() {
        assert_eq!(
            OutputFormat::negotiate("/v1/messages", None),
            OutputFormat::AnthropicSse
        );
        assert_eq!(
            OutputFormat::negotiate("/v1/responses/", None),
            OutputFormat::OpenResponsesSse
        );
        assert_eq!(
            OutputFormat::negotiate("/api/chat", None),
            OutputFormat::Ndjson
        );
        assert_eq!(
            OutputFormat::negotiate("/v1/chat/completions", Some("Application/X-NDJSON")),
            OutputFormat::Ndjson
        );
        assert_eq!(
            OutputFormat::negotiate("/v1/chat/completions", Some("text/event-stream")),
            OutputFormat::OpenAiSse
        );
        assert_eq!(OutputFormat::Ndjson.content_type(), "application/x-ndjson");
        assert_eq!(OutputFormat::AnthropicSse.content_type(), "text/event-stream");
    }

    #[tokio::test]
    async fn test_openai_pipeline_hello() {
        let channel = MemoryChannel::new();
        let handle = channel.clone();
        let pipeline = StreamPipeline::new(
            OutputFormat::OpenAiSse,
            ResponseMeta::new("llama-3").with_id("chatcmpl-1"),
            channel,
            &config(),
        );

        let stats = pipeline
            .run(futures::stream::iter(hello_events()))
            .await
            .unwrap();

        assert_eq!(stats.forwarded, 4);
        assert!(stats.upstream_terminated);
        let frames = handle.frames();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[4], DONE_FRAME);
        assert_eq!(handle.header("cache-control").as_deref(), Some("no-cache"));
        assert_eq!(handle.header("x-accel-buffering").as_deref(), Some("no"));
        assert!(handle.closed());
    }

    #[tokio::test]
    async fn test_events_after_terminal_ignored() {
        let channel = MemoryChannel::new();
        let handle = channel.clone();
        let pipeline = StreamPipeline::new(
            OutputFormat::Ndjson,
            ResponseMeta::new("llama3"),
            channel,
            &config(),
        );

        let mut events = hello_events();
        events.push(StreamEvent::text("late"));
        let stats = pipeline.run(futures::stream::iter(events)).await.unwrap();

        assert_eq!(stats.ignored, 1);
        assert!(!handle.body().contains("late"));
        assert_eq!(handle.body().lines().count(), 3);
    }

    #[tokio::test]
    async fn test_upstream_ended_without_terminal() {
        let channel = MemoryChannel::new();
        let handle = channel.clone();
        let pipeline = StreamPipeline::new(
            OutputFormat::AnthropicSse,
            ResponseMeta::new("claude-local"),
            channel,
            &config(),
        );

        let stats = pipeline
            .run(futures::stream::iter(vec![StreamEvent::text("partial")]))
            .await
            .unwrap();

        assert!(!stats.upstream_terminated);
        let body = handle.body();
        assert!(body.contains("event: error\n"));
        assert!(body.contains(UPSTREAM_ENDED_MESSAGE));
        assert!(handle.closed());
    }

    #[tokio::test]
    async fn test_usage_trailer_when_requested() {
        let channel = MemoryChannel::new();
        let handle = channel.clone();
        let pipeline = StreamPipeline::new(
            OutputFormat::OpenAiSse,
            ResponseMeta::new("m")
                .with_prompt_tokens(3)
                .with_include_usage(true),
            channel,
            &config(),
        );
        pipeline
            .run(futures::stream::iter(hello_events()))
            .await
            .unwrap();

        let frames = handle.frames();
        assert_eq!(frames.len(), 6);
        let usage: serde_json::Value = serde_json::from_str(
            frames[4]
                .strip_prefix("data: ")
                .unwrap()
                .trim_end(),
        )
        .unwrap();
        assert_eq!(usage["usage"]["prompt_tokens"], 3);
        assert_eq!(frames[5], DONE_FRAME);
    }

    #[tokio::test]
    async fn test_disconnect_stops_pipeline() {
        let channel = MemoryChannel::new();
        let mut client = channel.clone();
        client.close().await.unwrap();

        let pipeline = StreamPipeline::new(
            OutputFormat::OpenResponsesSse,
            ResponseMeta::new("m"),
            channel,
            &config(),
        );
        let err = pipeline
            .run(futures::stream::iter(hello_events()))
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }
}
