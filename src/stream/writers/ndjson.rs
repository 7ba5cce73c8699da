//! NDJSON 写入器（Ollama 兼容）
//!
//! 每个事件一行 JSON，内容行 `done: false`，最后一行 `done: true`。
//! 没有终止标记，连接关闭即表示结束。

use super::{escape_json_string, FrameSink, ProtocolWriter, CONTENT_TYPE_NDJSON};
use crate::error::Result;
use crate::models::ollama::{
    OllamaChatRecord, OllamaError, OllamaErrorRecord, OllamaFunctionCall, OllamaMessage,
    OllamaToolCall,
};
use crate::stream::channel::OutputChannel;
use crate::stream::events::{estimate_tokens, FinishReason};
use async_trait::async_trait;
use chrono::SecondsFormat;
use std::collections::BTreeMap;

/// 缓冲中的工具调用
#[derive(Debug, Default)]
struct PendingToolCall {
    name: String,
    arguments: String,
}

/// NDJSON 写入器
#[derive(Debug)]
pub struct NdjsonWriter<C> {
    sink: FrameSink<C>,
    model: String,
    /// 按 index 缓冲的工具调用，结束前一次性输出
    tool_calls: BTreeMap<usize, PendingToolCall>,
    eval_count: u32,
}

impl<C: OutputChannel> NdjsonWriter<C> {
    pub fn new(channel: C, model: impl Into<String>) -> Self {
        Self {
            sink: FrameSink::new(channel, CONTENT_TYPE_NDJSON, Vec::new()),
            model: model.into(),
            tool_calls: BTreeMap::new(),
            eval_count: 0,
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.sink.set_extra_headers(headers);
        self
    }

    pub fn channel(&self) -> &C {
        self.sink.channel()
    }

    pub fn eval_count(&self) -> u32 {
        self.eval_count
    }

    fn created_at() -> String {
        chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// 统一的行写入：内容行与结束行只差 `done` 标记
    async fn write_line(
        &mut self,
        content: &str,
        tool_calls: Option<Vec<OllamaToolCall<'_>>>,
        done: bool,
        done_reason: Option<&str>,
    ) -> Result<()> {
        let created_at = Self::created_at();
        let record = OllamaChatRecord {
            model: &self.model,
            created_at: &created_at,
            message: OllamaMessage {
                role: "assistant",
                content,
                tool_calls,
            },
            done,
            done_reason,
            eval_count: done.then_some(self.eval_count),
        };

        match serde_json::to_string(&record) {
            Ok(json) => self.sink.send(format!("{json}\n")).await,
            Err(e) => {
                tracing::error!("[NDJSON] 记录序列化失败，关闭连接: {}", e);
                self.sink.abort().await;
                Err(e.into())
            }
        }
    }

    /// 角色与内容在同一条记录中，无需单独声明
    pub async fn announce_role(&mut self, _role: &str) -> Result<()> {
        Ok(())
    }

    pub async fn append_text(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.eval_count += estimate_tokens(text);
        self.write_line(text, None, false, None).await
    }

    /// 登记工具调用；参数在结束前整体输出
    pub async fn start_tool_call(&mut self, name: &str, index: usize) -> Result<()> {
        self.tool_calls.insert(
            index,
            PendingToolCall {
                name: name.to_string(),
                arguments: String::new(),
            },
        );
        Ok(())
    }

    pub async fn append_tool_arguments(&mut self, index: usize, partial_json: &str) -> Result<()> {
        if partial_json.is_empty() {
            return Ok(());
        }
        match self.tool_calls.get_mut(&index) {
            Some(call) => {
                call.arguments.push_str(partial_json);
                self.eval_count += estimate_tokens(partial_json);
            }
            None => {
                tracing::warn!("[NDJSON] 未知的工具调用序号 {}，丢弃参数增量", index);
            }
        }
        Ok(())
    }

    /// 输出缓冲的工具调用（如有），再写结束行
    pub async fn finish(&mut self, reason: &FinishReason) -> Result<()> {
        let pending = std::mem::take(&mut self.tool_calls);
        if !pending.is_empty() {
            let calls = pending
                .values()
                .map(|call| OllamaToolCall {
                    function: OllamaFunctionCall {
                        name: &call.name,
                        arguments: parse_arguments(&call.arguments),
                    },
                })
                .collect();
            self.write_line("", Some(calls), false, None).await?;
        }
        self.write_line("", None, true, Some(reason.to_ollama_str()))
            .await
    }

    pub async fn error(&mut self, message: &str) -> Result<()> {
        let created_at = Self::created_at();
        let record = OllamaErrorRecord {
            model: &self.model,
            created_at: &created_at,
            error: OllamaError {
                message,
                error_type: "server_error",
            },
            done: true,
        };
        let json = serde_json::to_string(&record).unwrap_or_else(|e| {
            tracing::warn!("[NDJSON] 错误记录序列化失败，使用兜底 JSON: {}", e);
            format!(
                r#"{{"error":{{"message":"{}","type":"server_error"}},"done":true}}"#,
                escape_json_string(message)
            )
        });
        self.sink.send(format!("{json}\n")).await
    }

    /// NDJSON 没有注释行，心跳不写任何内容
    pub async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    pub async fn end(&mut self) -> Result<()> {
        self.sink.close().await
    }
}

/// 解析累积的参数文本；无法解析时保留原始字符串
fn parse_arguments(arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| {
        tracing::debug!("[NDJSON] 工具参数不是合法 JSON，按字符串输出");
        serde_json::Value::String(arguments.to_string())
    })
}

#[async_trait]
impl<C: OutputChannel> ProtocolWriter for NdjsonWriter<C> {
    async fn announce_role(&mut self, role: &str) -> Result<()> {
        NdjsonWriter::announce_role(self, role).await
    }

    async fn append_text(&mut self, text: &str) -> Result<()> {
        NdjsonWriter::append_text(self, text).await
    }

    async fn start_tool_call(&mut self, _call_id: &str, name: &str, index: usize) -> Result<()> {
        NdjsonWriter::start_tool_call(self, name, index).await
    }

    async fn append_tool_arguments(
        &mut self,
        _call_id: &str,
        index: usize,
        partial_json: &str,
    ) -> Result<()> {
        NdjsonWriter::append_tool_arguments(self, index, partial_json).await
    }

    async fn finish(&mut self, reason: &FinishReason) -> Result<()> {
        NdjsonWriter::finish(self, reason).await
    }

    async fn error(&mut self, message: &str) -> Result<()> {
        NdjsonWriter::error(self, message).await
    }

    async fn ping(&mut self) -> Result<()> {
        NdjsonWriter::ping(self).await
    }

    async fn end(&mut self) -> Result<()> {
        NdjsonWriter::end(self).await
    }
}
