//! Ollama 风格 NDJSON 数据结构
//!
//! 每行一个 JSON 对象，`done` 标记最后一条记录。

use serde::Serialize;

/// NDJSON 聊天记录
#[derive(Debug, Serialize)]
pub struct OllamaChatRecord<'a> {
    pub model: &'a str,
    pub created_at: &'a str,
    pub message: OllamaMessage<'a>,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct OllamaMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OllamaToolCall<'a>>>,
}

#[derive(Debug, Serialize)]
pub struct OllamaToolCall<'a> {
    pub function: OllamaFunctionCall<'a>,
}

#[derive(Debug, Serialize)]
pub struct OllamaFunctionCall<'a> {
    pub name: &'a str,
    /// 完整参数对象；无法解析的片段保留为字符串
    pub arguments: serde_json::Value,
}

/// 错误记录
#[derive(Debug, Serialize)]
pub struct OllamaErrorRecord<'a> {
    pub model: &'a str,
    pub created_at: &'a str,
    pub error: OllamaError<'a>,
    pub done: bool,
}

#[derive(Debug, Serialize)]
pub struct OllamaError<'a> {
    pub message: &'a str,
    #[serde(rename = "type")]
    pub error_type: &'a str,
}
