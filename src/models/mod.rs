//! 线格式与请求数据模型
//!
//! - `openai`: 规范请求 + OpenAI SSE 块
//! - `ollama`: NDJSON 记录
//! - `anthropic`: Anthropic 请求 + SSE 事件
//! - `open_responses`: Open Responses 语义事件
//! - `json_value`: 类型擦除的 JSON 值

pub mod anthropic;
pub mod json_value;
pub mod ollama;
pub mod open_responses;
pub mod openai;

pub use json_value::AnyValue;
