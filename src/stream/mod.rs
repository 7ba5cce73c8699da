//! 流式处理层
//!
//! 推理引擎输出的统一事件流，经协议写入器编码为客户端期望的线格式。
//!
//! # 架构设计
//!
//! ```text
//! 推理引擎 ──> StreamEvent ──> [StreamPipeline] ──> [ProtocolWriter] ──> OutputChannel
//!
//! 例如：
//! StreamEvent ──> [OpenAiSseWriter]      ──> data: {...}\n\n ... data: [DONE]
//! StreamEvent ──> [NdjsonWriter]         ──> {...}\n ... {"done":true}\n
//! StreamEvent ──> [AnthropicSseWriter]   ──> event: message_start ... event: message_stop
//! StreamEvent ──> [OpenResponsesWriter]  ──> event: response.created ... data: [DONE]
//! ```
//!
//! # 模块结构
//!
//! - `events`: 统一的流事件类型定义 (`StreamEvent`)
//! - `channel`: 输出通道抽象与实现
//! - `writers`: 各协议写入器
//! - `pipeline`: 格式协商与事件转发

pub mod channel;
pub mod events;
pub mod pipeline;
pub mod writers;

// 重新导出核心类型
pub use channel::{ChannelMessage, ChannelReceiver, MemoryChannel, MpscChannel, OutputChannel};
pub use events::{estimate_tokens, FinishReason, StreamEvent};
pub use pipeline::{OutputFormat, PipelineStats, ResponseMeta, StreamPipeline};
pub use writers::{
    AnthropicSseWriter, NdjsonWriter, OpenAiSseWriter, OpenResponsesWriter, ProtocolWriter,
};
