//! Open Responses 语义事件
//!
//! 事件以点分名称区分（`response.output_text.delta` 等），每个事件在发出时
//! 由写入器附加严格递增的 `sequence_number`。

use serde::Serialize;

pub const RESPONSE_CREATED: &str = "response.created";
pub const RESPONSE_COMPLETED: &str = "response.completed";
pub const RESPONSE_FAILED: &str = "response.failed";
pub const OUTPUT_ITEM_ADDED: &str = "response.output_item.added";
pub const OUTPUT_ITEM_DONE: &str = "response.output_item.done";
pub const OUTPUT_TEXT_DELTA: &str = "response.output_text.delta";
pub const OUTPUT_TEXT_DONE: &str = "response.output_text.done";
pub const FUNCTION_CALL_ARGUMENTS_DELTA: &str = "response.function_call_arguments.delta";
pub const FUNCTION_CALL_ARGUMENTS_DONE: &str = "response.function_call_arguments.done";

/// Open Responses 事件
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OpenResponsesEvent<'a> {
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseObject<'a> },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { output_index: u32, item: OutputItem },

    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        item_id: &'a str,
        output_index: u32,
        content_index: u32,
        delta: &'a str,
    },

    #[serde(rename = "response.output_text.done")]
    OutputTextDone {
        item_id: &'a str,
        output_index: u32,
        content_index: u32,
        text: &'a str,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        item_id: &'a str,
        output_index: u32,
        delta: &'a str,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        item_id: &'a str,
        output_index: u32,
        arguments: &'a str,
    },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone { output_index: u32, item: OutputItem },

    #[serde(rename = "response.completed")]
    ResponseCompleted { response: ResponseObject<'a> },

    #[serde(rename = "response.failed")]
    ResponseFailed { response: ResponseObject<'a> },
}

impl OpenResponsesEvent<'_> {
    /// SSE `event:` 名称
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ResponseCreated { .. } => RESPONSE_CREATED,
            Self::OutputItemAdded { .. } => OUTPUT_ITEM_ADDED,
            Self::OutputTextDelta { .. } => OUTPUT_TEXT_DELTA,
            Self::OutputTextDone { .. } => OUTPUT_TEXT_DONE,
            Self::FunctionCallArgumentsDelta { .. } => FUNCTION_CALL_ARGUMENTS_DELTA,
            Self::FunctionCallArgumentsDone { .. } => FUNCTION_CALL_ARGUMENTS_DONE,
            Self::OutputItemDone { .. } => OUTPUT_ITEM_DONE,
            Self::ResponseCompleted { .. } => RESPONSE_COMPLETED,
            Self::ResponseFailed { .. } => RESPONSE_FAILED,
        }
    }
}

/// 带序号的事件（线上实际发送的形状）
#[derive(Debug, Serialize)]
pub struct SequencedEvent<'a> {
    #[serde(flatten)]
    pub event: &'a OpenResponsesEvent<'a>,
    pub sequence_number: u64,
}

/// response 对象
#[derive(Debug, Serialize)]
pub struct ResponseObject<'a> {
    pub id: &'a str,
    pub object: &'a str,
    pub created_at: i64,
    pub model: &'a str,
    pub status: &'a str,
    pub output: &'a [OutputItem],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponseUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError<'a>>,
}

/// 输出项
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        id: String,
        role: String,
        status: String,
        content: Vec<OutputContent>,
    },
    FunctionCall {
        id: String,
        call_id: String,
        name: String,
        arguments: String,
        status: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputContent {
    OutputText {
        text: String,
        annotations: Vec<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResponseUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct ResponseError<'a> {
    pub code: &'a str,
    pub message: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequenced_event_flattens() {
        let event = OpenResponsesEvent::OutputTextDelta {
            item_id: "msg_1",
            output_index: 0,
            content_index: 0,
            delta: "Hi",
        };
        let json = serde_json::to_value(SequencedEvent {
            event: &event,
            sequence_number: 3,
        })
        .unwrap();

        assert_eq!(json["type"], "response.output_text.delta");
        assert_eq!(json["sequence_number"], 3);
        assert_eq!(json["delta"], "Hi");
        assert_eq!(event.event_name(), OUTPUT_TEXT_DELTA);
    }

    #[test]
    fn test_output_item_shapes() {
        let item = OutputItem::FunctionCall {
            id: "fc_1".to_string(),
            call_id: "call_1".to_string(),
            name: "search".to_string(),
            arguments: "{}".to_string(),
            status: "completed".to_string(),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "function_call");
        assert_eq!(json["call_id"], "call_1");
    }
}
