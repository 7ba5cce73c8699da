//! 服务器工具函数
//!
//! 将流处理管道接入 axum：在独立任务中运行管道，
//! 用写入器发出的唯一一次响应头构建 `Response`，响应体来自 mpsc 通道。

use crate::config::StreamingConfig;
use crate::stream::channel::{ChannelReceiver, MpscChannel};
use crate::stream::events::StreamEvent;
use crate::stream::pipeline::{OutputFormat, ResponseMeta, StreamPipeline};
use crate::translator::{TranslateError, TranslateErrorKind};
use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::Stream;

/// 在后台任务中运行管道并返回流式响应
///
/// 响应头在写入器写出第一帧（或关闭通道）时确定；
/// 管道在写出响应头之前失败时返回 500。
pub async fn spawn_streaming_response<S>(
    format: OutputFormat,
    meta: ResponseMeta,
    events: S,
    config: &StreamingConfig,
) -> Response
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let (channel, mut receiver) = MpscChannel::new(config.channel_buffer);
    let pipeline = StreamPipeline::new(format, meta, channel, config);

    tokio::spawn(async move {
        if let Err(e) = pipeline.run(events).await {
            tracing::debug!("[SERVER] 流式响应提前结束: {}", e);
        }
    });

    let headers = receiver.headers().await;
    build_stream_response(headers, receiver)
}

/// 用写入器的响应头与通道接收端构建响应
pub fn build_stream_response(
    headers: Option<Vec<(String, String)>>,
    receiver: ChannelReceiver,
) -> Response {
    let Some(headers) = headers else {
        tracing::error!("[SERVER] 管道在写出响应头之前结束");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "stream closed before headers were sent",
        );
    };

    let mut builder = Response::builder().status(StatusCode::OK);
    for (name, value) in &headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => tracing::warn!("[SERVER] 跳过无效的响应头: {}: {}", name, value),
        }
    }

    builder
        .body(Body::from_stream(receiver.into_body_stream()))
        .unwrap_or_else(|e| {
            tracing::error!("[SERVER] 构建流式响应失败: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap_or_default()
        })
}

/// OpenAI 风格的 JSON 错误响应
pub fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        })),
    )
        .into_response()
}

/// 请求转换失败对应的 400 响应
pub fn translate_error_response(error: &TranslateError) -> Response {
    let error_type = match error.kind {
        TranslateErrorKind::Decode => "invalid_json",
        _ => "invalid_request_error",
    };
    tracing::warn!("[SERVER] 请求转换失败: {}", error);
    let mut response = error_response(StatusCode::BAD_REQUEST, error_type, &error.message);
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::events::FinishReason;

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_streaming_response_openai() {
        let events = futures::stream::iter(vec![
            StreamEvent::RoleAnnounced {
                role: "assistant".to_string(),
            },
            StreamEvent::text("Hi"),
            StreamEvent::finished(FinishReason::Stop),
        ]);

        let response = spawn_streaming_response(
            OutputFormat::OpenAiSse,
            ResponseMeta::new("m"),
            events,
            &StreamingConfig::default(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");

        let body = body_text(response).await;
        assert_eq!(body.matches("data: ").count(), 4);
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_streaming_response_ndjson() {
        let events = futures::stream::iter(vec![
            StreamEvent::text("a"),
            StreamEvent::finished(FinishReason::Stop),
        ]);

        let response = spawn_streaming_response(
            OutputFormat::negotiate("/api/chat", None),
            ResponseMeta::new("llama3"),
            events,
            &StreamingConfig::default(),
        )
        .await;

        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );
        let body = body_text(response).await;
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"done\":true"));
    }

    #[tokio::test]
    async fn test_missing_headers_is_server_error() {
        let (channel, receiver) = MpscChannel::new(1);
        drop(channel);
        let response = build_stream_response(None, receiver);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_translate_error_response() {
        let err = TranslateError::missing_field("model");
        let response = translate_error_response(&err);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["message"], "Missing required field: model");
    }
}
