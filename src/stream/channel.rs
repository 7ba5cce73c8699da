//! 输出通道抽象
//!
//! 由传输层提供的最小写入能力：写响应头、写字节、flush、关闭。
//! 网关本身不创建 socket，也不做缓冲/背压策略。
//!
//! - `MemoryChannel`: 内存记录通道，可克隆句柄用于观察写入结果
//! - `MpscChannel`: 通过有界 mpsc 与 HTTP 响应体衔接

use crate::error::ChannelError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 输出通道
#[async_trait]
pub trait OutputChannel: Send {
    /// 写入响应头（每个流只能调用一次，且必须早于任何响应体字节）
    async fn write_headers(&mut self, headers: &[(String, String)]) -> Result<(), ChannelError>;

    /// 写入响应体字节
    async fn write_bytes(&mut self, bytes: Bytes) -> Result<(), ChannelError>;

    /// 将已写入的数据推送给客户端
    async fn flush(&mut self) -> Result<(), ChannelError>;

    /// 关闭通道；在此之前的写入全部被传输层接收后才返回
    async fn close(&mut self) -> Result<(), ChannelError>;

    /// 通道是否已关闭
    fn is_closed(&self) -> bool;
}

// ============================================================================
// 内存通道
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    headers: Option<Vec<(String, String)>>,
    frames: Vec<Bytes>,
    flush_count: usize,
    closed: bool,
}

/// 内存记录通道
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已写入的响应头
    pub fn headers(&self) -> Option<Vec<(String, String)>> {
        self.state.lock().headers.clone()
    }

    /// 按名称查找响应头（不区分大小写）
    pub fn header(&self, name: &str) -> Option<String> {
        self.state.lock().headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        })
    }

    /// 每次 write_bytes 写入的帧
    pub fn frames(&self) -> Vec<String> {
        self.state
            .lock()
            .frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    /// 拼接后的响应体
    pub fn body(&self) -> String {
        self.frames().concat()
    }

    /// 响应体字节数
    pub fn body_len(&self) -> usize {
        self.state.lock().frames.iter().map(Bytes::len).sum()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flush_count
    }

    pub fn closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl OutputChannel for MemoryChannel {
    async fn write_headers(&mut self, headers: &[(String, String)]) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.headers.is_some() {
            return Err(ChannelError::HeadersAlreadySent);
        }
        state.headers = Some(headers.to_vec());
        Ok(())
    }

    async fn write_bytes(&mut self, bytes: Bytes) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.frames.push(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.flush_count += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ============================================================================
// mpsc 通道
// ============================================================================

/// 通道消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Headers(Vec<(String, String)>),
    Data(Bytes),
}

/// 基于 tokio mpsc 的输出通道
#[derive(Debug)]
pub struct MpscChannel {
    sender: Option<mpsc::Sender<ChannelMessage>>,
    headers_sent: bool,
}

/// `MpscChannel` 的接收端，由传输层持有
#[derive(Debug)]
pub struct ChannelReceiver {
    receiver: mpsc::Receiver<ChannelMessage>,
}

impl MpscChannel {
    /// 创建通道对
    pub fn new(buffer: usize) -> (Self, ChannelReceiver) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                sender: Some(tx),
                headers_sent: false,
            },
            ChannelReceiver { receiver: rx },
        )
    }

    async fn send(&mut self, message: ChannelMessage) -> Result<(), ChannelError> {
        let sender = self.sender.as_ref().ok_or(ChannelError::Closed)?;
        if sender.send(message).await.is_err() {
            // 接收端已丢弃，视为客户端断开
            self.sender = None;
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl OutputChannel for MpscChannel {
    async fn write_headers(&mut self, headers: &[(String, String)]) -> Result<(), ChannelError> {
        if self.headers_sent {
            return Err(ChannelError::HeadersAlreadySent);
        }
        self.send(ChannelMessage::Headers(headers.to_vec())).await?;
        self.headers_sent = true;
        Ok(())
    }

    async fn write_bytes(&mut self, bytes: Bytes) -> Result<(), ChannelError> {
        self.send(ChannelMessage::Data(bytes)).await
    }

    async fn flush(&mut self) -> Result<(), ChannelError> {
        // send 返回即表示数据已交给接收端
        if self.sender.is_none() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        // 之前的 send 都已 await 完成，直接释放发送端即可
        self.sender = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.sender.as_ref().map(|s| s.is_closed()).unwrap_or(true)
    }
}

impl ChannelReceiver {
    /// 接收下一条消息
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.receiver.recv().await
    }

    /// 等待响应头；若通道在写头之前关闭则返回 None
    pub async fn headers(&mut self) -> Option<Vec<(String, String)>> {
        match self.receiver.recv().await? {
            ChannelMessage::Headers(headers) => Some(headers),
            ChannelMessage::Data(_) => {
                tracing::warn!("[CHANNEL] 收到响应体早于响应头，丢弃");
                None
            }
        }
    }

    /// 转换为响应体字节流（跳过多余的响应头消息）
    pub fn into_body_stream(
        mut self,
    ) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        async_stream::stream! {
            while let Some(message) = self.receiver.recv().await {
                if let ChannelMessage::Data(bytes) = message {
                    yield Ok(bytes);
                }
            }
        }
    }
}
