//! Streaming engine: one instance per in-flight streaming call.
//!
//! The engine owns the frame decoder and the producing half of the per-call
//! channel. Frames flow through the adapter's chunk transformer in arrival
//! order; metadata frames are dropped, failures are converted to a terminal
//! in-band error item, and the channel closing is the end-of-stream sentinel.
//! The consumer dropping its [`DeltaStream`] is the cancellation signal: the
//! engine observes it on its next poll and releases the underlying connection.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::ProviderAdapter;
use crate::error::ErrorRecord;
use crate::http::HttpBodyStream;
use crate::sse::{Frame, FrameDecoder};
use crate::types::StreamItem;

/// Bounded capacity of the per-call delta channel.
pub(crate) const DELTA_CHANNEL_CAPACITY: usize = 32;

/// Consuming half of a streaming call.
///
/// Items arrive in provider emission order. Dropping the stream cancels the
/// underlying call.
///
/// # Examples
///
/// ```no_run
/// # use tsumugi::types::StreamItem;
/// # async fn consume(mut stream: tsumugi::engine::DeltaStream) {
/// while let Some(item) = stream.recv().await {
///     match item {
///         StreamItem::Delta(delta) => {
///             if let Some(text) = &delta.content {
///                 print!("{text}");
///             }
///         }
///         StreamItem::Error(record) => eprintln!("stream failed: {record}"),
///     }
/// }
/// # }
/// ```
pub struct DeltaStream {
    receiver: mpsc::Receiver<StreamItem>,
}

impl std::fmt::Debug for DeltaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaStream").finish_non_exhaustive()
    }
}

impl DeltaStream {
    pub(crate) fn new(receiver: mpsc::Receiver<StreamItem>) -> Self {
        Self { receiver }
    }

    /// Receives the next item; `None` means the stream reached its terminal state.
    pub async fn recv(&mut self) -> Option<StreamItem> {
        self.receiver.recv().await
    }

    /// Explicitly cancels the call without dropping the handle.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl Stream for DeltaStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Lifecycle states of one streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Open,
    Receiving,
    Closed,
    Errored,
    Cancelled,
}

/// Drives one provider byte stream to its terminal state.
pub(crate) struct StreamEngine {
    adapter: &'static dyn ProviderAdapter,
    decoder: FrameDecoder,
    sender: mpsc::Sender<StreamItem>,
    state: EngineState,
}

impl StreamEngine {
    pub(crate) fn new(
        adapter: &'static dyn ProviderAdapter,
        body: HttpBodyStream,
        sender: mpsc::Sender<StreamItem>,
    ) -> Self {
        Self {
            decoder: FrameDecoder::new(body, adapter.framing(), adapter.name()),
            adapter,
            sender,
            state: EngineState::Open,
        }
    }

    /// Runs the stream to completion; consumes the engine.
    ///
    /// Every exit path leaves the channel closed: the sender is dropped here and
    /// the receiver sees end-of-stream after the final item.
    pub(crate) async fn run(mut self) {
        self.state = EngineState::Receiving;

        loop {
            tokio::select! {
                // 消费端关闭即取消 优先于继续读帧
                biased;
                _ = self.sender.closed() => {
                    self.state = EngineState::Cancelled;
                    break;
                }
                frame = self.decoder.next() => match frame {
                    Some(Ok(Frame::Data(data))) => match self.adapter.transform_chunk(&data) {
                        Ok(Some(delta)) => {
                            if self.sender.send(StreamItem::Delta(delta)).await.is_err() {
                                self.state = EngineState::Cancelled;
                                break;
                            }
                        }
                        // 纯元数据帧静默丢弃 不影响顺序
                        Ok(None) => {}
                        Err(record) => {
                            self.fail(record).await;
                            break;
                        }
                    },
                    Some(Ok(Frame::Done)) => {
                        self.state = EngineState::Closed;
                        break;
                    }
                    Some(Err(record)) => {
                        self.fail(record.for_provider(self.adapter.name())).await;
                        break;
                    }
                    None => {
                        self.state = EngineState::Closed;
                        break;
                    }
                }
            }
        }

        debug!(
            provider = self.adapter.name(),
            state = ?self.state,
            "stream terminated"
        );
        // drop(self) 关闭 sender 并释放底层连接
    }

    /// 错误永远以带内 error 项送达 不跨通道抛异常
    async fn fail(&mut self, record: ErrorRecord) {
        let _ = self.sender.send(StreamItem::Error(record)).await;
        self.state = EngineState::Errored;
    }
}

/// Drains an error body from a streaming response that failed before producing
/// any events.
pub(crate) async fn collect_stream_text(
    mut body: HttpBodyStream,
    provider: &'static str,
) -> Result<String, ErrorRecord> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk.map_err(|record| record.for_provider(provider))?);
    }
    String::from_utf8(bytes).map_err(|err| {
        ErrorRecord::invalid_response(provider, format!("failed to decode error body: {err}"))
    })
}
