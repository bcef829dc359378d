//! Provider-agnostic decoding of streaming response bodies into event frames.
//!
//! Two framings cover every supported backend: `text/event-stream` with one JSON
//! object per `data:` line (OpenAI-family, Anthropic, Gemini, Bedrock) and bare
//! JSON lines (Ollama). The decoder only handles framing; interpreting a frame
//! is the owning adapter's job.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;

use crate::error::{ErrorKind, ErrorRecord};
use crate::http::HttpBodyStream;

/// Wire framing used by a provider's streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    /// `data:`-prefixed server-sent events with an optional `[DONE]` sentinel.
    Sse,
    /// One bare JSON object per line.
    JsonLines,
}

/// Standardized event yielded by [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload of one event, with framing stripped.
    Data(String),
    /// Terminal sentinel reported by the provider (`data: [DONE]`).
    Done,
}

/// Decodes a raw HTTP body stream into [`Frame`] values.
pub struct FrameDecoder {
    body: HttpBodyStream,
    framing: StreamFraming,
    buffer: Vec<u8>,
    data_lines: Vec<Vec<u8>>,
    pending: VecDeque<Result<Frame, ErrorRecord>>,
    provider: &'static str,
    stream_closed: bool,
    done_received: bool,
}

impl FrameDecoder {
    /// Wraps a raw HTTP body stream and prepares it for decoding.
    pub fn new(body: HttpBodyStream, framing: StreamFraming, provider: &'static str) -> Self {
        Self {
            body,
            framing,
            buffer: Vec::new(),
            data_lines: Vec::new(),
            pending: VecDeque::new(),
            provider,
            stream_closed: false,
            done_received: false,
        }
    }

    fn handle_line(&mut self, line: Vec<u8>) {
        match self.framing {
            StreamFraming::Sse => {
                if line.starts_with(b"data:") {
                    let mut data = line[5..].to_vec();
                    if data.first() == Some(&b' ') {
                        data.remove(0);
                    }
                    self.data_lines.push(data);
                }
                // event:/id:/retry: 行与注释行直接忽略
            }
            StreamFraming::JsonLines => {
                // JSON-lines 模式下每行即一个完整事件 由调用侧在行边界 flush
                if !line.is_empty() {
                    self.data_lines.push(line);
                }
            }
        }
    }

    fn flush_event(&mut self) -> Result<(), ErrorRecord> {
        if self.data_lines.is_empty() {
            return Ok(());
        }

        let mut joined = Vec::new();
        for (idx, mut segment) in self.data_lines.drain(..).enumerate() {
            if idx > 0 {
                joined.push(b'\n');
            }
            joined.append(&mut segment);
        }

        if joined.is_empty() {
            return Ok(());
        }

        let data = String::from_utf8(joined).map_err(|err| {
            ErrorRecord::new(
                ErrorKind::StreamingError,
                self.provider,
                format!("invalid UTF-8 in stream chunk: {err}"),
            )
        })?;

        if self.framing == StreamFraming::Sse && data.trim() == "[DONE]" {
            if !self.done_received {
                self.done_received = true;
                self.pending.push_back(Ok(Frame::Done));
            }
        } else {
            self.pending.push_back(Ok(Frame::Data(data)));
        }

        Ok(())
    }

    fn drain_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        buffer.iter().position(|b| *b == b'\n').map(|pos| {
            let mut line: Vec<u8> = buffer.drain(..=pos).collect();
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            line
        })
    }
}

impl Stream for FrameDecoder {
    type Item = Result<Frame, ErrorRecord>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(Some(event));
        }

        if this.done_received && this.pending.is_empty() {
            return Poll::Ready(None);
        }

        loop {
            if this.stream_closed {
                if !this.buffer.is_empty() {
                    let line = this.buffer.drain(..).collect::<Vec<u8>>();
                    this.handle_line(line);
                }
                if let Err(err) = this.flush_event() {
                    return Poll::Ready(Some(Err(err)));
                }
                return this
                    .pending
                    .pop_front()
                    .map_or(Poll::Ready(None), |event| Poll::Ready(Some(event)));
            }

            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(chunk_result)) => match chunk_result {
                    Ok(bytes) => {
                        this.buffer.extend_from_slice(&bytes);
                        while let Some(line) = Self::drain_line(&mut this.buffer) {
                            // SSE 以空行为事件边界 JSON-lines 每行即边界
                            let boundary =
                                line.is_empty() || this.framing == StreamFraming::JsonLines;
                            if !line.is_empty() {
                                this.handle_line(line);
                            }
                            if boundary {
                                if let Err(err) = this.flush_event() {
                                    return Poll::Ready(Some(Err(err)));
                                }
                                if let Some(event) = this.pending.pop_front() {
                                    return Poll::Ready(Some(event));
                                }
                            }
                        }
                        if let Some(event) = this.pending.pop_front() {
                            return Poll::Ready(Some(event));
                        }
                    }
                    Err(err) => return Poll::Ready(Some(Err(err))),
                },
                Poll::Ready(None) => {
                    this.stream_closed = true;
                    continue;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use futures_util::stream;

    use super::*;

    fn build_body(chunks: Vec<Result<Vec<u8>, ErrorRecord>>) -> HttpBodyStream {
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn sse_decoder_emits_data_and_done_frames() {
        let chunks = vec![
            Ok(b"data: {\"text\":\"hi\"}\n\n".to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let mut decoder = FrameDecoder::new(build_body(chunks), StreamFraming::Sse, "test_provider");

        let first = decoder.next().await.expect("frame").expect("ok");
        assert_eq!(first, Frame::Data("{\"text\":\"hi\"}".to_string()));

        let second = decoder.next().await.expect("frame").expect("ok");
        assert_eq!(second, Frame::Done);

        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn sse_decoder_combines_multiline_payloads() {
        let chunks = vec![
            Ok(b"data: line one\n".to_vec()),
            Ok(b"data: line two\n\n".to_vec()),
        ];
        let mut decoder = FrameDecoder::new(build_body(chunks), StreamFraming::Sse, "test_provider");
        let frame = decoder.next().await.expect("frame").expect("ok");
        assert_eq!(frame, Frame::Data("line one\nline two".to_string()));
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn sse_decoder_ignores_event_and_comment_lines() {
        let chunks = vec![Ok(
            b": keepalive\nevent: message_start\ndata: {\"a\":1}\n\n".to_vec()
        )];
        let mut decoder = FrameDecoder::new(build_body(chunks), StreamFraming::Sse, "test_provider");
        let frame = decoder.next().await.expect("frame").expect("ok");
        assert_eq!(frame, Frame::Data("{\"a\":1}".to_string()));
    }

    #[tokio::test]
    async fn sse_decoder_handles_frames_split_across_chunks() {
        let chunks = vec![
            Ok(b"data: {\"te".to_vec()),
            Ok(b"xt\":\"hi\"}\n".to_vec()),
            Ok(b"\n".to_vec()),
        ];
        let mut decoder = FrameDecoder::new(build_body(chunks), StreamFraming::Sse, "test_provider");
        let frame = decoder.next().await.expect("frame").expect("ok");
        assert_eq!(frame, Frame::Data("{\"text\":\"hi\"}".to_string()));
    }

    #[tokio::test]
    async fn json_lines_decoder_emits_one_frame_per_line() {
        let chunks = vec![Ok(b"{\"done\":false}\n{\"done\":true}\n".to_vec())];
        let mut decoder =
            FrameDecoder::new(build_body(chunks), StreamFraming::JsonLines, "ollama");

        let first = decoder.next().await.expect("frame").expect("ok");
        assert_eq!(first, Frame::Data("{\"done\":false}".to_string()));
        let second = decoder.next().await.expect("frame").expect("ok");
        assert_eq!(second, Frame::Data("{\"done\":true}".to_string()));
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn json_lines_decoder_flushes_trailing_line_without_newline() {
        let chunks = vec![Ok(b"{\"done\":true}".to_vec())];
        let mut decoder =
            FrameDecoder::new(build_body(chunks), StreamFraming::JsonLines, "ollama");
        let frame = decoder.next().await.expect("frame").expect("ok");
        assert_eq!(frame, Frame::Data("{\"done\":true}".to_string()));
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn decoder_reports_utf8_errors_as_streaming_kind() {
        let chunks = vec![Ok(b"data: \xff\n\n".to_vec())];
        let mut decoder = FrameDecoder::new(build_body(chunks), StreamFraming::Sse, "test_provider");
        let err = decoder.next().await.expect("frame").unwrap_err();
        assert_eq!(err.kind, ErrorKind::StreamingError);
        assert_eq!(err.provider, "test_provider");
    }
}
