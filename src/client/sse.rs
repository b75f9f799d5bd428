//! Incremental server-sent-events frame decoder shared by the HTTP backends.

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::errors::ClientError;

/// One complete SSE event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// The OpenAI-style end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Buffers raw body bytes and yields frames as blank-line terminators arrive.
///
/// Bytes are kept undecoded until a frame is complete, so a multi-byte UTF-8
/// character split across network chunks is reassembled intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((end, sep_len)) = find_frame_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + sep_len).collect();
            let text = String::from_utf8_lossy(&raw[..end]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame the server closed without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let raw = std::mem::take(&mut self.buffer);
        parse_frame(&String::from_utf8_lossy(&raw))
    }
}

/// What the frame handler wants the read loop to do next.
pub(crate) enum FrameAction {
    Continue,
    Done,
}

/// Read an SSE response body to completion, handing each frame to `on_frame`.
///
/// Cancellation is observed between network reads, so a stalled stream still
/// stops promptly.
pub(crate) async fn drive(
    response: reqwest::Response,
    cancel: &CancellationToken,
    mut on_frame: impl FnMut(SseFrame) -> Result<FrameAction, ClientError> + Send,
) -> Result<(), ClientError> {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            next = body.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;
        for frame in decoder.push(&chunk) {
            if let FrameAction::Done = on_frame(frame)? {
                return Ok(());
            }
        }
    }
    if let Some(frame) = decoder.finish() {
        on_frame(frame)?;
    }
    Ok(())
}

fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut has_data = false;
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    frame.data.push('\n');
                }
                frame.data.push_str(value);
                has_data = true;
            }
            _ => {}
        }
    }
    has_data.then_some(frame)
}
