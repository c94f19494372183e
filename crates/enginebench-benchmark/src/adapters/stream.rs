use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use enginebench_core::{Result, TokenEvent};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::http::map_reqwest_error;
use crate::adapter::TimingHints;

/// Splits a chunked body into trimmed, non-empty lines (NDJSON or SSE).
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

pub struct LineReader<S> {
    body: Pin<Box<S>>,
    buffer: LineBuffer,
    ready: VecDeque<String>,
    done: bool,
}

impl<S, B> LineReader<S>
where
    S: Stream<Item = reqwest::Result<B>>,
    B: AsRef<[u8]>,
{
    pub fn new(body: S) -> Self {
        Self {
            body: Box::pin(body),
            buffer: LineBuffer::default(),
            ready: VecDeque::new(),
            done: false,
        }
    }

    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.done {
                return Ok(None);
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.ready.extend(self.buffer.push(chunk.as_ref())),
                Some(Err(e)) => return Err(map_reqwest_error(e)),
                None => {
                    self.done = true;
                    self.ready.extend(self.buffer.finish());
                }
            }
        }
    }
}

/// Payload of an SSE `data:` line.
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Tracks token arrival for one streaming request and forwards each token.
pub struct StreamCapture {
    started: Instant,
    tokens: mpsc::Sender<TokenEvent>,
    first: Option<Duration>,
    last: Option<Duration>,
    text: String,
    events: usize,
    receiver_gone: bool,
}

impl StreamCapture {
    pub fn new(started: Instant, tokens: mpsc::Sender<TokenEvent>) -> Self {
        Self {
            started,
            tokens,
            first: None,
            last: None,
            text: String::new(),
            events: 0,
            receiver_gone: false,
        }
    }

    /// Stamp first, then forward; a slow receiver cannot move the stamp.
    pub async fn token(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }

        let elapsed = self.started.elapsed();
        self.first.get_or_insert(elapsed);
        self.last = Some(elapsed);
        self.text.push_str(text);
        self.events += 1;

        if self.receiver_gone {
            return;
        }
        if self.tokens.send(TokenEvent::new(text, elapsed)).await.is_err() {
            debug!("Token receiver dropped, continuing without forwarding");
            self.receiver_gone = true;
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timing(&self, request_id: String, model: &str, started_at: f64) -> TimingHints {
        TimingHints {
            request_id,
            model: model.to_string(),
            started_at,
            total_duration: self.started.elapsed().as_secs_f64(),
            first_token: self.first.map(|d| d.as_secs_f64()),
            last_token: self.last.map(|d| d.as_secs_f64()),
            token_events: self.events,
        }
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_line_buffer_handles_split_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\n\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(buf.push(b":2}\r\n"), vec!["{\"b\":2}"]);
        assert_eq!(buf.finish(), None);

        buf.push(b"data: [DONE]");
        assert_eq!(buf.finish().as_deref(), Some("data: [DONE]"));
    }

    #[tokio::test]
    async fn test_line_reader_yields_trailing_line() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> =
            vec![Ok(b"one\ntw".to_vec()), Ok(b"o\nthree".to_vec())];
        let mut reader = LineReader::new(stream::iter(chunks));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("three"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[test]
    fn test_sse_data() {
        assert_eq!(sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data(": keep-alive"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_stamps_and_forwards_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let started = Instant::now();
        let mut capture = StreamCapture::new(started, tx);

        tokio::time::advance(Duration::from_millis(120)).await;
        capture.token("Hel").await;
        capture.token("").await;
        tokio::time::advance(Duration::from_millis(30)).await;
        capture.token("lo").await;

        let timing = capture.timing("r".into(), "m", 0.0);
        assert_eq!(timing.token_events, 2);
        assert!((timing.first_token.unwrap() - 0.120).abs() < 1e-9);
        assert!((timing.last_token.unwrap() - 0.150).abs() < 1e-9);
        assert_eq!(capture.into_text(), "Hello");

        assert_eq!(rx.recv().await.unwrap().text, "Hel");
        assert_eq!(rx.recv().await.unwrap().text, "lo");
    }

    #[tokio::test]
    async fn test_capture_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut capture = StreamCapture::new(Instant::now(), tx);
        capture.token("a").await;
        capture.token("b").await;
        assert_eq!(capture.text(), "ab");
    }
}
