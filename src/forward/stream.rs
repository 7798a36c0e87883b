//! Streaming response handling
//!
//! Two modes over one line scanner: SSE passthrough to the client, and
//! collection into a single JSON response for providers whose only real mode
//! is streaming. The pipeline is producer/consumer with a bounded channel:
//! the producer reads upstream bytes into lines, the consumer multiplexes
//! lines against an idle-timeout ticker, forwards events, and accounts
//! usage. At most one `event: error` is emitted per request, and after a
//! client disconnect the loop drains usage-bearing chunks best-effort.

use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{GatewayError, GatewayResult};
use crate::transform::antigravity::unwrap_response_envelope;
use crate::upstream::AttemptResponse;

use super::usage::{extract_usage, Usage};

/// Bound on the producer->consumer line channel.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// How long the drain loop keeps reading after the client went away.
const DISCONNECT_DRAIN_LIMIT: Duration = Duration::from_secs(3);

/// Single-shot client-visible stream failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    ResponseTooLarge,
    WriteFailed,
    StreamReadError,
    StreamTimeout,
}

impl StreamErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            StreamErrorKind::ResponseTooLarge => "response_too_large",
            StreamErrorKind::WriteFailed => "write_failed",
            StreamErrorKind::StreamReadError => "stream_read_error",
            StreamErrorKind::StreamTimeout => "stream_timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub max_line_size: usize,
    /// None disables the idle ticker.
    pub idle_timeout: Option<Duration>,
    /// Unwrap the v1internal `{response: {...}}` envelope per data event.
    pub unwrap_envelope: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        let cfg = crate::config::load();
        let idle = cfg.gateway.stream_data_interval_timeout;
        Self {
            max_line_size: cfg.gateway.max_line_size,
            idle_timeout: (idle > 0).then(|| Duration::from_secs(idle)),
            unwrap_envelope: false,
        }
    }
}

/// Final accounting handed back after the stream closes.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub first_token_ms: Option<u64>,
    pub error: Option<&'static str>,
}

// ============================================================================
// Line scanning
// ============================================================================

/// Splits a byte stream into lines with a hard per-line cap.
pub struct SseLineScanner {
    buffer: Vec<u8>,
    max_line_size: usize,
    overflowed: bool,
}

impl SseLineScanner {
    pub fn new(max_line_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(8 * 1024),
            max_line_size,
            overflowed: false,
        }
    }

    /// Feed a chunk; returns completed lines. `Err` means a single line
    /// exceeded the cap and the stream must be aborted.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ()> {
        if self.overflowed {
            return Err(());
        }
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let mut line = self.buffer.drain(..=pos).collect::<Vec<u8>>();
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.max_line_size {
                self.overflowed = true;
                return Err(());
            }
            lines.push(String::from_utf8_lossy(&line).to_string());
        }

        if self.buffer.len() > self.max_line_size {
            self.overflowed = true;
            return Err(());
        }
        Ok(lines)
    }
}

/// `data:` payload of an SSE line, if it is one.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:")
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

// ============================================================================
// Producer
// ============================================================================

enum LineEvent {
    Line(String),
    Oversize,
    ReadError(String),
    End,
}

fn spawn_producer(
    mut response: AttemptResponse,
    max_line_size: usize,
) -> mpsc::Receiver<LineEvent> {
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut scanner = SseLineScanner::new(max_line_size);
        while let Some(chunk) = response.body.next().await {
            match chunk {
                Ok(bytes) => match scanner.push(&bytes) {
                    Ok(lines) => {
                        for line in lines {
                            if tx.send(LineEvent::Line(line)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(()) => {
                        let _ = tx.send(LineEvent::Oversize).await;
                        return;
                    }
                },
                Err(e) => {
                    let _ = tx.send(LineEvent::ReadError(e.to_string())).await;
                    return;
                }
            }
        }
        let _ = tx.send(LineEvent::End).await;
    });
    rx
}

// ============================================================================
// Passthrough
// ============================================================================

fn error_event(kind: StreamErrorKind) -> Bytes {
    let payload = serde_json::json!({
        "type": "error",
        "error": {"type": kind.as_str(), "message": format!("stream aborted: {}", kind.as_str())}
    });
    Bytes::from(format!("event: error\ndata: {}\n\n", payload))
}

struct PassthroughState {
    usage: Usage,
    first_token_ms: Option<u64>,
    error_sent: bool,
    error_kind: Option<&'static str>,
    client_gone: bool,
    started: Instant,
}

impl PassthroughState {
    fn observe_data(&mut self, payload: &Value) {
        if let Some(parsed) = extract_usage(payload) {
            self.usage.merge(&parsed);
        }
    }

    fn record_first_token(&mut self) {
        if self.first_token_ms.is_none() {
            self.first_token_ms = Some(self.started.elapsed().as_millis() as u64);
        }
    }
}

async fn forward(
    out: &mpsc::Sender<Result<Bytes, std::io::Error>>,
    state: &mut PassthroughState,
    bytes: Bytes,
) {
    if state.client_gone {
        return;
    }
    if out.send(Ok(bytes)).await.is_err() {
        state.client_gone = true;
        if state.error_kind.is_none() {
            state.error_kind = Some(StreamErrorKind::WriteFailed.as_str());
        }
        crate::logger::debug("stream", "Client disconnected; draining for usage");
    }
}

async fn emit_error_once(
    out: &mpsc::Sender<Result<Bytes, std::io::Error>>,
    state: &mut PassthroughState,
    kind: StreamErrorKind,
) {
    state.error_kind.get_or_insert(kind.as_str());
    if state.error_sent || state.client_gone {
        return;
    }
    state.error_sent = true;
    let _ = out.send(Ok(error_event(kind))).await;
}

/// Stream upstream SSE to the client, accounting usage along the way. The
/// returned receiver resolves with the final [`StreamOutcome`] once the
/// upstream side closes.
pub fn sse_passthrough(
    response: AttemptResponse,
    options: StreamOptions,
    started: Instant,
) -> (Response, oneshot::Receiver<StreamOutcome>) {
    let (out_tx, out_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(LINE_CHANNEL_CAPACITY);
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let mut lines = spawn_producer(response, options.max_line_size);

    tokio::spawn(async move {
        let mut state = PassthroughState {
            usage: Usage::default(),
            first_token_ms: None,
            error_sent: false,
            error_kind: None,
            client_gone: false,
            started,
        };
        let mut last_read = Instant::now();
        let mut ticker = tokio::time::interval(
            options
                .idle_timeout
                .map(|t| t.max(Duration::from_millis(250)))
                .unwrap_or(Duration::from_secs(3600)),
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset();
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            if state.client_gone && drain_deadline.is_none() {
                drain_deadline = Some(tokio::time::Instant::now() + DISCONNECT_DRAIN_LIMIT);
            }

            tokio::select! {
                _ = async {
                    match drain_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => break,
                event = lines.recv() => {
                    last_read = Instant::now();
                    match event {
                        Some(LineEvent::Line(line)) => {
                            if let Some(data) = parse_sse_data(&line) {
                                if is_sse_done(data) {
                                    forward(&out_tx, &mut state, Bytes::from("data: [DONE]\n\n")).await;
                                    continue;
                                }
                                match serde_json::from_str::<Value>(data) {
                                    Ok(parsed) => {
                                        let payload = if options.unwrap_envelope {
                                            unwrap_response_envelope(&parsed)
                                        } else {
                                            parsed
                                        };
                                        state.observe_data(&payload);
                                        state.record_first_token();
                                        forward(
                                            &out_tx,
                                            &mut state,
                                            Bytes::from(format!("data: {}\n\n", payload)),
                                        )
                                        .await;
                                    }
                                    Err(_) => {
                                        // Non-JSON data lines pass through untouched.
                                        state.record_first_token();
                                        forward(
                                            &out_tx,
                                            &mut state,
                                            Bytes::from(format!("data: {}\n\n", data)),
                                        )
                                        .await;
                                    }
                                }
                            } else if !line.is_empty() {
                                forward(&out_tx, &mut state, Bytes::from(format!("{}\n", line))).await;
                            }
                        }
                        Some(LineEvent::Oversize) => {
                            crate::logger::error("stream", "SSE line exceeded max_line_size; aborting");
                            emit_error_once(&out_tx, &mut state, StreamErrorKind::ResponseTooLarge).await;
                            break;
                        }
                        Some(LineEvent::ReadError(message)) => {
                            crate::logger::error("stream", &format!("Upstream read error: {}", message));
                            emit_error_once(&out_tx, &mut state, StreamErrorKind::StreamReadError).await;
                            break;
                        }
                        Some(LineEvent::End) | None => break,
                    }
                }
                _ = ticker.tick() => {
                    let Some(idle) = options.idle_timeout else { continue };
                    if last_read.elapsed() >= idle {
                        crate::logger::error(
                            "stream",
                            &format!("No upstream data for {:?}; aborting stream", idle),
                        );
                        emit_error_once(&out_tx, &mut state, StreamErrorKind::StreamTimeout).await;
                        break;
                    }
                }
            }
        }

        let _ = outcome_tx.send(StreamOutcome {
            usage: state.usage,
            first_token_ms: state.first_token_ms,
            error: state.error_kind,
        });
    });

    let body_stream = futures_util::stream::unfold(out_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

    (response, outcome_rx)
}

// ============================================================================
// Stream-to-non-stream collection
// ============================================================================

#[derive(Debug, Clone)]
pub struct CollectedStream {
    /// The chunk chosen to answer with: the last one carrying content parts,
    /// falling back to the very last chunk.
    pub final_chunk: Value,
    pub usage: Usage,
    pub first_token_ms: Option<u64>,
}

fn has_content_parts(chunk: &Value) -> bool {
    chunk
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|p| !p.is_empty())
        .unwrap_or(false)
}

/// Collect a streaming response without forwarding, for providers that only
/// stream. Honors the same line cap and idle timeout as passthrough.
pub async fn collect_stream(
    response: AttemptResponse,
    options: StreamOptions,
    started: Instant,
) -> GatewayResult<CollectedStream> {
    let mut lines = spawn_producer(response, options.max_line_size);

    let mut usage = Usage::default();
    let mut first_token_ms = None;
    let mut last_chunk: Option<Value> = None;
    let mut last_with_content: Option<Value> = None;
    let mut last_read = Instant::now();
    let mut ticker = tokio::time::interval(
        options
            .idle_timeout
            .map(|t| t.max(Duration::from_millis(250)))
            .unwrap_or(Duration::from_secs(3600)),
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        tokio::select! {
            event = lines.recv() => {
                last_read = Instant::now();
                match event {
                    Some(LineEvent::Line(line)) => {
                        let Some(data) = parse_sse_data(&line) else { continue };
                        if is_sse_done(data) {
                            continue;
                        }
                        let Ok(parsed) = serde_json::from_str::<Value>(data) else { continue };
                        let chunk = if options.unwrap_envelope {
                            unwrap_response_envelope(&parsed)
                        } else {
                            parsed
                        };
                        if first_token_ms.is_none() {
                            first_token_ms = Some(started.elapsed().as_millis() as u64);
                        }
                        if let Some(parsed_usage) = extract_usage(&chunk) {
                            usage.merge(&parsed_usage);
                        }
                        if has_content_parts(&chunk) {
                            last_with_content = Some(chunk.clone());
                        }
                        last_chunk = Some(chunk);
                    }
                    Some(LineEvent::Oversize) => {
                        return Err(GatewayError::Upstream {
                            status: 502,
                            message: "upstream SSE line exceeded the size limit".into(),
                            request_id: None,
                        });
                    }
                    Some(LineEvent::ReadError(message)) => {
                        return Err(GatewayError::Connection(format!(
                            "stream read error: {}",
                            message
                        )));
                    }
                    Some(LineEvent::End) | None => break,
                }
            }
            _ = ticker.tick() => {
                let Some(idle) = options.idle_timeout else { continue };
                if last_read.elapsed() >= idle {
                    return Err(GatewayError::Timeout(format!(
                        "no upstream data for {:?}",
                        idle
                    )));
                }
            }
        }
    }

    let final_chunk = last_with_content
        .or(last_chunk)
        .ok_or_else(|| GatewayError::Upstream {
            status: 502,
            message: "upstream stream ended without any data".into(),
            request_id: None,
        })?;

    Ok(CollectedStream {
        final_chunk,
        usage,
        first_token_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sse(body: &str) -> AttemptResponse {
        AttemptResponse::from_text(200, body)
    }

    fn options() -> StreamOptions {
        StreamOptions {
            max_line_size: 64 * 1024,
            idle_timeout: None,
            unwrap_envelope: false,
        }
    }

    async fn read_body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[test]
    fn test_scanner_splits_lines_across_chunks() {
        let mut scanner = SseLineScanner::new(1024);
        assert!(scanner.push(b"data: {\"a\":").unwrap().is_empty());
        let lines = scanner.push(b"1}\r\ndata: [DONE]\n").unwrap();
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: [DONE]"]);
    }

    #[test]
    fn test_scanner_oversize_line() {
        let mut scanner = SseLineScanner::new(8);
        assert!(scanner.push(b"0123456789abcdef").is_err());
        // Once overflowed, the scanner stays dead.
        assert!(scanner.push(b"\n").is_err());
    }

    #[test]
    fn test_parse_sse_data() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("event: message"), None);
        assert!(is_sse_done(" [DONE] "));
    }

    #[tokio::test]
    async fn test_passthrough_forwards_and_accounts_usage() {
        let upstream = sse(concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":11,\"output_tokens\":0}}}\n",
            "\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n",
            "\n",
            "data: [DONE]\n",
        ));
        let (response, outcome) = sse_passthrough(upstream, options(), Instant::now());
        let body = read_body(response).await;
        assert!(body.contains("event: message_start\n"));
        assert!(body.contains("\"input_tokens\":11"));
        assert!(body.contains("data: [DONE]\n\n"));

        let outcome = outcome.await.unwrap();
        assert_eq!(outcome.usage.input_tokens, 11);
        assert_eq!(outcome.usage.output_tokens, 42);
        assert!(outcome.first_token_ms.is_some());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_passthrough_unwraps_envelope() {
        let chunk = json!({"response": {"candidates": [{"content": {"parts": [{"text": "hi"}]}}]}});
        let upstream = sse(&format!("data: {}\n", chunk));
        let mut opts = options();
        opts.unwrap_envelope = true;
        let (response, _outcome) = sse_passthrough(upstream, opts, Instant::now());
        let body = read_body(response).await;
        assert!(body.contains("\"candidates\""));
        assert!(!body.contains("\"response\""));
    }

    #[tokio::test]
    async fn test_single_error_event_on_oversize() {
        let long_line = format!("data: {}\n", "x".repeat(100));
        let upstream = sse(&long_line);
        let mut opts = options();
        opts.max_line_size = 16;
        let (response, outcome) = sse_passthrough(upstream, opts, Instant::now());
        let body = read_body(response).await;
        assert_eq!(body.matches("event: error").count(), 1);
        assert!(body.contains("response_too_large"));
        let outcome = outcome.await.unwrap();
        assert_eq!(outcome.error, Some("response_too_large"));
    }

    #[tokio::test]
    async fn test_idle_timeout_fires() {
        // A stream that never ends: keep the byte stream pending forever.
        let pending: crate::upstream::ByteStream = Box::pin(futures_util::stream::pending());
        let upstream = AttemptResponse::from_stream(200, pending);
        let mut opts = options();
        opts.idle_timeout = Some(Duration::from_millis(300));
        let (response, outcome) = sse_passthrough(upstream, opts, Instant::now());
        let body = read_body(response).await;
        assert!(body.contains("stream_timeout"));
        let outcome = outcome.await.unwrap();
        assert_eq!(outcome.error, Some("stream_timeout"));
    }

    #[tokio::test]
    async fn test_collect_prefers_chunk_with_content() {
        let with_content = json!({"candidates": [{"content": {"parts": [{"text": "answer"}]}}]});
        let tail = json!({"candidates": [{"finishReason": "STOP", "content": {"parts": []}}], "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 9}});
        let upstream = sse(&format!("data: {}\ndata: {}\n", with_content, tail));
        let collected = collect_stream(upstream, options(), Instant::now())
            .await
            .unwrap();
        assert_eq!(
            collected.final_chunk["candidates"][0]["content"]["parts"][0]["text"],
            "answer"
        );
        assert_eq!(collected.usage.input_tokens, 3);
        assert_eq!(collected.usage.output_tokens, 9);
    }

    #[tokio::test]
    async fn test_collect_empty_stream_errors() {
        let upstream = sse("");
        assert!(collect_stream(upstream, options(), Instant::now())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_collect_unwraps_envelope() {
        let chunk = json!({"response": {"candidates": [{"content": {"parts": [{"text": "hi"}]}}]}});
        let upstream = sse(&format!("data: {}\n", chunk));
        let mut opts = options();
        opts.unwrap_envelope = true;
        let collected = collect_stream(upstream, opts, Instant::now()).await.unwrap();
        assert!(collected.final_chunk.get("candidates").is_some());
    }
}
