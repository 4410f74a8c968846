use crate::providers::DeltaStream;
use async_trait::async_trait;
use axum::response::sse::Event;
use bytes::Bytes;
use futures_util::StreamExt;
use metrics::counter;
use serde_json::json;
use std::time::Instant;
use tokio::sync::mpsc;

/// Relay state machine. `Errored` is absorbing: the outgoing transport is
/// torn down and finalization never runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Idle,
    Streaming,
    Finalizing,
    Closed,
    Errored,
}

/// Mutable state owned by one relay invocation. Discarded after
/// finalization; never shared across requests.
#[derive(Debug)]
pub struct Accumulator {
    pub full_content: String,
    pub total_tokens: Option<u64>,
    pub started_at: Instant,
}

impl Accumulator {
    pub fn new(started_at: Instant) -> Self {
        Self {
            full_content: String::new(),
            total_tokens: None,
            started_at,
        }
    }

    pub fn latency_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// End-of-stream persistence hook, invoked at most once per relay.
#[async_trait]
pub trait FinalizeSink: Send {
    async fn finalize(&mut self, acc: &Accumulator);
}

/// Converts content fragments into items for the outgoing transport.
pub trait FrameEvents<T> {
    fn fragment(&mut self, text: &str) -> T;
    /// Item emitted after finalization, if the framing has one.
    fn done(&mut self) -> Option<T>;
}

/// SSE framing in the chat-chunk envelope the web client already parses:
/// `data: <json>` lines terminated by `data: [DONE]`.
pub struct ChatChunkFraming {
    id: String,
    created: i64,
    model: String,
}

impl ChatChunkFraming {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl_{}", uuid::Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
        }
    }
}

impl FrameEvents<Event> for ChatChunkFraming {
    fn fragment(&mut self, text: &str) -> Event {
        let chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": { "content": text }, "finish_reason": null }],
        });
        Event::default().data(chunk.to_string())
    }

    fn done(&mut self) -> Option<Event> {
        Some(Event::default().data("[DONE]"))
    }
}

/// Plain-text framing: fragments pass through as raw body bytes with no
/// envelope and no end marker. Used by the financial-analysis route whose
/// only consumer is a human reader.
pub struct RawTextFraming;

impl FrameEvents<Bytes> for RawTextFraming {
    fn fragment(&mut self, text: &str) -> Bytes {
        Bytes::from(text.to_owned())
    }

    fn done(&mut self) -> Option<Bytes> {
        None
    }
}

/// Drives an adapter's delta stream onto the outgoing channel, accumulating
/// content and the last seen token count.
///
/// The first terminal event triggers finalization exactly once; a stream
/// that ends without one is treated the same. Finalizer failures are the
/// sink's concern and never reach the transport. A failed send means the
/// client disconnected: the upstream stream is dropped, finalization is
/// skipped and the relay ends `Errored`.
pub async fn run_relay<T, F>(
    mut deltas: DeltaStream,
    tx: mpsc::Sender<T>,
    mut framing: F,
    mut sink: Option<&mut (dyn FinalizeSink + Send)>,
    started_at: Instant,
) -> (RelayPhase, Accumulator)
where
    T: Send + 'static,
    F: FrameEvents<T>,
{
    counter!("finchat_relay_started_total").increment(1);
    let mut acc = Accumulator::new(started_at);
    let mut finalized = false;

    while let Some(ev) = deltas.next().await {
        if finalized {
            // Late events after a terminal signal carry nothing we relay.
            continue;
        }
        if let Some(text) = ev.content.as_deref() {
            if !text.is_empty() {
                acc.full_content.push_str(text);
                if tx.send(framing.fragment(text)).await.is_err() {
                    counter!("finchat_relay_errored_total").increment(1);
                    tracing::debug!("client disconnected mid-stream, aborting upstream read");
                    return (RelayPhase::Errored, acc);
                }
            }
        }
        if let Some(tokens) = ev.total_tokens {
            acc.total_tokens = Some(tokens);
        }
        if ev.terminal {
            finalized = true;
            if let Some(s) = sink.as_mut() {
                s.finalize(&acc).await;
            }
        }
    }

    // Implicit close without an explicit terminal marker.
    if !finalized {
        if let Some(s) = sink.as_mut() {
            s.finalize(&acc).await;
        }
    }

    if let Some(done) = framing.done() {
        let _ = tx.send(done).await;
    }
    counter!("finchat_relay_completed_total").increment(1);
    (RelayPhase::Closed, acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::DeltaEvent;
    use futures_util::stream;

    struct CountingSink {
        calls: u32,
        content: String,
        tokens: Option<u64>,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                calls: 0,
                content: String::new(),
                tokens: None,
            }
        }
    }

    #[async_trait]
    impl FinalizeSink for CountingSink {
        async fn finalize(&mut self, acc: &Accumulator) {
            self.calls += 1;
            self.content = acc.full_content.clone();
            self.tokens = acc.total_tokens;
        }
    }

    fn delta_stream(events: Vec<DeltaEvent>) -> DeltaStream {
        stream::iter(events).boxed()
    }

    #[tokio::test]
    async fn accumulates_fragments_and_final_token_count() {
        let events = vec![
            DeltaEvent::fragment("H"),
            DeltaEvent::fragment("i"),
            DeltaEvent::fragment("!"),
            DeltaEvent::terminal(Some(42)),
        ];
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        let mut sink = CountingSink::new();
        let (phase, acc) = run_relay(
            delta_stream(events),
            tx,
            RawTextFraming,
            Some(&mut sink),
            Instant::now(),
        )
        .await;

        assert_eq!(phase, RelayPhase::Closed);
        assert_eq!(acc.full_content, "Hi!");
        assert_eq!(acc.total_tokens, Some(42));
        assert_eq!(sink.calls, 1);
        assert_eq!(sink.content, "Hi!");
        assert_eq!(sink.tokens, Some(42));

        let mut streamed = String::new();
        while let Ok(chunk) = rx.try_recv() {
            streamed.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert_eq!(streamed, "Hi!");
    }

    #[tokio::test]
    async fn repeated_terminal_signals_finalize_once() {
        let events = vec![
            DeltaEvent::fragment("ok"),
            DeltaEvent::terminal(Some(5)),
            DeltaEvent::terminal(Some(5)),
            DeltaEvent::terminal(None),
        ];
        let (tx, _rx) = mpsc::channel::<Bytes>(16);
        let mut sink = CountingSink::new();
        let (phase, _) = run_relay(
            delta_stream(events),
            tx,
            RawTextFraming,
            Some(&mut sink),
            Instant::now(),
        )
        .await;

        assert_eq!(phase, RelayPhase::Closed);
        assert_eq!(sink.calls, 1);
        assert_eq!(sink.tokens, Some(5));
    }

    #[tokio::test]
    async fn implicit_close_is_treated_as_terminal() {
        let events = vec![DeltaEvent::fragment("partial")];
        let (tx, _rx) = mpsc::channel::<Bytes>(16);
        let mut sink = CountingSink::new();
        let (phase, acc) = run_relay(
            delta_stream(events),
            tx,
            RawTextFraming,
            Some(&mut sink),
            Instant::now(),
        )
        .await;

        assert_eq!(phase, RelayPhase::Closed);
        assert_eq!(acc.total_tokens, None);
        assert_eq!(sink.calls, 1);
        assert_eq!(sink.content, "partial");
    }

    #[tokio::test]
    async fn client_disconnect_skips_finalization() {
        let events = vec![
            DeltaEvent::fragment("a"),
            DeltaEvent::fragment("b"),
            DeltaEvent::terminal(Some(9)),
        ];
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        drop(rx);
        let mut sink = CountingSink::new();
        let (phase, _) = run_relay(
            delta_stream(events),
            tx,
            RawTextFraming,
            Some(&mut sink),
            Instant::now(),
        )
        .await;

        assert_eq!(phase, RelayPhase::Errored);
        assert_eq!(sink.calls, 0);
    }

    #[tokio::test]
    async fn chat_framing_wraps_fragments_and_appends_done() {
        let events = vec![DeltaEvent::fragment("Oi"), DeltaEvent::terminal(None)];
        let (tx, mut rx) = mpsc::channel::<Event>(16);
        let (phase, _) = run_relay(
            delta_stream(events),
            tx,
            ChatChunkFraming::new("gpt-4o-mini"),
            None,
            Instant::now(),
        )
        .await;

        assert_eq!(phase, RelayPhase::Closed);
        let mut events_out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events_out.push(ev);
        }
        assert_eq!(events_out.len(), 2);
    }
}
