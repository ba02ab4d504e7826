//! Delivery of a decoded event stream to a sink: fence stripping, optional
//! coalescing, overall deadline, and cancellation.

use async_channel::Receiver;
use std::time::{Duration, Instant};

use super::decode::StreamEvent;
use super::sink::OutputSink;
use crate::cancel::CancellationToken;
use crate::error::GenerationError;

const SQL_FENCE: &str = "```sql";
const FENCE: &str = "```";

/// Removes "```sql" and "```" markers from text that arrives in arbitrary
/// pieces. A trailing piece that could still become a marker is held back
/// until the next push, so the concatenated output equals the marker-free
/// full text.
#[derive(Debug, Default)]
pub struct FenceStripper {
    pending: String,
}

impl FenceStripper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> String {
        self.pending.push_str(fragment);
        let buffer = std::mem::take(&mut self.pending);
        let (out, held) = strip(&buffer, false);
        self.pending = held.to_string();
        out
    }

    /// Flush whatever is held back once the stream has ended.
    pub fn finish(&mut self) -> String {
        let buffer = std::mem::take(&mut self.pending);
        strip(&buffer, true).0
    }
}

/// Strip markers left to right, preferring "```sql" over "```". Unless
/// `at_end`, stop at a tail that is a proper prefix of "```sql" and return it.
fn strip(buffer: &str, at_end: bool) -> (String, &str) {
    let mut out = String::with_capacity(buffer.len());
    let mut rest = buffer;

    while let Some(ch) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix(SQL_FENCE) {
            rest = after;
        } else if !at_end && rest.len() < SQL_FENCE.len() && SQL_FENCE.starts_with(rest) {
            return (out, rest);
        } else if let Some(after) = rest.strip_prefix(FENCE) {
            rest = after;
        } else {
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }

    (out, rest)
}

/// Merges small adjacent fragments. Text is released once `min_chars`
/// characters are buffered or `max_delay` has passed since the last release.
#[derive(Debug)]
pub struct Coalescer {
    buffer: String,
    min_chars: usize,
    max_delay: Duration,
    last_emit: Instant,
}

impl Coalescer {
    pub fn new(min_chars: usize, max_delay: Duration) -> Self {
        Self {
            buffer: String::new(),
            min_chars,
            max_delay,
            last_emit: Instant::now(),
        }
    }

    pub fn push(&mut self, text: &str, now: Instant) -> Option<String> {
        self.buffer.push_str(text);
        if self.buffer.chars().count() >= self.min_chars || self.is_due(now) {
            self.take(now)
        } else {
            None
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        !self.buffer.is_empty() && now.duration_since(self.last_emit) >= self.max_delay
    }

    /// When buffered text must be released even without new input.
    pub fn due_at(&self) -> Option<Instant> {
        (!self.buffer.is_empty()).then(|| self.last_emit + self.max_delay)
    }

    pub fn take(&mut self, now: Instant) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        self.last_emit = now;
        Some(std::mem::take(&mut self.buffer))
    }
}

/// How a stream is delivered.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub backend: &'static str,
    /// Overall deadline for the request, measured from the start of delivery
    pub timeout: Duration,
    /// `(min_chars, max_delay)` when small fragments should be merged
    pub coalesce: Option<(usize, Duration)>,
}

/// What was produced by a finished (or timed-out) stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Raw provider text, markers included
    pub raw: String,
    /// Exactly what reached the sink
    pub text: String,
    /// The deadline hit after some text had arrived
    pub partial: bool,
    pub fragments: usize,
}

enum Next {
    Event(Option<Result<StreamEvent, GenerationError>>),
    Flush,
    Deadline,
    Cancelled,
}

/// Forward decoded events to `sink` in arrival order until the stream ends.
pub async fn deliver(
    events: Receiver<Result<StreamEvent, GenerationError>>,
    sink: &dyn OutputSink,
    policy: &DeliveryPolicy,
    cancel: &CancellationToken,
) -> Result<Delivered, GenerationError> {
    let deadline = Instant::now() + policy.timeout;
    let mut stripper = FenceStripper::new();
    let mut coalescer = policy
        .coalesce
        .map(|(min_chars, max_delay)| Coalescer::new(min_chars, max_delay));
    let mut out = Delivered {
        raw: String::new(),
        text: String::new(),
        partial: false,
        fragments: 0,
    };

    loop {
        let flush_at = coalescer.as_ref().and_then(Coalescer::due_at);
        let next = smol::future::or(
            smol::future::or(
                async { Next::Event(events.recv().await.ok()) },
                async {
                    cancel.cancelled().await;
                    Next::Cancelled
                },
            ),
            async {
                match flush_at {
                    Some(at) if at < deadline => {
                        smol::Timer::at(at).await;
                        Next::Flush
                    }
                    _ => {
                        smol::Timer::at(deadline).await;
                        Next::Deadline
                    }
                }
            },
        )
        .await;

        match next {
            Next::Event(Some(Ok(StreamEvent::Text(fragment)))) => {
                out.raw.push_str(&fragment);
                out.fragments += 1;
                let clean = stripper.push(&fragment);
                let ready = match coalescer.as_mut() {
                    Some(c) => c.push(&clean, Instant::now()),
                    None => Some(clean),
                };
                if let Some(text) = ready {
                    forward(sink, &mut out.text, &text).await;
                }
            }
            Next::Event(Some(Ok(StreamEvent::Done))) | Next::Event(None) => break,
            Next::Event(Some(Err(GenerationError::Timeout { .. }))) if out.fragments > 0 => {
                out.partial = true;
                break;
            }
            Next::Event(Some(Err(e))) => return Err(e),
            Next::Flush => {
                if let Some(text) = coalescer.as_mut().and_then(|c| c.take(Instant::now())) {
                    forward(sink, &mut out.text, &text).await;
                }
            }
            Next::Deadline => {
                if out.fragments == 0 {
                    return Err(GenerationError::Timeout {
                        backend: policy.backend,
                        after: policy.timeout,
                    });
                }
                tracing::warn!(
                    "{}: request timed out after {:?}; keeping partial response",
                    policy.backend,
                    policy.timeout
                );
                out.partial = true;
                break;
            }
            Next::Cancelled => return Err(GenerationError::Cancelled),
        }
    }

    let mut tail = coalescer
        .as_mut()
        .and_then(|c| c.take(Instant::now()))
        .unwrap_or_default();
    tail.push_str(&stripper.finish());
    forward(sink, &mut out.text, &tail).await;

    if out.fragments == 0 {
        return Err(GenerationError::EmptyResponse {
            backend: policy.backend,
        });
    }
    Ok(out)
}

/// Send non-empty text to the sink. A failing sink is logged and generation
/// continues.
async fn forward(sink: &dyn OutputSink, delivered: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    delivered.push_str(text);
    if let Err(e) = sink.append(text).await {
        tracing::warn!("Failed to append to output: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::sink::MemorySink;

    fn strip_all(text: &str) -> String {
        strip(text, true).0
    }

    fn policy(coalesce: Option<(usize, Duration)>) -> DeliveryPolicy {
        DeliveryPolicy {
            backend: "test",
            timeout: Duration::from_secs(5),
            coalesce,
        }
    }

    #[test]
    fn test_strip_whole_text() {
        assert_eq!(strip_all("```sql\nSELECT 1;\n```"), "\nSELECT 1;\n");
        assert_eq!(strip_all("a ``` b ```sql c"), "a  b  c");
        assert_eq!(strip_all("`x` and ``y``"), "`x` and ``y``");
    }

    #[test]
    fn test_stripper_across_every_split() {
        let full = "-- Summary\n```sql\nSELECT * FROM users;\n```\n``` tail ``";
        let expected = strip_all(full);

        for split in 0..=full.len() {
            for second in split..=full.len() {
                let mut stripper = FenceStripper::new();
                let mut out = stripper.push(&full[..split]);
                out.push_str(&stripper.push(&full[split..second]));
                out.push_str(&stripper.push(&full[second..]));
                out.push_str(&stripper.finish());
                assert_eq!(out, expected, "split at {} and {}", split, second);
            }
        }
    }

    #[test]
    fn test_stripper_handles_multibyte_text() {
        let mut stripper = FenceStripper::new();
        let mut out = stripper.push("```sq");
        out.push_str(&stripper.push("l\n-- 概要\n`"));
        out.push_str(&stripper.push("``"));
        out.push_str(&stripper.finish());
        assert_eq!(out, "\n-- 概要\n");
    }

    #[test]
    fn test_coalescer_thresholds() {
        let start = Instant::now();
        let mut c = Coalescer::new(5, Duration::from_millis(100));
        c.last_emit = start;

        assert_eq!(c.push("ab", start), None);
        assert_eq!(c.push("cde", start), Some("abcde".to_string()));
        assert_eq!(c.push("f", start + Duration::from_millis(50)), None);
        assert_eq!(
            c.push("g", start + Duration::from_millis(120)),
            Some("fg".to_string())
        );
        assert_eq!(c.due_at(), None);
    }

    /// Every call fails.
    struct BrokenSink;

    #[async_trait::async_trait]
    impl OutputSink for BrokenSink {
        async fn open(&self) -> anyhow::Result<()> {
            anyhow::bail!("editor closed")
        }

        async fn append(&self, _text: &str) -> anyhow::Result<()> {
            anyhow::bail!("editor closed")
        }
    }

    #[test]
    fn test_failing_sink_does_not_stop_delivery() {
        smol::block_on(async {
            let parts = ["```sql\nSELECT", " 1;", "\n```"];
            let delivered = deliver(
                fragments(&parts),
                &BrokenSink,
                &policy(None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

            assert_eq!(delivered.fragments, 3);
            assert_eq!(delivered.text, "\nSELECT 1;\n");
            assert!(!delivered.partial);
        });
    }

    fn fragments(parts: &[&str]) -> Receiver<Result<StreamEvent, GenerationError>> {
        let (tx, rx) = async_channel::unbounded();
        for part in parts {
            tx.try_send(Ok(StreamEvent::Text(part.to_string()))).unwrap();
        }
        tx.try_send(Ok(StreamEvent::Done)).unwrap();
        rx
    }

    #[test]
    fn test_delivered_text_equals_stripped_response() {
        let parts = ["-- Summary\n``", "`sql\nSELECT", " id FROM t;", "\n``", "`"];
        let full: String = parts.concat();

        for coalesce in [None, Some((48, Duration::from_millis(120)))] {
            smol::block_on(async {
                let sink = MemorySink::new();
                let delivered = deliver(
                    fragments(&parts),
                    &sink,
                    &policy(coalesce),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

                assert_eq!(sink.text().await, strip_all(&full));
                assert_eq!(delivered.text, strip_all(&full));
                assert_eq!(delivered.raw, full);
                assert!(!delivered.partial);
            });
        }
    }

    #[test]
    fn test_uncoalesced_fragments_arrive_individually() {
        smol::block_on(async {
            let sink = MemorySink::new();
            deliver(
                fragments(&["SELECT", " 1", ";"]),
                &sink,
                &policy(None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            assert_eq!(sink.fragments().await, vec!["SELECT", " 1", ";"]);
        });
    }

    #[test]
    fn test_timeout_with_partial_text_succeeds() {
        smol::block_on(async {
            let (tx, rx) = async_channel::unbounded();
            tx.try_send(Ok(StreamEvent::Text("SELECT 1".to_string())))
                .unwrap();

            let sink = MemorySink::new();
            let policy = DeliveryPolicy {
                timeout: Duration::from_millis(100),
                ..policy(None)
            };
            let delivered = deliver(rx, &sink, &policy, &CancellationToken::new())
                .await
                .unwrap();

            assert!(delivered.partial);
            assert_eq!(sink.text().await, "SELECT 1");
            drop(tx);
        });
    }

    #[test]
    fn test_timeout_without_text_fails() {
        smol::block_on(async {
            let (tx, rx) = async_channel::unbounded();
            let policy = DeliveryPolicy {
                timeout: Duration::from_millis(50),
                ..policy(None)
            };
            let err = deliver(rx, &MemorySink::new(), &policy, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, GenerationError::Timeout { .. }));
            drop(tx);
        });
    }

    #[test]
    fn test_stream_without_fragments_is_empty_response() {
        smol::block_on(async {
            let err = deliver(
                fragments(&[]),
                &MemorySink::new(),
                &policy(None),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, GenerationError::EmptyResponse { .. }));
        });
    }

    #[test]
    fn test_cancel_stops_delivery() {
        smol::block_on(async {
            let (tx, rx) = async_channel::unbounded();
            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            smol::spawn(async move {
                smol::Timer::after(Duration::from_millis(20)).await;
                canceller.cancel();
            })
            .detach();

            let err = deliver(rx, &MemorySink::new(), &policy(None), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, GenerationError::Cancelled));
            drop(tx);
        });
    }

    #[test]
    fn test_backend_error_is_returned() {
        smol::block_on(async {
            let (tx, rx) = async_channel::unbounded();
            tx.try_send(Err(GenerationError::Network {
                backend: "test",
                detail: "reset".to_string(),
            }))
            .unwrap();
            let err = deliver(rx, &MemorySink::new(), &policy(None), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, GenerationError::Network { .. }));
        });
    }

    #[test]
    fn test_stalled_coalesced_text_is_flushed_by_timer() {
        smol::block_on(async {
            let (tx, rx) = async_channel::unbounded();
            tx.try_send(Ok(StreamEvent::Text("SEL".to_string()))).unwrap();

            let sink = MemorySink::new();
            let policy = policy(Some((48, Duration::from_millis(30))));
            let task = async {
                smol::Timer::after(Duration::from_millis(150)).await;
                // Flushed before the stream finished
                let seen = sink.text().await;
                tx.try_send(Ok(StreamEvent::Done)).unwrap();
                seen
            };
            let cancel = CancellationToken::new();
            let (delivered, seen) = futures::join!(
                deliver(rx, &sink, &policy, &cancel),
                task
            );

            assert_eq!(seen, "SEL");
            assert_eq!(delivered.unwrap().text, "SEL");
        });
    }
}
