//! Bounded retry for stream-producing operations (C2 in the design doc).
//!
//! Wraps a factory that produces a fresh [`LlmStream`] on each attempt. A
//! retriable failure observed *before* any event is emitted triggers an
//! exponentially backed-off retry (base 1s, cap 30s, jitter +/-20%, 5
//! attempts total). A retriable failure *after* events were already emitted
//! only retries when it is an idle timeout or an incomplete-stream error, and
//! only if the caller opts in via `retry_mid_stream`.

use crate::provider::{LlmError, LlmResult, LlmStream};
use crate::types::StreamDelta;
use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1 << attempt.min(5));
    let capped = exp.min(MAX_DELAY);
    let jitter_frac = ((attempt as u64 * 2654435761) % 41) as f64 / 100.0 - 0.20; // deterministic +/-20%
    let millis = capped.as_millis() as f64 * (1.0 + jitter_frac);
    Duration::from_millis(millis.max(0.0) as u64)
}

/// Invoked before each retry attempt with the 1-based attempt number and the
/// error that triggered the retry.
pub type OnRetry<'a> = dyn Fn(u32, &LlmError) + Send + Sync + 'a;

/// Drives `factory` with bounded retry and returns the first stream whose
/// production attempt succeeds, re-exported as a flattened stream of events
/// that transparently restarts the underlying stream on a retriable
/// mid-stream fault (idle timeout / incomplete stream) when
/// `retry_mid_stream` is true.
pub async fn stream_with_retry<F, Fut>(
    mut factory: F,
    cancel: CancellationToken,
    retry_mid_stream: bool,
    on_retry: impl Fn(u32, &LlmError) + Send + Sync + 'static,
) -> LlmResult<LlmStream>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = LlmResult<LlmStream>> + Send,
{
    let mut attempt: u32 = 0;
    let mut last_err: Option<LlmError> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        match factory().await {
            Ok(stream) => {
                return Ok(Box::pin(retrying_stream(
                    stream, factory, cancel, retry_mid_stream, on_retry,
                )));
            }
            Err(e) if e.is_retriable() && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                on_retry(attempt, &e);
                last_err = Some(e);
                let delay = backoff_delay(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                }
            }
            Err(e) => return Err(last_err.unwrap_or(e)),
        }
    }
}

/// Wraps an already-established stream so that a retriable mid-stream fault
/// (idle timeout, incomplete stream) transparently restarts the provider call
/// via `factory`, without re-emitting events the caller already saw.
fn retrying_stream<F, Fut>(
    first: LlmStream,
    mut factory: F,
    cancel: CancellationToken,
    retry_mid_stream: bool,
    on_retry: impl Fn(u32, &LlmError) + Send + Sync + 'static,
) -> impl futures::Stream<Item = LlmResult<StreamDelta>> + Send
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = LlmResult<LlmStream>> + Send,
{
    async_stream::stream! {
        let mut current = first;
        let mut attempt: u32 = 0;
        let mut emitted_any = false;

        'outer: loop {
            tokio::select! {
                item = current.next() => {
                    match item {
                        Some(Ok(ev)) => {
                            emitted_any = true;
                            yield Ok(ev);
                        }
                        Some(Err(e)) if attempt + 1 < MAX_ATTEMPTS && e.is_retriable() && (
                            !emitted_any
                                || (retry_mid_stream && matches!(
                                    e, LlmError::IdleTimeout(_) | LlmError::StreamTerminatedIncomplete { .. }
                                ))
                        ) => {
                            attempt += 1;
                            on_retry(attempt, &e);
                            let delay = backoff_delay(attempt);
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => { yield Err(LlmError::Cancelled); return; }
                            }
                            match factory().await {
                                Ok(next) => { current = next; continue 'outer; }
                                Err(e2) => { yield Err(e2); return; }
                            }
                        }
                        Some(Err(e)) => { yield Err(e); return; }
                        None => return,
                    }
                }
                _ = cancel.cancelled() => { yield Err(LlmError::Cancelled); return; }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn idle_timeout_stream() -> LlmStream {
        Box::pin(stream::iter(vec![Err(LlmError::IdleTimeout(
            std::time::Duration::from_secs(180),
        ))]))
    }

    fn ok_stream(text: &'static str) -> LlmStream {
        Box::pin(stream::iter(vec![Ok(StreamDelta::Text(text.to_string()))]))
    }

    /// Scenario 5: the provider stream emits no bytes before an idle timeout
    /// fires on the very first poll (`emitted_any` still false). Retry must
    /// fire even though `retry_mid_stream` is false — that flag only gates
    /// retries *after* at least one event has already been seen.
    #[tokio::test]
    async fn retries_idle_timeout_before_any_event_even_without_mid_stream_opt_in() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_inner = attempts.clone();
        let factory = move || {
            let attempts = attempts_inner.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Ok(idle_timeout_stream())
                } else {
                    Ok(ok_stream("recovered"))
                }
            }
        };

        let stream = stream_with_retry(factory, CancellationToken::new(), false, |_, _| {})
            .await
            .expect("factory itself never errors");
        let events: Vec<_> = stream.collect().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, Ok(StreamDelta::Text(t)) if t == "recovered")));
    }

    /// Once an event has been emitted, a mid-stream idle timeout is only
    /// retried when the caller opted in via `retry_mid_stream`.
    #[tokio::test]
    async fn does_not_retry_mid_stream_idle_timeout_without_opt_in() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_inner = attempts.clone();
        let factory = move || {
            let attempts = attempts_inner.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(Box::pin(stream::iter(vec![
                    Ok(StreamDelta::Text("first".to_string())),
                    Err(LlmError::IdleTimeout(std::time::Duration::from_secs(180))),
                ])) as LlmStream)
            }
        };

        let stream = stream_with_retry(factory, CancellationToken::new(), false, |_, _| {})
            .await
            .unwrap();
        let events: Vec<_> = stream.collect().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(events.last().unwrap().is_err());
    }

    /// With `retry_mid_stream` true, an idle timeout after events have been
    /// emitted does restart the stream via a fresh factory call.
    #[tokio::test]
    async fn retries_mid_stream_idle_timeout_with_opt_in() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_inner = attempts.clone();
        let factory = move || {
            let attempts = attempts_inner.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Ok(Box::pin(stream::iter(vec![
                        Ok(StreamDelta::Text("first".to_string())),
                        Err(LlmError::IdleTimeout(std::time::Duration::from_secs(180))),
                    ])) as LlmStream)
                } else {
                    Ok(ok_stream("resumed"))
                }
            }
        };

        let stream = stream_with_retry(factory, CancellationToken::new(), true, |_, _| {})
            .await
            .unwrap();
        let events: Vec<_> = stream.collect().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, Ok(StreamDelta::Text(t)) if t == "resumed")));
    }
}
