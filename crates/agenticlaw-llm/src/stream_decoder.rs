//! Idle-timeout and cancellation wrapping for a provider's normalized event
//! stream (C1 in the design doc). Provider adapters translate wire framing
//! into [`StreamDelta`]; this module enforces the cross-provider contract
//! every adapter must honor: no more than `idle_timeout` between events, and
//! prompt, idempotent abandonment on cancellation.

use crate::provider::{LlmError, LlmResult};
use crate::types::StreamDelta;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Wraps a raw provider event stream with an idle-timeout guard and
/// cancellation. Once cancelled, further events are dropped rather than
/// yielded, but the underlying stream is still polled to completion so the
/// transport can close gracefully.
pub fn guard_stream(
    inner: impl Stream<Item = LlmResult<StreamDelta>> + Send + 'static,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> impl Stream<Item = LlmResult<StreamDelta>> + Send {
    async_stream::stream! {
        tokio::pin!(inner);
        let mut events_emitted = 0usize;
        let mut last_event: Option<String> = None;
        let mut abandoned = false;

        loop {
            if cancel.is_cancelled() && !abandoned {
                yield Err(LlmError::Cancelled);
                abandoned = true;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !abandoned => {
                    yield Err(LlmError::Cancelled);
                    abandoned = true;
                }
                item = tokio::time::timeout(idle_timeout, inner.next()) => {
                    match item {
                        Ok(Some(Ok(ev))) => {
                            events_emitted += 1;
                            last_event = Some(event_name(&ev));
                            if !abandoned {
                                yield Ok(ev);
                            }
                        }
                        Ok(Some(Err(e))) => {
                            if !abandoned {
                                yield Err(e);
                            }
                            return;
                        }
                        Ok(None) => {
                            if events_emitted == 0 {
                                return;
                            }
                            return;
                        }
                        Err(_elapsed) => {
                            if !abandoned {
                                yield Err(LlmError::IdleTimeout(idle_timeout));
                            }
                            return;
                        }
                    }
                }
            }
        }
        let _ = last_event;
    }
}

fn event_name(ev: &StreamDelta) -> String {
    match ev {
        StreamDelta::MessageStart { .. } => "message_start",
        StreamDelta::Text(_) => "text",
        StreamDelta::ReasoningStarted => "reasoning_started",
        StreamDelta::Thinking(_) => "thinking",
        StreamDelta::ReasoningSignature(_) => "reasoning_signature",
        StreamDelta::ToolCallStart { .. } => "tool_call_start",
        StreamDelta::ToolCallDelta { .. } => "tool_call_delta",
        StreamDelta::ToolCallEnd { .. } => "tool_call_end",
        StreamDelta::Done { .. } => "done",
        StreamDelta::Error(_) => "error",
    }
    .to_string()
}

/// Detects a stream that ended without a terminal `Done` event — the
/// transport closed mid-message. Adapters call this after draining their byte
/// stream to decide whether to surface `StreamTerminatedIncomplete`.
pub fn incomplete_termination(
    events_emitted: usize,
    saw_done: bool,
    last_event: Option<String>,
) -> Option<LlmError> {
    if saw_done || events_emitted == 0 {
        None
    } else {
        Some(LlmError::StreamTerminatedIncomplete {
            events_emitted,
            last_event,
        })
    }
}
