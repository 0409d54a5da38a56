//! Bridges the permission gate's out-of-band confirmation requests (C5) to
//! the WS/SSE wire protocol.
//!
//! `ChannelConfirmationSink` (installed as the runtime's `ConfirmationSink`)
//! forwards every gated tool call here instead of auto-approving it. Each
//! request is broadcast as a `tool_confirmation_request` `OutputEvent`
//! carrying a fresh request id; the client is expected to echo that id back
//! in a `tool_confirmation_response` message, which resolves the matching
//! entry in [`PendingConfirmations`] and unblocks the gate.

use agenticlaw_agent::OutputEvent;
use agenticlaw_tools::permission::{ConfirmationChoice, PendingConfirmation};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

/// Registry of confirmation requests awaiting a client response, keyed by
/// the request id handed out in the broadcast event.
#[derive(Default)]
pub struct PendingConfirmations {
    inner: DashMap<String, oneshot::Sender<ConfirmationChoice>>,
}

impl PendingConfirmations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a pending request with the client's decision. Returns
    /// `false` if no such request is outstanding (already answered, timed
    /// out, or an unrecognized id) — callers should treat that as a no-op,
    /// not an error, since a slow double-click or a stale id is harmless.
    pub fn resolve(&self, request_id: &str, choice: ConfirmationChoice) -> bool {
        match self.inner.remove(request_id) {
            Some((_, tx)) => tx.send(choice).is_ok(),
            None => false,
        }
    }
}

/// Drains `PendingConfirmation`s produced by a `ChannelConfirmationSink`,
/// broadcasting each as a `tool_confirmation_request` event and registering
/// its reply channel under a fresh request id. A request left unanswered for
/// `timeout` is auto-rejected so a disconnected or inattentive client can't
/// wedge a turn open forever.
pub async fn run_confirmation_bridge(
    mut rx: mpsc::UnboundedReceiver<PendingConfirmation>,
    output_tx: broadcast::Sender<OutputEvent>,
    pending: Arc<PendingConfirmations>,
    timeout: Duration,
) {
    while let Some(PendingConfirmation { request, respond }) = rx.recv().await {
        let request_id = uuid::Uuid::new_v4().to_string();
        pending.inner.insert(request_id.clone(), respond);

        let _ = output_tx.send(OutputEvent::ToolConfirmationRequest {
            request_id: request_id.clone(),
            tool_name: request.tool_name.clone(),
            arguments: request.arguments.clone(),
            batched_with: request.batched_with.clone(),
            sensitivity_description: request.sensitivity.as_ref().map(|s| s.description.clone()),
            allow_always: request.allow_always_option,
        });

        let pending = pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if pending.resolve(&request_id, ConfirmationChoice::Reject) {
                warn!(request_id, "tool confirmation timed out with no client response, auto-rejected");
            }
        });
    }
}

/// Parses a `tool_confirmation_response` wire payload into a
/// [`ConfirmationChoice`]. Expected shape: `{"decision": "approve_once" |
/// "approve_always" | "reject" | "reject_with_reply", "reason"?: string}`.
/// Unrecognized or missing decisions fail closed to `Reject`.
pub fn parse_confirmation_choice(response: &serde_json::Value) -> ConfirmationChoice {
    let decision = response.get("decision").and_then(|v| v.as_str()).unwrap_or("reject");
    let reason = response
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    match decision {
        "approve_once" => ConfirmationChoice::ApproveOnce,
        "approve_always" => ConfirmationChoice::ApproveAlways,
        "reject_with_reply" => ConfirmationChoice::RejectWithReply(reason),
        _ => ConfirmationChoice::Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_decision() {
        assert!(matches!(
            parse_confirmation_choice(&serde_json::json!({"decision": "approve_once"})),
            ConfirmationChoice::ApproveOnce
        ));
        assert!(matches!(
            parse_confirmation_choice(&serde_json::json!({"decision": "approve_always"})),
            ConfirmationChoice::ApproveAlways
        ));
        assert!(matches!(
            parse_confirmation_choice(&serde_json::json!({"decision": "reject"})),
            ConfirmationChoice::Reject
        ));
        match parse_confirmation_choice(
            &serde_json::json!({"decision": "reject_with_reply", "reason": "nope"}),
        ) {
            ConfirmationChoice::RejectWithReply(r) => assert_eq!(r, "nope"),
            other => panic!("expected RejectWithReply, got {:?}", other),
        }
    }

    #[test]
    fn unknown_decision_fails_closed() {
        assert!(matches!(
            parse_confirmation_choice(&serde_json::json!({"decision": "bogus"})),
            ConfirmationChoice::Reject
        ));
        assert!(matches!(
            parse_confirmation_choice(&serde_json::json!({})),
            ConfirmationChoice::Reject
        ));
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_noop() {
        let pending = PendingConfirmations::new();
        assert!(!pending.resolve("nonexistent", ConfirmationChoice::Reject));
    }

    #[tokio::test]
    async fn bridge_broadcasts_and_resolves() {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (output_tx, mut output_rx) = broadcast::channel(16);
        let pending = Arc::new(PendingConfirmations::new());

        let bridge = tokio::spawn(run_confirmation_bridge(
            req_rx,
            output_tx,
            pending.clone(),
            Duration::from_secs(5),
        ));

        let (respond, answer_rx) = oneshot::channel();
        let request = agenticlaw_tools::permission::ConfirmationRequest {
            tool_name: "bash".to_string(),
            arguments: serde_json::json!({"command": "rm -rf /"}),
            batched_with: vec![],
            sensitivity: None,
            allow_always_option: true,
        };
        req_tx.send(PendingConfirmation { request, respond }).unwrap();

        let event = output_rx.recv().await.unwrap();
        let request_id = match event {
            OutputEvent::ToolConfirmationRequest { request_id, .. } => request_id,
            other => panic!("expected ToolConfirmationRequest, got {:?}", other),
        };

        assert!(pending.resolve(&request_id, ConfirmationChoice::ApproveOnce));
        assert!(matches!(answer_rx.await.unwrap(), ConfirmationChoice::ApproveOnce));

        drop(req_tx);
        let _ = bridge.await;
    }
}
