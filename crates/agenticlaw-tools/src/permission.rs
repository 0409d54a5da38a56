//! Permission gate — decides whether a tool call proceeds.
//!
//! Every tool call is classified before it reaches a handler: auto-approved
//! tools run immediately, sensitive shell commands always require interactive
//! confirmation (and can never be "always approved"), everything else asks
//! once and may be remembered per working directory.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::RwLock;

/// A rule matching shell commands that require extra scrutiny.
#[derive(Clone, Debug)]
pub struct SensitiveCommandRule {
    pub description: String,
    pattern: RulePattern,
    pub active: bool,
}

#[derive(Clone, Debug)]
enum RulePattern {
    Literal(String),
    Prefix(String),
    Regex(regex::Regex),
}

impl SensitiveCommandRule {
    pub fn literal(literal: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            pattern: RulePattern::Literal(literal.into()),
            active: true,
        }
    }

    pub fn prefix(prefix: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            pattern: RulePattern::Prefix(prefix.into()),
            active: true,
        }
    }

    pub fn regex(pattern: &str, description: impl Into<String>) -> Option<Self> {
        let re = regex::Regex::new(pattern).ok()?;
        Some(Self {
            description: description.into(),
            pattern: RulePattern::Regex(re),
            active: true,
        })
    }

    fn matches_token(&self, token: &str) -> bool {
        match &self.pattern {
            RulePattern::Literal(l) => token == l,
            RulePattern::Prefix(p) => token.starts_with(p.as_str()),
            RulePattern::Regex(r) => r.is_match(token),
        }
    }

    fn matches_whole(&self, command: &str) -> bool {
        match &self.pattern {
            RulePattern::Literal(l) => command == l,
            RulePattern::Prefix(p) => command.starts_with(p.as_str()),
            RulePattern::Regex(r) => r.is_match(command),
        }
    }
}

/// The default rule set: destructive filesystem/VCS commands and anything
/// that exfiltrates credentials or rewrites history.
pub fn default_sensitive_rules() -> Vec<SensitiveCommandRule> {
    let mut rules = vec![
        SensitiveCommandRule::prefix("rm -rf", "recursive force delete"),
        SensitiveCommandRule::prefix("rm -fr", "recursive force delete"),
        SensitiveCommandRule::literal("git push --force", "force push can overwrite remote history"),
        SensitiveCommandRule::literal("git push -f", "force push can overwrite remote history"),
        SensitiveCommandRule::prefix("git reset --hard", "discards uncommitted work"),
        SensitiveCommandRule::prefix("git clean -f", "deletes untracked files"),
        SensitiveCommandRule::prefix("sudo", "elevated privileges"),
        SensitiveCommandRule::prefix("chmod -R 777", "world-writable permissions"),
        SensitiveCommandRule::prefix("curl", "network egress — may exfiltrate data"),
        SensitiveCommandRule::prefix("wget", "network egress — may exfiltrate data"),
        SensitiveCommandRule::prefix("dd if=", "raw disk write"),
        SensitiveCommandRule::prefix(":(){ :|:& };:", "fork bomb"),
    ];
    if let Some(r) = SensitiveCommandRule::regex(r">\s*/dev/sd[a-z]", "raw device write") {
        rules.push(r);
    }
    rules
}

/// A shell command's tokens, quote-aware. Splits on unquoted whitespace only.
fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// The result of classifying a shell command against the sensitive rule set.
#[derive(Clone, Debug)]
pub struct SensitivityMatch {
    pub matched_pattern: String,
    pub description: String,
}

/// Classifies a shell command against a rule set. First match wins, checking
/// the whole command and then each whitespace/quote-aware token.
pub fn classify_shell_command(
    command: &str,
    rules: &[SensitiveCommandRule],
) -> Option<SensitivityMatch> {
    let active: Vec<&SensitiveCommandRule> = rules.iter().filter(|r| r.active).collect();
    for rule in &active {
        if rule.matches_whole(command) {
            return Some(SensitivityMatch {
                matched_pattern: command.to_string(),
                description: rule.description.clone(),
            });
        }
    }
    for token in tokenize(command) {
        for rule in &active {
            if rule.matches_token(&token) {
                return Some(SensitivityMatch {
                    matched_pattern: token.clone(),
                    description: rule.description.clone(),
                });
            }
        }
    }
    None
}

/// Confirmation options offered to the human for a gated tool call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmationChoice {
    ApproveOnce,
    ApproveAlways,
    RejectWithReply(String),
    Reject,
}

/// What the gate decided for a tool call.
#[derive(Clone, Debug)]
pub enum PermissionDecision {
    Allow,
    Deny { reason: String },
}

/// Everything a UI needs to render a confirmation prompt.
#[derive(Clone, Debug)]
pub struct ConfirmationRequest {
    pub tool_name: String,
    pub arguments: Value,
    /// Other tool names batched in the same assistant turn, if any.
    pub batched_with: Vec<String>,
    pub sensitivity: Option<SensitivityMatch>,
    /// `approve_always` is withheld when a sensitive match is present.
    pub allow_always_option: bool,
}

/// Callback the embedding UI implements to ask the human for a decision.
#[async_trait::async_trait]
pub trait ConfirmationSink: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationChoice;
}

/// A `ConfirmationSink` that always approves once — used for YOLO mode and
/// headless (`--ask`/`--task`) invocations where no human is attached.
pub struct AutoApproveSink;

#[async_trait::async_trait]
impl ConfirmationSink for AutoApproveSink {
    async fn confirm(&self, _request: ConfirmationRequest) -> ConfirmationChoice {
        ConfirmationChoice::ApproveOnce
    }
}

/// A confirmation request paired with the channel its answer must arrive on.
/// `ChannelConfirmationSink` hands these to an external consumer (a TUI event
/// loop, a gateway's WS/SSE bridge) that renders the prompt and is the only
/// party that knows how to collect the human's actual decision.
pub struct PendingConfirmation {
    pub request: ConfirmationRequest,
    pub respond: tokio::sync::oneshot::Sender<ConfirmationChoice>,
}

/// A `ConfirmationSink` that forwards every request to an external consumer
/// over an unbounded channel and awaits the decision on a oneshot reply
/// channel per request. This is what interactive front ends (the TUI, the
/// gateway's WS/SSE transports) install in place of [`AutoApproveSink`] so
/// `terminal-execute`/sensitive-command confirmations actually reach a human
/// instead of silently auto-approving.
pub struct ChannelConfirmationSink {
    tx: tokio::sync::mpsc::UnboundedSender<PendingConfirmation>,
}

impl ChannelConfirmationSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<PendingConfirmation>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl ConfirmationSink for ChannelConfirmationSink {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationChoice {
        let (respond, rx) = tokio::sync::oneshot::channel();
        if self.tx.send(PendingConfirmation { request, respond }).is_err() {
            // Consumer side has gone away (shutdown mid-turn) — fail closed.
            return ConfirmationChoice::Reject;
        }
        rx.await.unwrap_or(ConfirmationChoice::Reject)
    }
}

/// Per-(working directory) set of tool names the user has "always approved".
#[derive(Default)]
struct PermissionSet {
    auto_approved: HashSet<String>,
}

/// The permission gate (C5): decides whether a tool call proceeds, consulting
/// the sensitive-command classifier and, when needed, an interactive
/// confirmation sink.
pub struct PermissionGate {
    rules: Vec<SensitiveCommandRule>,
    approved: RwLock<PermissionSet>,
    yolo: std::sync::atomic::AtomicBool,
    sink: Box<dyn ConfirmationSink>,
}

impl PermissionGate {
    pub fn new(sink: impl ConfirmationSink + 'static) -> Self {
        Self {
            rules: default_sensitive_rules(),
            approved: RwLock::new(PermissionSet::default()),
            yolo: std::sync::atomic::AtomicBool::new(false),
            sink: Box::new(sink),
        }
    }

    pub fn with_rules(mut self, rules: Vec<SensitiveCommandRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn set_yolo(&self, on: bool) {
        self.yolo.store(on, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_yolo(&self) -> bool {
        self.yolo.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn load_always_approved(&self, names: impl IntoIterator<Item = String>) {
        let mut set = self.approved.write().unwrap();
        set.auto_approved.extend(names);
    }

    pub fn always_approved(&self) -> Vec<String> {
        self.approved
            .read()
            .unwrap()
            .auto_approved
            .iter()
            .cloned()
            .collect()
    }

    /// Extracts the shell command string from a `terminal-execute`-shaped
    /// argument map, if present.
    fn shell_command_of<'a>(tool_name: &str, args: &'a Value) -> Option<&'a str> {
        if tool_name != "bash" && tool_name != "terminal-execute" {
            return None;
        }
        args.get("command").and_then(|v| v.as_str())
    }

    /// Evaluate the decision table in §4.5: auto-approved/YOLO short-circuits
    /// for non-sensitive calls; sensitive shell commands and everything else
    /// ask the confirmation sink.
    pub async fn gate(
        &self,
        tool_name: &str,
        args: &Value,
        batched_with: &[String],
    ) -> PermissionDecision {
        let sensitivity = Self::shell_command_of(tool_name, args)
            .and_then(|cmd| classify_shell_command(cmd, &self.rules));

        let auto_approved = self
            .approved
            .read()
            .unwrap()
            .auto_approved
            .contains(tool_name);

        if sensitivity.is_none() && (auto_approved || self.is_yolo()) {
            return PermissionDecision::Allow;
        }

        let request = ConfirmationRequest {
            tool_name: tool_name.to_string(),
            arguments: args.clone(),
            batched_with: batched_with.to_vec(),
            allow_always_option: sensitivity.is_none(),
            sensitivity,
        };

        match self.sink.confirm(request).await {
            ConfirmationChoice::ApproveOnce => PermissionDecision::Allow,
            ConfirmationChoice::ApproveAlways => {
                self.approved
                    .write()
                    .unwrap()
                    .auto_approved
                    .insert(tool_name.to_string());
                PermissionDecision::Allow
            }
            ConfirmationChoice::RejectWithReply(reason) => PermissionDecision::Deny { reason },
            ConfirmationChoice::Reject => PermissionDecision::Deny {
                reason: "rejected by user".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_prefix_rule() {
        let rules = default_sensitive_rules();
        let m = classify_shell_command("rm -rf /tmp/build", &rules).unwrap();
        assert!(m.description.contains("recursive"));
    }

    #[test]
    fn classifies_token_within_pipeline() {
        let rules = default_sensitive_rules();
        let m = classify_shell_command("echo hi && sudo reboot", &rules).unwrap();
        assert!(m.description.contains("elevated"));
    }

    #[test]
    fn benign_command_is_unmatched() {
        let rules = default_sensitive_rules();
        assert!(classify_shell_command("ls -la", &rules).is_none());
    }

    #[test]
    fn quoted_whitespace_does_not_split_tokens() {
        let tokens = tokenize(r#"echo "hello world" foo"#);
        assert_eq!(tokens, vec!["echo", "hello world", "foo"]);
    }

    #[tokio::test]
    async fn yolo_mode_allows_non_sensitive() {
        let gate = PermissionGate::new(AutoApproveSink);
        gate.set_yolo(true);
        let decision = gate
            .gate("read", &serde_json::json!({"path": "a.txt"}), &[])
            .await;
        assert!(matches!(decision, PermissionDecision::Allow));
    }

    #[tokio::test]
    async fn yolo_mode_still_gates_sensitive_commands() {
        struct RejectSink;
        #[async_trait::async_trait]
        impl ConfirmationSink for RejectSink {
            async fn confirm(&self, _r: ConfirmationRequest) -> ConfirmationChoice {
                ConfirmationChoice::Reject
            }
        }
        let gate = PermissionGate::new(RejectSink);
        gate.set_yolo(true);
        let decision = gate
            .gate("bash", &serde_json::json!({"command": "rm -rf /"}), &[])
            .await;
        assert!(matches!(decision, PermissionDecision::Deny { .. }));
    }

    #[tokio::test]
    async fn approve_always_persists_for_session() {
        let gate = PermissionGate::new(AutoApproveSinkAlways);
        let d1 = gate
            .gate("write", &serde_json::json!({"path": "x"}), &[])
            .await;
        assert!(matches!(d1, PermissionDecision::Allow));
        assert!(gate.always_approved().contains(&"write".to_string()));
    }

    struct AutoApproveSinkAlways;
    #[async_trait::async_trait]
    impl ConfirmationSink for AutoApproveSinkAlways {
        async fn confirm(&self, _r: ConfirmationRequest) -> ConfirmationChoice {
            ConfirmationChoice::ApproveAlways
        }
    }

    #[tokio::test]
    async fn channel_sink_round_trips_decision() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let gate = PermissionGate::new(ChannelConfirmationSink::new(tx));

        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.expect("a confirmation request");
            assert_eq!(pending.request.tool_name, "bash");
            let _ = pending.respond.send(ConfirmationChoice::ApproveOnce);
        });

        let decision = gate
            .gate("bash", &serde_json::json!({"command": "rm -rf /"}), &[])
            .await;
        assert!(matches!(decision, PermissionDecision::Allow));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn channel_sink_fails_closed_when_consumer_dropped() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let gate = PermissionGate::new(ChannelConfirmationSink::new(tx));
        let decision = gate
            .gate("write", &serde_json::json!({"path": "x"}), &[])
            .await;
        assert!(matches!(decision, PermissionDecision::Deny { .. }));
    }
}
