//! LLM types for requests and streaming responses

use serde::{Deserialize, Serialize};

/// LLM request
#[derive(Clone, Debug, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<LlmTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: "claude-opus-4-6-20250929".to_string(),
            messages: Vec::new(),
            tools: None,
            max_tokens: Some(8192),
            temperature: None,
            system: None,
        }
    }
}

/// Message in LLM conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: LlmContent,
}

/// Message content - can be string or array of blocks
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LlmContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<String> for LlmContent {
    fn from(s: String) -> Self { LlmContent::Text(s) }
}

impl From<&str> for LlmContent {
    fn from(s: &str) -> Self { LlmContent::Text(s.to_string()) }
}

/// Content block types
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Tool definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Streaming delta from LLM
#[derive(Clone, Debug)]
pub enum StreamDelta {
    MessageStart { usage: Option<Usage> },
    Text(String),
    ReasoningStarted,
    Thinking(String),
    ReasoningSignature(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    /// Emitted once the provider closes the content block. `incomplete` is set
    /// when the stream ended before this event was seen naturally and the
    /// decoder is synthesizing it during shutdown (see `stream_decoder`).
    ToolCallEnd { id: String, incomplete: bool },
    Done { stop_reason: Option<String>, usage: Option<Usage> },
    Error(String),
}

/// Token usage
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Accumulated tool call from streaming
#[derive(Clone, Debug, Default)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl AccumulatedToolCall {
    /// Parses accumulated argument fragments, applying best-effort repair
    /// (stray XML parameter tags, unbalanced brackets/quotes, trailing commas)
    /// if the raw concatenation does not parse as-is.
    pub fn parse_arguments(&self) -> serde_json::Value {
        parse_tool_arguments(&self.arguments)
    }
}

/// Strips stray `<parameter>`/`</parameter>`-style tokens some providers emit
/// when producing JSON-like XML fragments for tool arguments.
pub fn strip_xml_contamination(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '<' {
            if let Some(end) = s[i..].find('>') {
                let tag = &s[i + 1..i + end];
                if tag.starts_with("parameter")
                    || tag.starts_with("/parameter")
                    || tag.starts_with("parameters")
                    || tag.starts_with("/parameters")
                {
                    for _ in 0..end {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Best-effort repair of a possibly-truncated or contaminated JSON object:
/// balances unmatched `{`/`[`/quotes and strips trailing commas before the
/// closing delimiter. Falls back to an empty object if repair still fails.
pub fn repair_json(raw: &str) -> serde_json::Value {
    let cleaned = strip_xml_contamination(raw.trim());
    if cleaned.is_empty() {
        return serde_json::json!({});
    }
    if let Ok(v) = serde_json::from_str(&cleaned) {
        return v;
    }
    let mut repaired = cleaned.clone();
    // Drop a dangling trailing comma before end-of-string.
    if let Some(trimmed) = repaired.trim_end().strip_suffix(',') {
        repaired = trimmed.to_string();
    }
    let mut depth_curly = 0i32;
    let mut depth_square = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for c in repaired.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth_curly += 1,
            '}' if !in_string => depth_curly -= 1,
            '[' if !in_string => depth_square += 1,
            ']' if !in_string => depth_square -= 1,
            _ => {}
        }
    }
    if in_string {
        repaired.push('"');
    }
    for _ in 0..depth_square.max(0) {
        repaired.push(']');
    }
    for _ in 0..depth_curly.max(0) {
        repaired.push('}');
    }
    serde_json::from_str(&repaired).unwrap_or_else(|_| serde_json::json!({}))
}

/// Parses concatenated tool-call argument fragments, repairing malformed or
/// truncated JSON rather than failing the whole tool call.
pub fn parse_tool_arguments(raw: &str) -> serde_json::Value {
    let cleaned = strip_xml_contamination(raw.trim());
    if cleaned.is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(&cleaned).unwrap_or_else(|_| repair_json(&cleaned))
}

/// Anthropic rejects a request where a `tool_use` block has no matching
/// `tool_result` in the following message (this happens when a turn was
/// cancelled or crashed mid-dispatch, per §4.1's incomplete-stream handling).
/// Walks the message list and drops any dangling `tool_use` block whose id
/// never shows up in a subsequent `tool_result`, and any `tool_result` whose
/// id was never emitted by a preceding `tool_use` — both directions of the
/// invariant in §3 ("every tool-call id referenced by a tool-result must
/// appear in a preceding assistant message").
pub fn validate_and_heal_messages(messages: &[LlmMessage]) -> Vec<LlmMessage> {
    let mut known_tool_use_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
    for m in messages {
        if let LlmContent::Blocks(blocks) = &m.content {
            for b in blocks {
                if let ContentBlock::ToolUse { id, .. } = b {
                    known_tool_use_ids.insert(id.clone());
                }
            }
        }
    }
    let mut answered: std::collections::HashSet<String> = std::collections::HashSet::new();
    for m in messages {
        if let LlmContent::Blocks(blocks) = &m.content {
            for b in blocks {
                if let ContentBlock::ToolResult { tool_use_id, .. } = b {
                    answered.insert(tool_use_id.clone());
                }
            }
        }
    }

    messages
        .iter()
        .filter_map(|m| {
            let LlmContent::Blocks(blocks) = &m.content else {
                return Some(m.clone());
            };
            let healed: Vec<ContentBlock> = blocks
                .iter()
                .filter(|b| match b {
                    ContentBlock::ToolUse { id, .. } => answered.contains(id),
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        known_tool_use_ids.contains(tool_use_id)
                    }
                    ContentBlock::Text { .. } => true,
                })
                .cloned()
                .collect();
            if healed.is_empty() && !blocks.is_empty() {
                // The whole message was dangling tool plumbing; drop it rather
                // than send an empty content array (Anthropic rejects those).
                return None;
            }
            Some(LlmMessage {
                role: m.role.clone(),
                content: LlmContent::Blocks(healed),
            })
        })
        .collect()
}

#[cfg(test)]
mod heal_tests {
    use super::*;

    #[test]
    fn drops_dangling_tool_use_without_result() {
        let messages = vec![LlmMessage {
            role: "assistant".to_string(),
            content: LlmContent::Blocks(vec![
                ContentBlock::Text { text: "ok".to_string() },
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "read".to_string(),
                    input: serde_json::json!({}),
                },
            ]),
        }];
        let healed = validate_and_heal_messages(&messages);
        let LlmContent::Blocks(blocks) = &healed[0].content else { panic!() };
        assert_eq!(blocks.len(), 1);
        assert!(matches!(blocks[0], ContentBlock::Text { .. }));
    }

    #[test]
    fn keeps_matched_pair() {
        let messages = vec![
            LlmMessage {
                role: "assistant".to_string(),
                content: LlmContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "read".to_string(),
                    input: serde_json::json!({}),
                }]),
            },
            LlmMessage {
                role: "user".to_string(),
                content: LlmContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "t1".to_string(),
                    content: "done".to_string(),
                    is_error: None,
                }]),
            },
        ];
        let healed = validate_and_heal_messages(&messages);
        assert_eq!(healed.len(), 2);
    }
}
