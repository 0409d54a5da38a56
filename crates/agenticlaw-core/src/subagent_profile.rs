//! Sub-agent profiles (C10): the id/system-prompt/tool-allowlist triple that
//! turns a generic spawn primitive into a named tool the main agent can call.
//! Data-only, same reasoning as `runtime_config`'s `SensitiveRuleSpec` — the
//! tool layer builds the restricted registry, this crate just describes it.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// A named sub-agent: what it's for, what it's told, what it's allowed to touch.
#[derive(Debug, Clone, Deserialize)]
pub struct SubAgentProfile {
    /// Used as the tool name the main agent calls, e.g. `id = "explore"` is
    /// exposed as a tool named `agent_explore`.
    pub id: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    /// User-defined profiles with an id matching a built-in override it.
    #[serde(skip, default)]
    pub builtin: bool,
}

/// Read-only reconnaissance: can search and read but never writes or shells out.
fn explore_profile() -> SubAgentProfile {
    SubAgentProfile {
        id: "explore".to_string(),
        name: "Explorer".to_string(),
        description: "Searches and reads the codebase to answer a question or locate code. \
            Cannot modify anything."
            .to_string(),
        system_prompt: "You are a focused, read-only research agent. Find what was asked, \
            cite file paths and line numbers, and report concisely. You cannot write, edit, \
            or run shell commands — if the task requires a change, say so and describe it \
            instead of attempting it."
            .to_string(),
        allowed_tools: vec![
            "read".to_string(),
            "glob".to_string(),
            "grep".to_string(),
            "code_search".to_string(),
        ],
        builtin: true,
    }
}

/// Full-access worker: same tool suite as a top-level agent, including the
/// ability to spawn further children.
fn general_profile() -> SubAgentProfile {
    SubAgentProfile {
        id: "general".to_string(),
        name: "General".to_string(),
        description: "Performs a scoped task end to end: reads, writes, edits, and runs \
            shell commands as needed. Can spawn further sub-agents for sub-tasks."
            .to_string(),
        system_prompt: "You are a focused agent working on a single delegated task. Read the \
            files you need, make the changes required, and verify your work. Report what you \
            did and what changed."
            .to_string(),
        allowed_tools: vec![
            "read".to_string(),
            "glob".to_string(),
            "grep".to_string(),
            "code_search".to_string(),
            "write".to_string(),
            "edit".to_string(),
            "bash".to_string(),
            "notebook".to_string(),
            "todo".to_string(),
            "spawn".to_string(),
        ],
        builtin: true,
    }
}

/// The profiles shipped with the runtime, present even with no config at all.
pub fn builtin_profiles() -> Vec<SubAgentProfile> {
    vec![explore_profile(), general_profile()]
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    id: String,
    name: String,
    description: String,
    system_prompt: String,
    allowed_tools: Vec<String>,
}

fn read_profile(path: &Path) -> Option<SubAgentProfile> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| tracing::warn!("sub-agent profile {}: {}", path.display(), e))
        .ok()?;
    let parsed: ProfileFile = toml::from_str(&text)
        .map_err(|e| tracing::warn!("sub-agent profile {}: {}", path.display(), e))
        .ok()?;
    Some(SubAgentProfile {
        id: parsed.id,
        name: parsed.name,
        description: parsed.description,
        system_prompt: parsed.system_prompt,
        allowed_tools: parsed.allowed_tools,
        builtin: false,
    })
}

/// Built-in profiles, overridden by any user-defined profile sharing an id.
/// `paths` come from `RuntimeConfig::subagent_profile_paths` — each entry is
/// either a single profile TOML file or a directory of them.
pub fn load_profiles(paths: &[PathBuf]) -> Vec<SubAgentProfile> {
    let mut by_id: std::collections::BTreeMap<String, SubAgentProfile> = builtin_profiles()
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            if let Ok(entries) = std::fs::read_dir(path) {
                for entry in entries.flatten() {
                    let p = entry.path();
                    if p.extension().and_then(|e| e.to_str()) == Some("toml") {
                        files.push(p);
                    }
                }
            }
        } else {
            files.push(path.clone());
        }
    }

    for file in files {
        if let Some(profile) = read_profile(&file) {
            by_id.insert(profile.id.clone(), profile);
        }
    }

    by_id.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_a_read_only_and_a_full_access_profile() {
        let profiles = builtin_profiles();
        assert!(profiles.iter().any(|p| p.id == "explore" && !p.allowed_tools.contains(&"write".to_string())));
        assert!(profiles.iter().any(|p| p.id == "general" && p.allowed_tools.contains(&"bash".to_string())));
    }

    #[test]
    fn load_profiles_with_no_paths_returns_builtins_only() {
        let profiles = load_profiles(&[]);
        assert_eq!(profiles.len(), builtin_profiles().len());
    }

    #[test]
    fn user_profile_overrides_builtin_with_same_id() {
        let dir = tempfile_dir();
        std::fs::write(
            dir.join("explore.toml"),
            r#"
            id = "explore"
            name = "Custom Explorer"
            description = "overridden"
            system_prompt = "custom"
            allowed_tools = ["read"]
            "#,
        )
        .unwrap();

        let profiles = load_profiles(&[dir.clone()]);
        let explore = profiles.iter().find(|p| p.id == "explore").unwrap();
        assert_eq!(explore.name, "Custom Explorer");
        assert!(!explore.builtin);

        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("agenticlaw-profile-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
