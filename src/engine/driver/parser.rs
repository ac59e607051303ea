//! Ordered parser chains for agent output.
//!
//! Two chains, both first-match-wins:
//! - [`AddressChain`] reads the instance address from `instance new` output.
//! - [`LineParser`] classifies `task view --follow` lines into [`RunEvent`]s.
//!
//! The structured (JSON) strategies run first. The legacy text strategies
//! match the markdown-ish plain output of older CLI builds and live in their
//! own types so they can be dropped without touching the rest of the chain.

use regex::Regex;
use serde_json::Value;

use crate::engine::models::{RunEvent, RunEventType};

/// Extract the outermost JSON object embedded in a line.
/// Brace counting skips braces inside string literals.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_json_object(line: &str) -> Option<Value> {
    let candidate = extract_json_object(line)?;
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

// ── Instance address ─────────────────────────────────────────────────

pub trait AddressParser: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, line: &str) -> Option<String>;
}

/// `{"address": "127.0.0.1:50052"}` and the `instance_address`/`instance` spellings.
pub struct StructuredAddressParser;

impl AddressParser for StructuredAddressParser {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn parse(&self, line: &str) -> Option<String> {
        let value = parse_json_object(line)?;
        str_field(&value, &["address", "instance_address", "instance"]).map(str::to_string)
    }
}

/// `Address: 127.0.0.1:50052` as printed by the plain-text CLI.
pub struct LegacyAddressParser {
    pattern: Regex,
}

impl Default for LegacyAddressParser {
    fn default() -> Self {
        Self {
            pattern: Regex::new(r"(?i)\baddress:\s*([A-Za-z0-9.\-\[\]]+:\d+)")
                .expect("address pattern is a valid static regex"),
        }
    }
}

impl AddressParser for LegacyAddressParser {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn parse(&self, line: &str) -> Option<String> {
        self.pattern
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

pub struct AddressChain {
    parsers: Vec<Box<dyn AddressParser>>,
}

impl Default for AddressChain {
    fn default() -> Self {
        Self {
            parsers: vec![
                Box::new(StructuredAddressParser),
                Box::new(LegacyAddressParser::default()),
            ],
        }
    }
}

impl AddressChain {
    pub fn parse(&self, line: &str) -> Option<String> {
        self.parsers.iter().find_map(|p| {
            let found = p.parse(line);
            if let Some(ref address) = found {
                tracing::debug!(parser = p.name(), %address, "instance address parsed");
            }
            found
        })
    }
}

// ── Output lines ─────────────────────────────────────────────────────

pub trait LineClassifier: Send + Sync {
    fn name(&self) -> &'static str;
    fn classify(&self, line: &str) -> Option<RunEvent>;
}

/// JSON lines: either `{"type": "<event kind>", "message": ...}` or the CLI's
/// own `say`/`ask` message objects.
pub struct StructuredClassifier;

impl StructuredClassifier {
    fn from_say_ask(value: &Value) -> Option<RunEventType> {
        if let Some(ask) = value.get("ask").and_then(|v| v.as_str()) {
            return match ask {
                "plan_mode_respond" | "completion_result" => Some(RunEventType::TaskResponse),
                "tool" | "command" | "browser_action_launch" | "use_mcp_server" => {
                    Some(RunEventType::ApprovalRequired)
                }
                "api_req_failed" => Some(RunEventType::Error),
                _ => Some(RunEventType::Log),
            };
        }
        let say = value.get("say").and_then(|v| v.as_str())?;
        Some(match say {
            "completion_result" => RunEventType::TaskResponse,
            "error" => RunEventType::Error,
            "api_req_started" | "checkpoint_created" => RunEventType::Status,
            "diff" | "diff_error" => RunEventType::Diff,
            "tool" | "command" => RunEventType::Step,
            _ => RunEventType::Log,
        })
    }
}

impl LineClassifier for StructuredClassifier {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn classify(&self, line: &str) -> Option<RunEvent> {
        let value = parse_json_object(line)?;
        let event_type = match value.get("type").and_then(|t| t.as_str()) {
            Some(t) => match t.parse::<RunEventType>() {
                Ok(kind) => kind,
                // The CLI tags its own messages with type "say"/"ask".
                Err(_) => Self::from_say_ask(&value)?,
            },
            None => Self::from_say_ask(&value)?,
        };
        let message = str_field(&value, &["message", "text", "content"])
            .unwrap_or(line.trim())
            .to_string();
        Some(RunEvent::new(event_type, message).with_payload(value))
    }
}

const APPROVAL_PHRASES: &[&str] = &[
    "wants to execute",
    "approve?",
    "approve this action",
    "waiting for approval",
    "do you want to proceed",
    "wants to run",
    "wants to write",
    "wants to read",
    "allow this action",
    "### tool use request",
    "execute_command:",
    "write_to_file:",
    "read_file:",
];

/// Plain-text output markers from the `--output-format plain` view.
pub struct LegacyTextClassifier;

impl LineClassifier for LegacyTextClassifier {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn classify(&self, line: &str) -> Option<RunEvent> {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();

        let event_type = if trimmed.contains("### Task completed") {
            RunEventType::TaskResponse
        } else if trimmed.starts_with("### Error") {
            RunEventType::Error
        } else if APPROVAL_PHRASES.iter().any(|p| lower.contains(p)) {
            RunEventType::ApprovalRequired
        } else if trimmed.starts_with("diff --git")
            || trimmed.starts_with("@@ ")
            || trimmed.starts_with("+++ ")
            || trimmed.starts_with("--- ")
        {
            RunEventType::Diff
        } else if trimmed.starts_with("### ") || trimmed.starts_with("## ") {
            RunEventType::Step
        } else if trimmed.contains("Checkpoint created") || trimmed.contains("API request") {
            RunEventType::Status
        } else {
            return None;
        };
        Some(RunEvent::new(event_type, trimmed))
    }
}

/// Classifies output lines. Unmatched lines become `log` events and are
/// never dropped. Blank lines produce nothing.
pub struct LineParser {
    classifiers: Vec<Box<dyn LineClassifier>>,
}

impl Default for LineParser {
    fn default() -> Self {
        Self {
            classifiers: vec![Box::new(StructuredClassifier), Box::new(LegacyTextClassifier)],
        }
    }
}

impl LineParser {
    pub fn with_classifiers(classifiers: Vec<Box<dyn LineClassifier>>) -> Self {
        Self { classifiers }
    }

    pub fn parse_line(&self, line: &str) -> Option<RunEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let event = self
            .classifiers
            .iter()
            .find_map(|c| c.classify(trimmed))
            .unwrap_or_else(|| RunEvent::log(trimmed));
        Some(event)
    }
}

// ── Task summary ─────────────────────────────────────────────────────

const SUMMARY_TAIL_LINES: usize = 20;

/// Pull the human-readable result out of a plain `task view` dump.
///
/// Prefers the section after `### Task completed` (up to `### Progress`),
/// then the last non-empty lines, then a fixed message.
pub fn extract_task_summary(output: &str) -> String {
    let mut section = Vec::new();
    let mut capturing = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.contains("### Task completed") {
            capturing = true;
            section.clear();
            continue;
        }
        if capturing && trimmed.contains("### Progress") {
            break;
        }
        if capturing && !trimmed.is_empty() {
            section.push(trimmed);
        }
    }
    if !section.is_empty() {
        return section.join("\n");
    }

    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return "Task completed successfully".to_string();
    }
    let start = lines.len().saturating_sub(SUMMARY_TAIL_LINES);
    lines[start..].join("\n")
}
