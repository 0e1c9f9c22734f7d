//! Guards around tool traffic.
//!
//! Three checkpoints: tool arguments before a tool runs, tool output before the
//! model reads it, and persona messages before they reach a stream. Output fed
//! back to the model has secrets redacted in place; a persona message that
//! would publish one is refused outright.

use regex_lite::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Tool output longer than this is cut before it enters the transcript.
const MAX_TOOL_OUTPUT_CHARS: usize = 50_000;

/// Longest message a persona may post in one call.
const MAX_MESSAGE_CHARS: usize = 4_000;

const MAX_ARGUMENT_DEPTH: usize = 10;
const MAX_ARGUMENT_STRING_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    AnthropicKey,
    OpenAiKey,
    GitHubToken,
    GitLabToken,
    SlackToken,
    AwsAccessKey,
    PrivateKey,
    Jwt,
}

impl SecretKind {
    pub fn description(self) -> &'static str {
        match self {
            SecretKind::AnthropicKey => "Anthropic API key",
            SecretKind::OpenAiKey => "OpenAI API key",
            SecretKind::GitHubToken => "GitHub token",
            SecretKind::GitLabToken => "GitLab personal access token",
            SecretKind::SlackToken => "Slack token",
            SecretKind::AwsAccessKey => "AWS access key",
            SecretKind::PrivateKey => "private key",
            SecretKind::Jwt => "JWT",
        }
    }
}

// Order matters: the Anthropic pattern must win over the generic `sk-` one.
const SECRET_PATTERNS: [(SecretKind, &str); 8] = [
    (SecretKind::AnthropicKey, r"sk-ant-[a-zA-Z0-9_\-]{20,}"),
    (SecretKind::OpenAiKey, r"sk-(?:proj-)?[a-zA-Z0-9]{20,}"),
    (SecretKind::GitHubToken, r"gh[pousr]_[a-zA-Z0-9]{36}"),
    (SecretKind::GitLabToken, r"glpat-[a-zA-Z0-9\-]{20,}"),
    (SecretKind::SlackToken, r"xox[abprs]-[a-zA-Z0-9\-]{10,}"),
    (SecretKind::AwsAccessKey, r"AKIA[0-9A-Z]{16}"),
    (
        SecretKind::PrivateKey,
        r"-----BEGIN (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----",
    ),
    (
        SecretKind::Jwt,
        r"eyJ[a-zA-Z0-9_-]{10,}\.eyJ[a-zA-Z0-9_-]{10,}\.[a-zA-Z0-9_-]*",
    ),
];

fn secret_patterns() -> &'static [(SecretKind, Regex)] {
    static COMPILED: OnceLock<Vec<(SecretKind, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        SECRET_PATTERNS
            .iter()
            .filter_map(|(kind, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*kind, re)),
                Err(e) => {
                    tracing::error!("Secret pattern for {:?} failed to compile: {}", kind, e);
                    None
                }
            })
            .collect()
    })
}

/// Kinds of secret present in `text`, in pattern order, without duplicates.
pub fn find_secrets(text: &str) -> Vec<SecretKind> {
    secret_patterns()
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(kind, _)| *kind)
        .collect()
}

/// Replace every secret with a `[REDACTED ...]` marker. Returns the kinds found.
pub fn redact_secrets(text: &str) -> (String, Vec<SecretKind>) {
    let mut redacted = text.to_string();
    let mut found = Vec::new();
    for (kind, re) in secret_patterns() {
        if re.is_match(&redacted) {
            let marker = format!("[REDACTED {}]", kind.description());
            redacted = re.replace_all(&redacted, marker.as_str()).into_owned();
            found.push(*kind);
        }
    }
    (redacted, found)
}

/// Reject arguments that nest too deeply or carry huge strings. The error
/// names the offending path.
pub fn check_arguments(params: &Value) -> Result<(), String> {
    fn walk(value: &Value, depth: usize, path: &str) -> Result<(), String> {
        if depth > MAX_ARGUMENT_DEPTH {
            return Err(format!(
                "arguments nest deeper than {} levels at {}",
                MAX_ARGUMENT_DEPTH, path
            ));
        }
        match value {
            Value::String(s) if s.len() > MAX_ARGUMENT_STRING_BYTES => Err(format!(
                "argument {} is {} bytes, limit is {}",
                path,
                s.len(),
                MAX_ARGUMENT_STRING_BYTES
            )),
            Value::Object(map) => map
                .iter()
                .try_for_each(|(key, val)| walk(val, depth + 1, &format!("{}.{}", path, key))),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, val)| walk(val, depth + 1, &format!("{}[{}]", path, i))),
            _ => Ok(()),
        }
    }
    walk(params, 1, "$")
}

/// Redact, truncate and delimit tool output for the transcript.
pub fn prepare_tool_output(tool_name: &str, output: &str) -> String {
    let (redacted, found) = redact_secrets(output);
    if !found.is_empty() {
        tracing::warn!(
            tool = %tool_name,
            kinds = ?found,
            "Redacted secrets from tool output"
        );
    }

    let total_chars = redacted.chars().count();
    let body = if total_chars > MAX_TOOL_OUTPUT_CHARS {
        let kept: String = redacted.chars().take(MAX_TOOL_OUTPUT_CHARS).collect();
        format!(
            "{}\n\n[OUTPUT TRUNCATED: {} of {} characters shown]",
            kept, MAX_TOOL_OUTPUT_CHARS, total_chars
        )
    } else {
        redacted
    };

    // Delimited so the model can tell fetched text apart from instructions.
    format!(
        "<tool_output name=\"{}\">\n{}\n</tool_output>",
        xml_escape(tool_name),
        body
    )
}

/// Vet a persona message before it is posted to a stream.
pub fn check_outgoing_message(content: &str) -> Result<(), String> {
    let chars = content.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(format!(
            "message is {} characters, limit is {}; split it or shorten it",
            chars, MAX_MESSAGE_CHARS
        ));
    }
    if content.contains("<tool_output") {
        return Err("message contains raw tool output; summarize it instead".to_string());
    }
    if let Some(kind) = find_secrets(content).first() {
        return Err(format!(
            "message would publish a {}",
            kind.description()
        ));
    }
    Ok(())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
