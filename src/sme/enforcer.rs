//! Patch format enforcement
//!
//! Model-emitted patches arrive in three payload forms (`diff_lines`,
//! `diff_b64`, `diff`) and frequently with broken JSON: raw newlines inside
//! the diff string, truncated arrays, mangled headers. This module salvages
//! what can be salvaged with a small character-level state machine and
//! normalizes the result into lines ready for `git apply`.

use base64::Engine as _;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PatchFormatError {
    #[error("failed to parse JSON: {0}")]
    BadJson(String),
    #[error("no diff payload found (expected diff_lines, diff_b64, or diff)")]
    NoPayload,
    #[error("diff malformed: {0}")]
    BadDiff(String),
}

fn hunk_header_re() -> Regex {
    Regex::new(r"^@@ -(\d+),(\d+) \+(\d+),(\d+) @@").unwrap()
}

/// Strict parse first; then two targeted salvages: keep the complete-string
/// prefix of a truncated `diff_lines` array, and re-escape raw control
/// characters inside a `"diff"` string value.
pub fn loose_json_parse(raw: &str) -> Result<Value, PatchFormatError> {
    // Models often wrap JSON in prose; isolate the outermost object.
    let candidate = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => raw,
    };

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Ok(value);
    }

    if let Some(value) = salvage_truncated_diff_lines(raw) {
        return Ok(value);
    }

    if let Some(value) = reescape_diff_string(candidate) {
        return Ok(value);
    }

    Err(PatchFormatError::BadJson(
        "unrecoverable JSON payload".to_string(),
    ))
}

/// Keep complete quoted strings from a truncated `diff_lines` array and
/// close the object after them.
fn salvage_truncated_diff_lines(raw: &str) -> Option<Value> {
    let marker = Regex::new(r#""diff_lines"\s*:\s*\["#).unwrap();
    let m = marker.find(raw)?;
    let array_start = m.end();

    let chars: Vec<char> = raw[array_start..].chars().collect();
    let mut lines: Vec<String> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '"' => {
                // Scan one string, honoring escapes.
                let mut j = i + 1;
                let mut escaped = false;
                let mut complete = false;
                while j < chars.len() {
                    if escaped {
                        escaped = false;
                    } else if chars[j] == '\\' {
                        escaped = true;
                    } else if chars[j] == '"' {
                        complete = true;
                        break;
                    }
                    j += 1;
                }
                if !complete {
                    break;
                }
                let literal: String = chars[i..=j].iter().collect();
                lines.push(literal);
                i = j + 1;
            }
            ' ' | ',' | '\n' | '\t' | '\r' => i += 1,
            _ => break,
        }
    }

    if lines.is_empty() {
        return None;
    }
    let reconstructed = format!(
        "{}\"diff_lines\":[{}]}}",
        &raw[..m.start()],
        lines.join(",")
    );
    serde_json::from_str(&reconstructed).ok()
}

/// Re-escape raw newlines/tabs inside the `"diff": "..."` value.
fn reescape_diff_string(raw: &str) -> Option<Value> {
    let marker = Regex::new(r#""diff"\s*:\s*""#).unwrap();
    let m = marker.find(raw)?;
    let start = m.end();

    let chars: Vec<char> = raw[start..].chars().collect();
    let mut out = String::new();
    let mut i = 0;
    let mut escaped = false;
    while i < chars.len() {
        let ch = chars[i];
        if escaped {
            out.push(ch);
            escaped = false;
        } else {
            match ch {
                '\\' => {
                    out.push(ch);
                    escaped = true;
                }
                '"' => break,
                '\n' => out.push_str("\\n"),
                '\r' => {}
                '\t' => out.push_str("\\t"),
                _ => out.push(ch),
            }
        }
        i += 1;
    }

    let fixed = format!("{}{}{}", &raw[..start], out, &raw[start..].chars().skip(i).collect::<String>());
    serde_json::from_str(&fixed).ok()
}

/// Extract diff lines from whichever payload form the model used.
pub fn to_diff_lines(obj: &Value) -> Result<Vec<String>, PatchFormatError> {
    if let Some(array) = obj.get("diff_lines").and_then(|v| v.as_array()) {
        return Ok(array
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect());
    }

    if let Some(encoded) = obj.get("diff_b64").and_then(|v| v.as_str()) {
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(bytes) => {
                if let Ok(text) = String::from_utf8(bytes) {
                    return Ok(text.lines().map(|l| l.to_string()).collect());
                }
            }
            Err(e) => warn!("failed to decode diff_b64: {e}"),
        }
    }

    if let Some(text) = obj.get("diff").and_then(|v| v.as_str()) {
        let text = text.replace("\r\n", "\n").replace("\\\"", "\"");
        let mut lines: Vec<String> = text.split('\n').map(|l| l.to_string()).collect();
        while lines.len() > 1 && lines.last().map(|l| l.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        return Ok(lines);
    }

    Err(PatchFormatError::NoPayload)
}

fn fix_headers(mut lines: Vec<String>, file_path: &str) -> Vec<String> {
    if lines.len() < 3 {
        return lines;
    }
    if !lines[0].starts_with("--- a/") && lines[0].contains("---") && lines[0].contains(file_path) {
        lines[0] = format!("--- a/{file_path}");
    }
    if !lines[1].starts_with("+++ b/") && lines[1].contains("+++") && lines[1].contains(file_path) {
        lines[1] = format!("+++ b/{file_path}");
    }
    lines
}

fn validate_headers(lines: &[String], path: &str) -> Result<(), PatchFormatError> {
    if lines.len() < 3 {
        return Err(PatchFormatError::BadDiff(format!(
            "diff too short: only {} lines",
            lines.len()
        )));
    }
    if !(lines[0].contains("---") && lines[0].ends_with(path)) {
        return Err(PatchFormatError::BadDiff(format!(
            "bad '---' header: '{}'",
            lines[0]
        )));
    }
    if !(lines[1].contains("+++") && lines[1].ends_with(path)) {
        return Err(PatchFormatError::BadDiff(format!(
            "bad '+++' header: '{}'",
            lines[1]
        )));
    }
    if !hunk_header_re().is_match(&lines[2]) && !lines[2].starts_with("@@") {
        return Err(PatchFormatError::BadDiff(format!(
            "bad @@ hunk header: '{}'",
            lines[2]
        )));
    }
    Ok(())
}

/// Recompute the `@@ -o,c +n,c @@` header by locating the first two context
/// lines in the target file and counting body line prefixes.
pub fn reanchor_hunk(lines: &[String], file_text: &str) -> Vec<String> {
    if lines.len() < 4 {
        return lines.to_vec();
    }
    let body = &lines[3..];

    let ctx: Vec<&str> = body
        .iter()
        .filter(|l| l.starts_with(' '))
        .map(|l| &l[1..])
        .collect();
    if ctx.len() < 2 {
        return lines.to_vec();
    }

    let file_lines: Vec<&str> = file_text.lines().collect();
    let needle = &ctx[..2];
    let anchor = (0..file_lines.len().saturating_sub(1))
        .find(|&i| file_lines[i] == needle[0] && file_lines[i + 1] == needle[1]);
    let Some(anchor_idx) = anchor else {
        return lines.to_vec();
    };

    let old_count = body
        .iter()
        .filter(|l| l.starts_with(' ') || l.starts_with('-'))
        .count();
    let new_count = body
        .iter()
        .filter(|l| l.starts_with(' ') || l.starts_with('+'))
        .count();

    let header = format!(
        "@@ -{},{} +{},{} @@",
        anchor_idx + 1,
        old_count,
        anchor_idx + 1,
        new_count
    );
    let mut out = vec![lines[0].clone(), lines[1].clone(), header];
    out.extend(body.iter().cloned());
    out
}

fn ensure_final_newline(mut lines: Vec<String>) -> Vec<String> {
    if lines.last().map(|l| !l.is_empty()).unwrap_or(false) {
        lines.push(String::new());
    }
    lines
}

/// Full pipeline: loose parse, payload extraction, header fixes, hunk
/// validation with re-anchoring, quote de-escaping, final newline.
pub fn enforce_and_sanitize(
    raw_response: &str,
    file_path: &str,
    file_text: &str,
) -> Result<Vec<String>, PatchFormatError> {
    let obj = loose_json_parse(raw_response)?;
    let mut lines = to_diff_lines(&obj)?;

    while lines.first().map(|l| l.is_empty()).unwrap_or(false) {
        lines.remove(0);
    }

    lines = fix_headers(lines, file_path);

    if let Err(first_error) = validate_headers(&lines, file_path) {
        if file_text.is_empty() {
            return Err(first_error);
        }
        lines = reanchor_hunk(&lines, file_text);
        validate_headers(&lines, file_path)?;
    }

    for line in lines.iter_mut().skip(3) {
        *line = line.replace("\\\"", "\"");
    }

    Ok(ensure_final_newline(lines))
}

/// Convert a well-formed diff string into normalized lines; idempotent on
/// already-normalized diffs.
pub fn normalize_diff(diff: &str) -> String {
    let normalized = diff.replace("\r\n", "\n");
    let mut lines: Vec<String> = normalized.split('\n').map(|l| l.to_string()).collect();
    while lines.len() > 1
        && lines.len() >= 2
        && lines[lines.len() - 1].is_empty()
        && lines[lines.len() - 2].is_empty()
    {
        lines.pop();
    }
    ensure_final_newline(lines).join("\n")
}
