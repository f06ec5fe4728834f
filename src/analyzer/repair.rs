//! Recovery pass for truncated model JSON.
//!
//! The service occasionally cuts output mid-document. The repair here is a
//! bracket-balance scan that tolerates strings and escapes, closes an
//! unterminated string, and appends the missing closers. It is a recovery
//! layer, not a parser: the result gets exactly one reparse attempt.

/// Strip a surrounding Markdown code fence, if present.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line itself (possibly carrying a language tag)
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => return trimmed,
    };
    body.trim_end()
        .strip_suffix("```")
        .map(str::trim_end)
        .unwrap_or(body)
        .trim()
}

/// Close unterminated strings and unmatched `{`/`[` in truncated JSON.
///
/// Returns `None` when the input has nothing to repair (balanced already, or
/// broken in a way bracket closing cannot fix, like stray closers).
pub fn repair_json(raw: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in raw.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                // A closer that does not match its opener is beyond repair
                if stack.pop() != Some(ch) {
                    return None;
                }
            }
            _ => {}
        }
    }

    if !in_string && stack.is_empty() {
        return None;
    }

    let mut repaired = raw.trim_end().to_string();
    if in_string {
        // A trailing escape would swallow the closing quote
        if escaped {
            repaired.pop();
        }
        repaired.push('"');
    }
    // An interrupted `"key":` pair needs a value before the closer
    if let Some(tail) = repaired.rsplit(|c: char| c == ',' || c == '{').next() {
        if tail.trim_end().ends_with(':') {
            repaired.push_str("null");
        }
    }
    repaired = repaired.trim_end_matches(',').to_string();
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    Some(repaired)
}
