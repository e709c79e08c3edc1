use serde_json::Value;

/// Which pass produced the recovered value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Parsed as-is (modulo a stripped code fence).
    Verbatim,
    /// Parsed after the lenient fix-up pass.
    Lenient,
    /// Parsed from the largest bracket-delimited substring.
    Substring,
}

/// A successfully recovered payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub value: Value,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepairError {
    #[error("payload is empty")]
    Empty,

    #[error("no structured content could be recovered: {0}")]
    Unrecoverable(String),
}

/// True if `raw` looks like it was meant to be an object or array payload.
pub fn looks_structured(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[') || trimmed.starts_with("```")
}

/// Recover a JSON value from `raw`, see the crate docs for the passes.
pub fn repair(raw: &str) -> Result<Repaired, RepairError> {
    let body = strip_code_fence(raw).trim();
    if body.is_empty() {
        return Err(RepairError::Empty);
    }

    let first_error = match serde_json::from_str::<Value>(body) {
        Ok(value) => {
            return Ok(Repaired {
                value,
                strategy: Strategy::Verbatim,
            });
        }
        Err(e) => e.to_string(),
    };

    if let Ok(value) = serde_json::from_str::<Value>(&close_unbalanced(body)) {
        return Ok(Repaired {
            value,
            strategy: Strategy::Lenient,
        });
    }

    for candidate in bracket_candidates(body) {
        let parsed = serde_json::from_str::<Value>(candidate)
            .or_else(|_| serde_json::from_str::<Value>(&close_unbalanced(candidate)));
        if let Ok(value) = parsed {
            // A bare scalar pulled out of prose is not a recovery.
            if value.is_object() || value.is_array() {
                return Ok(Repaired {
                    value,
                    strategy: Strategy::Substring,
                });
            }
        }
    }

    Err(RepairError::Unrecoverable(first_error))
}

/// Drop a surrounding Markdown code fence (```` ```json ... ``` ````).
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string ("json", "JSON", ...) up to the end of the line.
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest)
}

/// Lenient fix-up: trailing commas, unterminated strings, unbalanced closers.
///
/// Only structural characters outside of strings are touched. Stray closers
/// that match nothing on the stack are dropped.
pub(crate) fn close_unbalanced(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    strip_trailing_comma(&mut out);
                    stack.pop();
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    strip_trailing_comma(&mut out);

    while let Some(closer) = stack.pop() {
        strip_trailing_comma(&mut out);
        out.push(closer);
    }
    out
}

fn strip_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}

/// Bracket-delimited substrings of `body`, longest first.
///
/// For each opener kind the span runs from its first occurrence to the last
/// matching closer; without a closer the span runs to the end of input and is
/// left for the lenient pass to balance.
fn bracket_candidates(body: &str) -> Vec<&str> {
    let mut candidates: Vec<&str> = [('{', '}'), ('[', ']')]
        .iter()
        .filter_map(|&(open, close)| {
            let start = body.find(open)?;
            match body.rfind(close) {
                Some(end) if end > start => Some(&body[start..=end]),
                _ => Some(&body[start..]),
            }
        })
        .filter(|candidate| candidate.len() < body.len())
        .collect();
    candidates.sort_by_key(|c| std::cmp::Reverse(c.len()));
    candidates
}
