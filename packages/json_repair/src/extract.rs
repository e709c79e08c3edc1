use serde_json::Value;

/// Object keys tried, in order, for a displayable string.
pub const DISPLAY_KEYS: &[&str] = &[
    "translation",
    "translated_text",
    "text",
    "content",
    "message",
    "response",
    "answer",
    "output",
];

/// Find the human-readable string inside a structured payload.
///
/// Strings are returned as-is, objects are searched by [`DISPLAY_KEYS`]
/// (recursively, so `{"message": {"content": "x"}}` yields `"x"`), and arrays
/// join the text of their elements with newlines.
pub fn extract_display_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(map) => DISPLAY_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(extract_display_text),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(extract_display_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_string() {
        assert_eq!(extract_display_text(&json!("hi")).as_deref(), Some("hi"));
        assert_eq!(extract_display_text(&json!("  ")), None);
    }

    #[test]
    fn key_priority() {
        let v = json!({"text": "second", "translation": "first"});
        assert_eq!(extract_display_text(&v).as_deref(), Some("first"));
    }

    #[test]
    fn nested_object() {
        let v = json!({"message": {"role": "assistant", "content": "deep"}});
        assert_eq!(extract_display_text(&v).as_deref(), Some("deep"));
    }

    #[test]
    fn skips_empty_candidates() {
        let v = json!({"translation": "", "text": "fallback"});
        assert_eq!(extract_display_text(&v).as_deref(), Some("fallback"));
    }

    #[test]
    fn array_is_joined() {
        let v = json!([{"text": "a"}, 3, {"text": "b"}]);
        assert_eq!(extract_display_text(&v).as_deref(), Some("a\nb"));
    }

    #[test]
    fn nothing_displayable() {
        assert_eq!(extract_display_text(&json!({"n": 1})), None);
        assert_eq!(extract_display_text(&json!(null)), None);
    }
}
