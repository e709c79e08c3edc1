//! # JSON Repair
//!
//! Best-effort recovery of structured payloads that arrive truncated or
//! slightly malformed, typically the tail end of a streamed model response.
//!
//! Repair runs in three passes, stopping at the first one that parses:
//!
//! 1. the input verbatim (after stripping a Markdown code fence),
//! 2. a lenient pass that drops trailing commas, closes an unterminated string
//!    and balances unclosed braces/brackets,
//! 3. the largest bracket-delimited substring, parsed verbatim and then
//!    leniently.
//!
//! Everything is pure and synchronous; no I/O, no global state.
//!
//! ```rust
//! use json_repair::{repair, display_text};
//!
//! let fixed = repair(r#"{"translation": "Hola", "lang": "es",}"#).unwrap();
//! assert_eq!(fixed.value["translation"], "Hola");
//!
//! assert_eq!(
//!     display_text(r#"Sure! {"translation": "Hola mundo""#).as_deref(),
//!     Some("Hola mundo")
//! );
//! ```

mod extract;
mod repair;

pub use extract::{DISPLAY_KEYS, extract_display_text};
pub use repair::{RepairError, Repaired, Strategy, looks_structured, repair};

/// Repair `raw` and pull a human-readable string out of it.
///
/// Returns `None` when the text is not structured, cannot be repaired, or
/// holds nothing displayable. Callers are expected to fall back to `raw`.
pub fn display_text(raw: &str) -> Option<String> {
    let repaired = repair(raw).ok()?;
    extract_display_text(&repaired.value)
}
