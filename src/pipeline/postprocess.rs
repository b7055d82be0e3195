//! Post-processing: deterministic cleanup of model output.
//!
//! Even with explicit instructions, models wrap transcriptions in
//! ` ```text ` fences, keep writing past the stop marker, emit Windows line
//! endings, or sprinkle zero-width characters from the scan's text layer.
//! These rules fix that without touching content, so the fingerprint of two
//! transcriptions of the same pages matches and the structured extractor sees
//! clean input.
//!
//! ## Rule Order
//!
//! Fences are stripped before the stop marker is searched for (the marker is
//! usually inside the fence), and line endings are normalised before any
//! line-based rule runs.

use crate::prompts::STOP_MARKER;
use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to a raw OCR transcription.
///
/// Rules (applied in order):
/// 1. Strip outer code fences
/// 2. Cut at the stop marker
/// 3. Normalise line endings (CRLF → LF)
/// 4. Trim trailing whitespace per line
/// 5. Collapse 3+ consecutive blank lines down to 2
/// 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 7. Trim the whole text
pub fn clean_ocr_text(input: &str) -> String {
    let s = strip_outer_fences(input);
    let s = cut_at_stop_marker(&s);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    s.trim().to_string()
}

// ── Rule 1: Strip outer fences ───────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```(?:markdown|text|txt|plaintext)?\r?\n(.*?)\r?\n```\s*$").unwrap()
});

fn strip_outer_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Cut at stop marker ───────────────────────────────────────────────

fn cut_at_stop_marker(input: &str) -> String {
    match input.find(STOP_MARKER) {
        Some(idx) => input[..idx].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 3: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 6: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── JSON responses ───────────────────────────────────────────────────────────

static RE_JSON_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n?(.*?)\n?```$").unwrap());

/// Remove a ` ```json ` fence around a JSON body, if present.
pub fn strip_json_fences(input: &str) -> &str {
    let trimmed = input.trim();
    match RE_JSON_FENCES.captures(trimmed).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim(),
        None => trimmed,
    }
}

/// First `max_chars` characters of `input`, for log lines.
pub fn preview(input: &str, max_chars: usize) -> String {
    let mut chars = input.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}\u{2026}", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_outer_fences("```text\nCam thảo\nNgọt\n```"), "Cam thảo\nNgọt");
        assert_eq!(strip_outer_fences("```\nA\n```"), "A");
        assert_eq!(strip_outer_fences("no fences"), "no fences");
    }

    #[test]
    fn test_cut_at_stop_marker() {
        let input = format!("Trang 12\nHoàng kỳ\n{}\nrác sau marker", STOP_MARKER);
        assert_eq!(cut_at_stop_marker(&input), "Trang 12\nHoàng kỳ\n");
    }

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_collapse_blank_lines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\n\nb");
    }

    #[test]
    fn test_remove_invisible() {
        assert_eq!(remove_invisible_chars("Quế\u{200B}chi\u{FEFF}"), "Quếchi");
    }

    #[test]
    fn test_clean_full_pipeline() {
        let input = format!(
            "```text\nBÀI THUỐC   \r\n\r\n\r\n\r\n\r\nTứ vật thang\n{}\n```",
            STOP_MARKER
        );
        assert_eq!(clean_ocr_text(&input), "BÀI THUỐC\n\n\nTứ vật thang");
    }

    #[test]
    fn test_strip_json_fences() {
        assert_eq!(strip_json_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("Đương quy", 4), "Đươn\u{2026}");
        assert_eq!(preview("abc", 10), "abc");
    }
}
