//! Context compression
//!
//! Shrinks an oversized prompt to a token budget through staged lossy
//! strategies: comment stripping, structural summarization of the middle,
//! then hard truncation. Later stages only run while the text is still
//! over budget, and the result is never longer than the input.

use once_cell::sync::Lazy;
use regex::Regex;

static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static DECLARATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:pub\s+)?(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|impl|mod|class|def|function|const|static|type|interface|export)\b",
    )
    .unwrap()
});

/// Marker inserted where hard truncation removed content.
pub const TRUNCATION_MARKER: &str = "[truncated]";

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

/// Compress `text` to roughly `budget_tokens`. Input that already fits is
/// returned unchanged.
pub fn compress(text: &str, budget_tokens: u32) -> String {
    if estimate_tokens(text) <= budget_tokens {
        return text.to_string();
    }

    let mut current = strip_comments(text);

    if estimate_tokens(&current) > budget_tokens * 7 / 10 {
        current = summarize_middle(&current);
    }

    if estimate_tokens(&current) > budget_tokens {
        current = truncate_chars(&current, budget_tokens);
    }

    if current.len() >= text.len() {
        return text.to_string();
    }
    current
}

/// Stage 1: drop comment lines and block comments, collapse blank runs.
/// Shebangs and `#[...]` attributes are not comments and survive.
fn strip_comments(text: &str) -> String {
    let without_blocks = BLOCK_COMMENT.replace_all(text, "");
    let kept: Vec<&str> = without_blocks
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("//") {
                return false;
            }
            if trimmed.starts_with('#') && !trimmed.starts_with("#!") && !trimmed.starts_with("#[")
            {
                return false;
            }
            true
        })
        .collect();
    let joined = kept.join("\n");
    BLANK_RUN.replace_all(&joined, "\n\n").into_owned()
}

/// Stage 2: keep the first and last quarter of lines verbatim; reduce the
/// middle half to its top-level declarations.
fn summarize_middle(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 8 {
        return text.to_string();
    }

    let quarter = lines.len() / 4;
    let head = &lines[..quarter];
    let tail = &lines[lines.len() - quarter..];
    let middle = &lines[quarter..lines.len() - quarter];

    let summary: Vec<&str> = middle
        .iter()
        .filter(|line| !line.starts_with(char::is_whitespace) && DECLARATION.is_match(line))
        .copied()
        .collect();

    let mut out = Vec::with_capacity(head.len() + summary.len() + tail.len());
    out.extend_from_slice(head);
    out.extend(summary);
    out.extend_from_slice(tail);
    out.join("\n")
}

/// Stage 3: keep the first and last 40% of the characters the budget
/// allows, with an explicit marker in between.
fn truncate_chars(text: &str, budget_tokens: u32) -> String {
    let budget_chars = (budget_tokens as usize) * 4;
    let keep = budget_chars * 2 / 5;

    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= keep * 2 {
        return text.to_string();
    }

    let head: String = chars[..keep].iter().collect();
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{}\n{}\n{}", head, TRUNCATION_MARKER, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_under_budget_is_unchanged() {
        let text = "fn main() {}\n";
        assert_eq!(compress(text, 100), text);
    }

    #[test]
    fn test_compressed_output_is_stable() {
        let text = "x\n".repeat(4000);
        let once = compress(&text, 200);
        assert!(estimate_tokens(&once) <= 200 + 10);
        // Output that fits the budget passes through untouched.
        let twice = compress(&once, 200);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_never_expands() {
        let text = "short but over budget";
        let out = compress(text, 1);
        assert!(out.len() <= text.len());
    }

    #[test]
    fn test_strips_comments_first() {
        let mut text = String::new();
        for i in 0..200 {
            text.push_str(&format!("// comment line {}\nlet x{} = {};\n", i, i, i));
        }
        let out = compress(&text, estimate_tokens(&text) - 1);
        assert!(!out.contains("// comment"));
        assert!(out.contains("let x0"));
    }

    #[test]
    fn test_keeps_attributes_and_shebang() {
        let stripped = strip_comments("#!/bin/sh\n#[derive(Debug)]\n# real comment\ncode\n");
        assert!(stripped.contains("#!/bin/sh"));
        assert!(stripped.contains("#[derive(Debug)]"));
        assert!(!stripped.contains("real comment"));
    }

    #[test]
    fn test_middle_summary_keeps_declarations() {
        let mut lines = Vec::new();
        for i in 0..40 {
            lines.push(format!("    body_{};", i));
        }
        // A top-level declaration in the middle half.
        lines.insert(20, "fn important() {".to_string());
        let text = lines.join("\n");

        let out = summarize_middle(&text);
        assert!(out.contains("fn important()"));
        assert!(out.contains("body_0"));
        assert!(out.contains("body_39"));
        assert!(!out.contains("body_20"));
    }

    #[test]
    fn test_hard_truncation_marks_the_gap() {
        let text = "a".repeat(10000);
        let out = compress(&text, 100);
        assert!(out.contains(TRUNCATION_MARKER));
        assert!(estimate_tokens(&out) <= 100);
    }
}
