//! Output Completion Detector (§4.B): pure, deterministic line classifiers.
//!
//! No state, no I/O. These functions answer "what kind of line is this" for
//! a single line of CDB/WinDbg output; `driver::execute` uses them to decide
//! when a command has finished.

use regex::Regex;
use std::sync::LazyLock;

/// `n:mmm>` or `n:mmm:procname>` — the debugger's ready-for-input prompt.
static PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+:\d{3}(:\w+)?>\s*.*$").expect("invalid prompt regex")
});

/// A syntax-error caret line, e.g. `^ Syntax error in 'foo'`.
static CARET_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\^").expect("invalid caret regex"));

/// `ModLoad:` / `ModUnload:` lines, case-insensitive.
static MOD_LOAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*mod(un)?load:").expect("invalid modload regex"));

/// Does this line look like the debugger's ready prompt?
#[must_use]
pub fn is_prompt(line: &str) -> bool {
    PROMPT.is_match(line)
}

/// Does this line unambiguously indicate the debugger finished processing
/// input and went idle, independent of the sentinel echo? (§4.A step 3,
/// glossary "ultra-safe completion marker".)
#[must_use]
pub fn is_ultra_safe_completion(line: &str) -> bool {
    CARET_ERROR.is_match(line) || MOD_LOAD.is_match(line)
}

/// Is `line` exactly the sentinel tag, after trimming whitespace?
#[must_use]
pub fn extract_sentinel(line: &str, tag: &str) -> bool {
    line.trim() == tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_matches_plain_thread_prompt() {
        assert!(is_prompt("0:000> "));
        assert!(is_prompt("   3:001>"));
    }

    #[test]
    fn prompt_matches_prompt_with_process_suffix() {
        assert!(is_prompt("0:000:notepad.exe> k"));
    }

    #[test]
    fn prompt_rejects_non_prompt_lines() {
        assert!(!is_prompt("ChildEBP RetAddr"));
        assert!(!is_prompt(""));
        assert!(!is_prompt("12> not a real prompt"));
    }

    #[test]
    fn ultra_safe_completion_matches_caret_errors() {
        assert!(is_ultra_safe_completion("^ Syntax error in 'bogus'"));
        assert!(is_ultra_safe_completion("   ^"));
    }

    #[test]
    fn ultra_safe_completion_matches_modload_case_insensitive() {
        assert!(is_ultra_safe_completion(
            "ModLoad: 00007ff8 ntdll.dll"
        ));
        assert!(is_ultra_safe_completion("modunload: 00007ff8 foo.dll"));
        assert!(is_ultra_safe_completion("MODLOAD: whatever"));
    }

    #[test]
    fn ultra_safe_completion_rejects_content_lines() {
        assert!(!is_ultra_safe_completion("rax=0000000000000000"));
    }

    #[test]
    fn sentinel_requires_exact_match_after_trim() {
        let tag = "sess-000001-deadbeef-42-ab12cd";
        assert!(extract_sentinel(&format!("  {tag}  "), tag));
        assert!(extract_sentinel(tag, tag));
        assert!(!extract_sentinel(&format!("{tag}x"), tag));
        assert!(!extract_sentinel("unrelated output", tag));
    }
}
