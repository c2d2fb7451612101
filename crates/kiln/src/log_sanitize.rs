use std::sync::LazyLock;

use regex::Regex;

const MAX_LOG_CHARS: usize = 4096;

// CSI, OSC (BEL or ST terminated) and DCS/SOS/PM/APC strings, then lone ESC pairs.
static ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b[PX^_][^\x1b]*(?:\x1b\\)?|\x1b[@-_]?",
    )
    .expect("escape pattern is valid")
});

/// Strip terminal escape sequences and control characters from one line of
/// tool output, and cap its length.
pub fn sanitize_log_line(input: &str) -> String {
    let stripped = ESCAPES.replace_all(input, "");
    let mut out = String::with_capacity(stripped.len().min(MAX_LOG_CHARS));
    let mut count = 0usize;
    for c in stripped.chars() {
        let c = if c == '\t' { ' ' } else { c };
        if c.is_control() {
            continue;
        }
        if count == MAX_LOG_CHARS {
            out.push_str("...");
            break;
        }
        out.push(c);
        count += 1;
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_colors_titles_and_controls() {
        assert_eq!(
            sanitize_log_line("\x1b[1;31merror:\x1b[0m main.cc:3"),
            "error: main.cc:3"
        );
        assert_eq!(sanitize_log_line("\x1b]0;cmake\x07[ 50%] Building"), "[ 50%] Building");
        assert_eq!(sanitize_log_line("a\tb\x08c\r"), "a bc");
    }

    #[test]
    fn caps_very_long_lines() {
        let line = "x".repeat(MAX_LOG_CHARS + 10);
        let out = sanitize_log_line(&line);
        assert_eq!(out.len(), MAX_LOG_CHARS + 3);
        assert!(out.ends_with("..."));
    }
}
