//! Sanitization of strings destined for line-structured records.
//!
//! Error messages and captured remote output flow into the deployment
//! summary and the line-oriented failure-tracking file. A stray carriage
//! return or newline inside a stored message would corrupt those records,
//! so everything is sanitized on intake.
//!
//! # Example
//!
//! ```
//! use confship_output_sanitizer::sanitize_line;
//!
//! let msg = sanitize_line("mkdir failed:\r\npermission denied\n");
//! assert_eq!(msg, "mkdir failed: permission denied");
//! ```

/// True if the string contains a carriage return or line feed.
pub fn has_line_breaks(s: &str) -> bool {
    s.contains('\r') || s.contains('\n')
}

/// Collapse CR/LF sequences into single spaces and trim the result.
///
/// `\r\n` pairs collapse to one space so Windows-style breaks do not
/// produce doubled whitespace.
pub fn sanitize_line(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push(' ');
            }
            '\n' => out.push(' '),
            other => out.push(other),
        }
    }
    out.trim().to_string()
}

/// Keep at most the last `n` lines of captured output.
///
/// Used when attaching remote stderr to an error message: the interesting
/// part of a failed command is almost always at the end.
pub fn tail_lines(s: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sanitize_line_collapses_crlf_pairs() {
        assert_eq!(sanitize_line("a\r\nb"), "a b");
        assert_eq!(sanitize_line("a\rb"), "a b");
        assert_eq!(sanitize_line("a\nb"), "a b");
    }

    #[test]
    fn sanitize_line_trims_leading_and_trailing_breaks() {
        assert_eq!(sanitize_line("\n\nfailed\n"), "failed");
    }

    #[test]
    fn sanitize_line_passes_clean_strings_through() {
        assert_eq!(sanitize_line("already clean"), "already clean");
    }

    #[test]
    fn has_line_breaks_detects_either_kind() {
        assert!(has_line_breaks("a\nb"));
        assert!(has_line_breaks("a\rb"));
        assert!(!has_line_breaks("ab"));
    }

    #[test]
    fn tail_lines_keeps_the_end() {
        let out = "one\ntwo\nthree\nfour";
        assert_eq!(tail_lines(out, 2), "three\nfour");
        assert_eq!(tail_lines(out, 10), out);
        assert_eq!(tail_lines(out, 0), "");
    }

    proptest! {
        #[test]
        fn sanitized_output_never_has_line_breaks(s in ".*") {
            prop_assert!(!has_line_breaks(&sanitize_line(&s)));
        }

        #[test]
        fn sanitize_is_idempotent(s in ".*") {
            let once = sanitize_line(&s);
            prop_assert_eq!(sanitize_line(&once), once);
        }
    }
}
