//! Conversion between symbolic and numeric permission forms.
//!
//! Remote stat output reports permissions symbolically (`rwxr-xr-x`);
//! metadata headers and chmod use the numeric form (755). The numeric form
//! keeps octal digit semantics in a decimal integer, matching what
//! `chmod 755` expects on the wire.

/// Convert a symbolic permission string to its numeric form.
///
/// Accepts 6 to 9 characters; shorter strings are treated as
/// right-aligned (missing leading positions read as `-`). A leading
/// file-type character (as in `-rw-r--r--`) is stripped when present.
/// Returns `None` for any other shape.
pub fn symbolic_to_numeric(symbolic: &str) -> Option<u32> {
    if !symbolic.is_ascii() {
        return None;
    }
    let s = strip_type_char(symbolic);
    if s.len() < 6 || s.len() > 9 {
        return None;
    }

    let padded: String = "-".repeat(9 - s.len()) + s;
    let chars: Vec<char> = padded.chars().collect();

    let mut value = 0u32;
    for triple in 0..3 {
        let mut digit = 0u32;
        for (offset, weight) in [(0, 4u32), (1, 2), (2, 1)] {
            match chars[triple * 3 + offset] {
                'r' if offset == 0 => digit += weight,
                'w' if offset == 1 => digit += weight,
                'x' | 's' | 't' if offset == 2 => digit += weight,
                'S' | 'T' | '-' => {}
                _ => return None,
            }
        }
        value = value * 10 + digit;
    }

    Some(value)
}

/// Convert numeric permissions (0..=777, octal digit semantics) to the
/// 9-character symbolic form.
pub fn numeric_to_symbolic(numeric: u32) -> Option<String> {
    if numeric > 777 {
        return None;
    }
    let digits = [numeric / 100, (numeric / 10) % 10, numeric % 10];
    if digits.iter().any(|d| *d > 7) {
        return None;
    }

    let mut out = String::with_capacity(9);
    for digit in digits {
        out.push(if digit & 4 != 0 { 'r' } else { '-' });
        out.push(if digit & 2 != 0 { 'w' } else { '-' });
        out.push(if digit & 1 != 0 { 'x' } else { '-' });
    }
    Some(out)
}

/// True when the numeric form is expressible as permissions (each decimal
/// digit 0..=7, at most four digits for setuid/setgid/sticky prefixes).
pub fn is_valid_numeric(numeric: u32) -> bool {
    if numeric > 7777 {
        return false;
    }
    let mut n = numeric;
    while n > 0 {
        if n % 10 > 7 {
            return false;
        }
        n /= 10;
    }
    true
}

fn strip_type_char(s: &str) -> &str {
    if s.len() == 10 {
        &s[1..]
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn common_permission_strings_convert() {
        assert_eq!(symbolic_to_numeric("rwxr-xr-x"), Some(755));
        assert_eq!(symbolic_to_numeric("rw-r--r--"), Some(644));
        assert_eq!(symbolic_to_numeric("rwx------"), Some(700));
        assert_eq!(symbolic_to_numeric("---------"), Some(0));
    }

    #[test]
    fn stat_type_prefix_is_stripped() {
        assert_eq!(symbolic_to_numeric("-rw-r--r--"), Some(644));
        assert_eq!(symbolic_to_numeric("drwxr-xr-x"), Some(755));
    }

    #[test]
    fn short_strings_are_right_aligned() {
        // Six characters cover the group and other triples only.
        assert_eq!(symbolic_to_numeric("r--r--"), Some(44));
    }

    #[test]
    fn invalid_lengths_are_rejected() {
        assert_eq!(symbolic_to_numeric(""), None);
        assert_eq!(symbolic_to_numeric("rwxrx"), None);
        assert_eq!(symbolic_to_numeric("rwxr-xr-x-x"), None);
    }

    #[test]
    fn invalid_characters_are_rejected() {
        assert_eq!(symbolic_to_numeric("qwxr-xr-x"), None);
        assert_eq!(symbolic_to_numeric("rwxr-xr-w"), None);
    }

    #[test]
    fn setuid_markers_read_as_execute() {
        assert_eq!(symbolic_to_numeric("rwsr-xr-x"), Some(755));
        assert_eq!(symbolic_to_numeric("rwSr-xr-x"), Some(655));
        assert_eq!(symbolic_to_numeric("rwxr-xr-t"), Some(755));
    }

    #[test]
    fn numeric_to_symbolic_renders_triples() {
        assert_eq!(numeric_to_symbolic(755).as_deref(), Some("rwxr-xr-x"));
        assert_eq!(numeric_to_symbolic(644).as_deref(), Some("rw-r--r--"));
        assert_eq!(numeric_to_symbolic(0).as_deref(), Some("---------"));
        assert_eq!(numeric_to_symbolic(790), None);
        assert_eq!(numeric_to_symbolic(1000), None);
    }

    #[test]
    fn is_valid_numeric_allows_sticky_prefixes() {
        assert!(is_valid_numeric(644));
        assert!(is_valid_numeric(4755));
        assert!(!is_valid_numeric(7778));
        assert!(!is_valid_numeric(888));
    }

    proptest! {
        // Round-trip law: symbolic_to_numeric is a left inverse of
        // numeric_to_symbolic for every valid value.
        #[test]
        fn numeric_symbolic_roundtrip(a in 0u32..8, b in 0u32..8, c in 0u32..8) {
            let n = a * 100 + b * 10 + c;
            let symbolic = numeric_to_symbolic(n).unwrap();
            prop_assert_eq!(symbolic_to_numeric(&symbolic), Some(n));
        }
    }
}
