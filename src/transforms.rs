//! Coercions for header values.
//!
//! Asterisk reports everything as text. These helpers translate the common shapes into
//! native types, falling back to a caller-chosen sentinel when the value is absent or
//! unparsable.

/// Parses an integer header value, yielding `sentinel` on absence or garbage.
pub fn to_int(value: Option<&str>, sentinel: i64) -> i64 {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(sentinel)
}

/// Parses a floating-point header value, yielding `sentinel` on absence or garbage.
pub fn to_float(value: Option<&str>, sentinel: f64) -> f64 {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(sentinel)
}

/// Compares a header value against a truth token, typically `"yes"` or `"Enabled"`.
pub fn to_bool(value: Option<&str>, truth: &str) -> bool {
    value == Some(truth)
}

/// Interprets the `"yes"`/`"no"` convention used by most event headers.
pub fn yes_no(value: Option<&str>) -> bool {
    to_bool(value, "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_coercion_uses_sentinel() {
        assert_eq!(to_int(Some("2"), -1), 2);
        assert_eq!(to_int(Some(" 17 "), -1), 17);
        assert_eq!(to_int(Some("two"), -1), -1);
        assert_eq!(to_int(None, -1), -1);
    }

    #[test]
    fn float_coercion_uses_sentinel() {
        assert_eq!(to_float(Some("0.25"), -1.0), 0.25);
        assert_eq!(to_float(Some(""), -1.0), -1.0);
    }

    #[test]
    fn yes_no_convention() {
        assert!(yes_no(Some("yes")));
        assert!(!yes_no(Some("no")));
        assert!(!yes_no(None));
        assert!(to_bool(Some("Enabled"), "Enabled"));
    }
}
