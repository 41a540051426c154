//! Line-protocol escaping helpers exposed to scripts.

/// Backslash-escapes the characters that terminate tag keys and values:
/// comma, space and equals.
pub fn tag_escape(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ").replace('=', "\\=")
}

/// Doubles backslashes for string field values.
pub fn field_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
}
