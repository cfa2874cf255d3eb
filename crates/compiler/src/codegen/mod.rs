//! C code generation.
//!
//! Generation is a pure function from a [`Program`](crate::program::Program)
//! to a text buffer; nothing here touches the filesystem. Three units can be
//! produced:
//!
//! - `matcher.rs` — the matcher translation unit: identifier tables, state
//!   initialization, parameter hooks, and the `match_trail` scanning loop
//!   lowered as a labeled jump table over rule indices.
//! - `header.rs` — the companion header with the packed struct definitions
//!   and the aggregation/introspection inlines.
//! - `proto.rs` — the optional protobuf-c serialization unit.
//!
//! Everything iterates ordered containers, so compiling the same program
//! twice produces byte-identical output.

mod header;
mod matcher;
mod proto;
mod writer;

pub use header::generate_header;
pub use matcher::generate_matcher;
pub use proto::generate_proto;
pub(crate) use writer::Writer;

/// The infinite-window sentinel as spelled in generated text (2^64 - 1).
pub(crate) const EXPIRES_NEVER: &str = "UINT64_MAX";

/// Make an arbitrary string safe as a C identifier fragment.
///
/// ASCII alphanumerics pass through; every other byte becomes `_` followed
/// by two lowercase hex digits. Escaping the underscore itself keeps the
/// mapping injective: no escaped output can collide with a passed-through
/// character sequence.
pub fn escape_var_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            out.push('_');
            out.push_str(&format!("{:02x}", b));
        }
    }
    out
}

/// Quote a value as a C string literal (without the surrounding quotes).
pub(crate) fn c_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_escape_passthrough() {
        assert_eq!(escape_var_name("signup"), "signup");
        assert_eq!(escape_var_name("Value123"), "Value123");
    }

    #[test]
    fn test_escape_non_alphanumerics() {
        assert_eq!(escape_var_name("a-b"), "a_2db");
        assert_eq!(escape_var_name("a.b"), "a_2eb");
        assert_eq!(escape_var_name("a_b"), "a_5fb");
        assert_eq!(escape_var_name(" "), "_20");
    }

    #[test]
    fn test_escape_output_alphabet() {
        for s in ["web/checkout", "a b-c.d", "=<>!?", "x_y_z", "\u{7f}"] {
            let escaped = escape_var_name(s);
            assert!(
                escaped
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_'),
                "bad characters in {:?}",
                escaped
            );
        }
    }

    #[test]
    fn test_escape_injective_on_printable_ascii() {
        // Exhaustive over all two-character printable-ASCII strings.
        let mut seen = BTreeSet::new();
        for a in 0x20u8..0x7f {
            for b in 0x20u8..0x7f {
                let s = String::from_utf8(vec![a, b]).unwrap();
                assert!(
                    seen.insert(escape_var_name(&s)),
                    "collision on {:?}",
                    s
                );
            }
        }
    }

    #[test]
    fn test_c_quote() {
        assert_eq!(c_quote("plain"), "plain");
        assert_eq!(c_quote("a\"b"), "a\\\"b");
        assert_eq!(c_quote("a\\b"), "a\\\\b");
        assert_eq!(c_quote("a\nb"), "a\\nb");
    }
}
