//! Common definitions that are shared between different parts of the compiler.

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

use derive_more::Display;

/// Interned identifiers: function names, jump labels, string-literal keys.
pub type Id = internment::Intern<String>;

/// Make an [Id] out of anything string-like.
pub fn id(s: impl Into<String>) -> Id {
    Id::new(s.into())
}

/// A fatal diagnostic.
///
/// Every user-visible failure carries the byte range it points at; the range
/// indexes the preprocessed input buffer, so rendering needs that buffer.
/// Internal invariant violations do not use this type, they are
/// `unreachable!()`/`unimplemented!()` panics (compiler bugs, not user errors).
#[derive(Clone, Display)]
#[display("{msg}")]
pub struct CompileError {
    /// Byte offset into the input buffer, when known.
    pub pos: Option<usize>,
    /// Length of the offending range.
    pub len: usize,
    pub msg: String,
}

impl CompileError {
    /// An error anchored at a byte range of the input.
    pub fn at(pos: usize, len: usize, msg: impl Into<String>) -> Self {
        CompileError {
            pos: Some(pos),
            len,
            msg: msg.into(),
        }
    }

    /// An error with no source position (bad arguments, I/O trouble).
    pub fn new(msg: impl Into<String>) -> Self {
        CompileError {
            pos: None,
            len: 0,
            msg: msg.into(),
        }
    }

    /// Render the `<excerpt>\n<spaces>^ <message>` form against the source.
    pub fn render(&self, src: &str) -> String {
        let Some(pos) = self.pos else {
            return format!("{}\n", self.msg);
        };
        let pos = pos.min(src.len());
        let line_start = src[..pos].rfind('\n').map_or(0, |i| i + 1);
        let line_end = src[pos..].find('\n').map_or(src.len(), |i| pos + i);
        format!(
            "{}\n{}^ {}\n",
            &src[line_start..line_end],
            " ".repeat(pos - line_start),
            self.msg
        )
    }
}

impl std::fmt::Debug for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// Round `n` up to the next multiple of `align` (which must be non-zero).
pub fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_points_at_the_offending_column() {
        let src = "int main() {\n  return x;\n}\n";
        let pos = src.find('x').unwrap();
        let err = CompileError::at(pos, 1, "undeclared identifier");
        assert_eq!(
            err.render(src),
            "  return x;\n         ^ undeclared identifier\n"
        );
    }

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 4), 16);
    }
}
