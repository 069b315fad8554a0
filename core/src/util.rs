//! Source spans and small helpers shared across the compiler and runtime.

use nom_locate::LocatedSpan;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Formatter};

/// The input type used by the parser. Tracks position within the original
/// source so that every AST node can be stamped with a [Span].
pub(crate) type RawSpan<'a> = LocatedSpan<&'a str>;

/// A region of the source code. Every AST node carries one of these, and
/// every error points back at one. A span with zero line/column means
/// "no source location" (e.g. errors synthesized by the runtime for
/// conditions that have no single offending token).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Byte offset into the source
    pub offset: usize,
    /// Length of the spanned region, in bytes
    pub length: usize,
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl Span {
    /// Build a span covering the given raw fragment.
    pub(crate) fn from_raw_span(raw_span: &RawSpan<'_>) -> Self {
        let fragment = *raw_span.fragment();
        let start_line = raw_span.location_line() as usize;
        let start_col = raw_span.get_column();
        // A fragment can cover multiple lines, so re-derive the end position
        // from its contents
        let newlines = fragment.matches('\n').count();
        let (end_line, end_col) = if newlines == 0 {
            (start_line, start_col + fragment.len())
        } else {
            let last_line_len =
                fragment.rsplit('\n').next().unwrap_or("").len();
            (start_line + newlines, last_line_len + 1)
        };
        Self {
            offset: raw_span.location_offset(),
            length: fragment.len(),
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    /// Build a zero-length span at the position of the given input. Used for
    /// syntax errors, where the remaining input isn't a meaningful fragment.
    pub(crate) fn from_position(raw_span: &RawSpan<'_>) -> Self {
        let start_line = raw_span.location_line() as usize;
        let start_col = raw_span.get_column();
        Self {
            offset: raw_span.location_offset(),
            length: 0,
            start_line,
            start_col,
            end_line: start_line,
            end_col: start_col,
        }
    }

    /// The "no source location" span (all zeroes).
    pub(crate) fn none() -> Self {
        Self {
            offset: 0,
            length: 0,
            start_line: 0,
            start_col: 0,
            end_line: 0,
            end_col: 0,
        }
    }

    /// Smallest span covering both `self` and `other`.
    pub(crate) fn merge(self, other: Span) -> Span {
        let (first, last) = if self.offset <= other.offset {
            (self, other)
        } else {
            (other, self)
        };
        Span {
            offset: first.offset,
            length: (last.offset + last.length).saturating_sub(first.offset),
            start_line: first.start_line,
            start_col: first.start_col,
            end_line: last.end_line,
            end_col: last.end_col,
        }
    }

    /// Get the chunk of source code that this span covers.
    pub fn get_source_slice<'a>(&self, src: &'a str) -> &'a str {
        let end = (self.offset + self.length).min(src.len());
        src.get(self.offset..end).unwrap_or("")
    }
}

/// Write the source line(s) covered by the span, with a marker line
/// underneath pointing at the offending columns. Used by the alternate
/// Display impl on error wrappers.
pub(crate) fn fmt_src_highlights(
    f: &mut Formatter<'_>,
    span: &Span,
    src: &str,
) -> fmt::Result {
    if span.start_line == 0 {
        // No source location to show
        return Ok(());
    }
    for (i, line) in src.lines().enumerate() {
        let line_num = i + 1;
        if line_num < span.start_line || line_num > span.end_line {
            continue;
        }
        writeln!(f)?;
        write!(f, "{} | {}", line_num, line)?;
        if line_num == span.start_line {
            // Marker line under the start of the span
            let prefix_width = format!("{} | ", line_num).len();
            let marker_len = if span.start_line == span.end_line {
                (span.end_col - span.start_col).max(1)
            } else {
                line.len().saturating_sub(span.start_col - 1).max(1)
            };
            writeln!(f)?;
            write!(
                f,
                "{}{}",
                " ".repeat(prefix_width + span.start_col - 1),
                "^".repeat(marker_len)
            )?;
        }
    }
    Ok(())
}

/// Macro that can wrap any body, and only executes the body if we are running
/// in debug mode. Debug mode is enabled by setting the environment variable
/// DEBUG=true. This compiles away to nothing when --release is used.
///
/// Example:
/// ```
/// use tangle::debug;
/// debug!(println!("Hello!"));
/// ```
#[macro_export]
macro_rules! debug {
    ($arg:expr) => {
        #[cfg(debug_assertions)]
        {
            if let Ok(debug_val) = std::env::var("DEBUG") {
                if debug_val.to_lowercase().as_str() == "true" {
                    $arg
                }
            }
        }
    };
}
