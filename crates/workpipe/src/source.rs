//! Offset to line/column translation.

use std::cell::OnceCell;

use line_index::{LineIndex, TextSize};

/// Lazily computed line/column lookup for one file.
///
/// The newline table is only built on first use, so batches that
/// produce no diagnostics never pay for it.
pub struct SourceMap<'src> {
    source: &'src str,
    index: OnceCell<LineIndex>,
}

impl<'src> SourceMap<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            index: OnceCell::new(),
        }
    }

    fn index(&self) -> &LineIndex {
        self.index.get_or_init(|| LineIndex::new(self.source))
    }

    /// Returns the 1-based `(line, column)` for a byte offset.
    ///
    /// Offsets past the end of the source clamp to the final position.
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.source.len());
        let lc = self.index().line_col(TextSize::new(offset as u32));
        (lc.line as usize + 1, lc.col as usize + 1)
    }
}
