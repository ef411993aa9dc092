//! Application of `textDocument/didChange` content changes to a buffer.

use ropey::{Rope, RopeSlice};
use tower_lsp::lsp_types::{Position, TextDocumentContentChangeEvent};

use super::DocumentError;

/// Applies `changes` in order to a copy of `text`.
///
/// A change without a range replaces the whole buffer. Ranged changes use
/// LSP positions, whose `character` counts UTF-16 code units; a character
/// past the end of its line is clamped to the line end.
pub fn apply_changes(
    text: &Rope,
    changes: &[TextDocumentContentChangeEvent],
) -> Result<Rope, DocumentError> {
    let mut rope = text.clone();

    for change in changes {
        let Some(range) = change.range else {
            rope = Rope::from_str(&change.text);
            continue;
        };

        let invalid = || DocumentError::InvalidRange {
            range,
            lines: rope.len_lines(),
        };
        let start = position_to_char(&rope, range.start).ok_or_else(invalid)?;
        let end = position_to_char(&rope, range.end).ok_or_else(invalid)?;
        if end < start {
            return Err(invalid());
        }

        rope.remove(start..end);
        rope.insert(start, &change.text);
    }

    Ok(rope)
}

fn position_to_char(rope: &Rope, position: Position) -> Option<usize> {
    let line = position.line as usize;

    // One past the last line is only addressable at its very start.
    if line >= rope.len_lines() {
        return (line == rope.len_lines() && position.character == 0).then(|| rope.len_chars());
    }

    let content = without_line_ending(rope.line(line));
    let utf16 = (position.character as usize).min(content.len_utf16_cu());

    Some(rope.line_to_char(line) + content.utf16_cu_to_char(utf16))
}

fn without_line_ending(line: RopeSlice<'_>) -> RopeSlice<'_> {
    let mut len = line.len_chars();
    if len > 0 && line.char(len - 1) == '\n' {
        len -= 1;
    }
    if len > 0 && line.char(len - 1) == '\r' {
        len -= 1;
    }
    line.slice(..len)
}
