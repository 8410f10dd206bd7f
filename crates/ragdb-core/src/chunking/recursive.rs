use std::collections::VecDeque;
use std::ops::Range;

use unicode_segmentation::UnicodeSegmentation;

use super::{char_len, Piece};

#[derive(Debug, Clone, Copy)]
enum Separator {
    Literal(&'static str),
    Sentence,
}

/// Coarsest first: paragraph, line, sentence, word.
const SEPARATORS: [Separator; 4] = [
    Separator::Literal("\n\n"),
    Separator::Literal("\n"),
    Separator::Sentence,
    Separator::Literal(" "),
];

struct Atom {
    span: Range<usize>,
    chars: usize,
    oversized: bool,
}

/// Splits the byte range `span` of `text` into pieces of at most `size`
/// characters, carrying up to `overlap` trailing characters into the next
/// piece.
pub(crate) fn split(text: &str, span: Range<usize>, size: usize, overlap: usize) -> Vec<Piece> {
    let mut atoms = Vec::new();
    descend(text, span, 0, size, &mut atoms);
    merge(atoms, size, overlap)
}

fn descend(text: &str, span: Range<usize>, level: usize, size: usize, out: &mut Vec<Atom>) {
    let chars = char_len(&text[span.clone()]);
    if chars <= size {
        out.push(Atom { span, chars, oversized: false });
        return;
    }
    let Some(sep) = SEPARATORS.get(level) else {
        out.push(Atom { span, chars, oversized: true });
        return;
    };
    let parts = split_on(text, span.clone(), *sep);
    if parts.len() <= 1 {
        descend(text, span, level + 1, size, out);
        return;
    }
    for part in parts {
        descend(text, part, level + 1, size, out);
    }
}

// The separator stays attached to the piece before it, so the parts tile
// the span exactly.
fn split_on(text: &str, span: Range<usize>, sep: Separator) -> Vec<Range<usize>> {
    let base = span.start;
    let s = &text[span];
    match sep {
        Separator::Sentence => s
            .split_sentence_bound_indices()
            .map(|(i, part)| base + i..base + i + part.len())
            .collect(),
        Separator::Literal(lit) => {
            let mut parts = Vec::new();
            let mut last = 0;
            for (i, m) in s.match_indices(lit) {
                let end = i + m.len();
                parts.push(base + last..base + end);
                last = end;
            }
            if last < s.len() {
                parts.push(base + last..base + s.len());
            }
            parts
        }
    }
}

fn merge(atoms: Vec<Atom>, size: usize, overlap: usize) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut window: VecDeque<(Range<usize>, usize)> = VecDeque::new();
    let mut window_chars = 0;
    // Whether the window holds text not emitted yet.
    let mut fresh = false;

    let flush = |window: &VecDeque<(Range<usize>, usize)>, pieces: &mut Vec<Piece>| {
        if let (Some(first), Some(last)) = (window.front(), window.back()) {
            pieces.push(Piece::new(first.0.start, last.0.end));
        }
    };

    for atom in atoms {
        if atom.oversized {
            if fresh {
                flush(&window, &mut pieces);
            }
            window.clear();
            window_chars = 0;
            fresh = false;
            let mut piece = Piece::new(atom.span.start, atom.span.end);
            piece.oversized = true;
            pieces.push(piece);
            continue;
        }
        if !window.is_empty() && window_chars + atom.chars > size {
            if fresh {
                flush(&window, &mut pieces);
            }
            while let Some(&(_, c)) = window.front() {
                if window_chars > overlap || window_chars + atom.chars > size {
                    window.pop_front();
                    window_chars -= c;
                } else {
                    break;
                }
            }
            fresh = false;
        }
        window_chars += atom.chars;
        window.push_back((atom.span, atom.chars));
        fresh = true;
    }
    if fresh {
        flush(&window, &mut pieces);
    }
    pieces
}
