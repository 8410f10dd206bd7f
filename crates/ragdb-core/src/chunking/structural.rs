use std::ops::Range;

use serde_json::Value;

use super::{char_len, recursive, Piece};
use crate::types::Payload;

struct Heading {
    level: usize,
    title: String,
    path: String,
}

struct Section {
    range: Range<usize>,
    heading: Option<Heading>,
}

/// One piece per heading section; sections longer than `size` are split
/// recursively and every sub-piece keeps the section heading.
pub(super) fn split(text: &str, size: usize, overlap: usize) -> Vec<Piece> {
    let mut pieces = Vec::new();
    for section in sections(text) {
        let extra = heading_metadata(section.heading.as_ref());
        if char_len(&text[section.range.clone()]) <= size {
            let mut piece = Piece::new(section.range.start, section.range.end);
            piece.extra = extra;
            pieces.push(piece);
        } else {
            for mut piece in recursive::split(text, section.range, size, overlap) {
                piece.extra = extra.clone();
                pieces.push(piece);
            }
        }
    }
    pieces
}

fn heading_metadata(heading: Option<&Heading>) -> Payload {
    let mut extra = Payload::new();
    if let Some(h) = heading {
        extra.insert("heading".into(), Value::from(h.title.clone()));
        extra.insert("heading_path".into(), Value::from(h.path.clone()));
        extra.insert("heading_level".into(), Value::from(h.level));
    }
    extra
}

fn sections(text: &str) -> Vec<Section> {
    let mut out = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current: Option<Heading> = None;
    let mut current_start = 0;
    let mut in_fence = false;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some((level, title)) = atx_heading(line) {
                if offset > current_start {
                    out.push(Section { range: current_start..offset, heading: current.take() });
                }
                while stack.last().is_some_and(|(l, _)| *l >= level) {
                    stack.pop();
                }
                stack.push((level, title.clone()));
                let path = stack.iter().map(|(_, t)| t.as_str()).collect::<Vec<_>>().join(" > ");
                current = Some(Heading { level, title, path });
                current_start = offset;
            }
        }
        offset += line.len();
    }
    if offset > current_start {
        out.push(Section { range: current_start..offset, heading: current });
    }
    out
}

/// `# Title`, up to three leading spaces, optional closing hashes.
fn atx_heading(line: &str) -> Option<(usize, String)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let level = rest.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let after = &rest[level..];
    if !after.is_empty() && !after.starts_with([' ', '\t', '\n', '\r']) {
        return None;
    }
    let title = after.trim().trim_end_matches('#').trim_end().to_string();
    Some((level, title))
}

#[cfg(test)]
mod tests {
    use crate::chunking::{chunk, ChunkStrategy};
    use crate::types::Document;

    const DOC: &str = "Intro text.\n# Animals\nCats are mammals.\n## Cats\nThey purr.\n```\n# not a heading\n```\n# Vehicles\nCars have engines.\n";

    #[test]
    fn attaches_heading_path() {
        let chunks = chunk(&Document::new(DOC), &ChunkStrategy::Structural { size: 200, overlap: 0 }).expect("chunk");
        assert_eq!(chunks.len(), 4);
        assert!(chunks[0].metadata.get("heading").is_none());
        assert_eq!(chunks[1].metadata["heading"], "Animals");
        assert_eq!(chunks[2].metadata["heading_path"], "Animals > Cats");
        assert_eq!(chunks[2].metadata["heading_level"], 2);
        assert!(chunks[2].text.contains("# not a heading"));
        assert_eq!(chunks[3].metadata["heading_path"], "Vehicles");
    }

    #[test]
    fn long_sections_keep_their_heading() {
        let body = "word ".repeat(40);
        let doc = Document::new(format!("# Title\n{body}"));
        let chunks = chunk(&doc, &ChunkStrategy::Structural { size: 50, overlap: 0 }).expect("chunk");
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.metadata["heading"] == "Title"));
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 50));
    }
}
