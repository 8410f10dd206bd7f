use super::{sentence_starts, CharIndex, Piece};

/// Windows of at most `size` characters. A window is shortened to the last
/// sentence start inside it, as long as the next window still moves forward
/// after stepping back `overlap` characters.
pub(super) fn split(text: &str, size: usize, overlap: usize) -> Vec<Piece> {
    let index = CharIndex::new(text);
    let n = index.len_chars();
    let boundaries: Vec<usize> = sentence_starts(text).into_iter().map(|b| index.char_at(b)).collect();

    let mut pieces = Vec::new();
    let mut start = 0;
    while start < n {
        let hard_end = (start + size).min(n);
        let end = if hard_end < n {
            let i = boundaries.partition_point(|&b| b <= hard_end);
            match i.checked_sub(1).map(|j| boundaries[j]) {
                Some(b) if b > start + overlap => b,
                _ => hard_end,
            }
        } else {
            n
        };
        pieces.push(Piece::new(index.byte_at(start), index.byte_at(end)));
        if end >= n {
            break;
        }
        start = end - overlap;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use crate::chunking::{chunk, ChunkStrategy};
    use crate::types::Document;

    #[test]
    fn backs_off_to_sentence_boundary() {
        let doc = Document::new("One two three. Four five six. Seven eight nine.");
        let chunks = chunk(&doc, &ChunkStrategy::Fixed { size: 20, overlap: 0 }).expect("chunk");
        assert_eq!(chunks[0].text, "One two three.");
        assert_eq!(chunks[1].text, "Four five six.");
        assert_eq!(chunks[2].text, "Seven eight nine.");
    }

    #[test]
    fn hard_cut_repeats_overlap() {
        let doc = Document::new("abcdefghijklmnopqrst");
        let chunks = chunk(&doc, &ChunkStrategy::Fixed { size: 8, overlap: 3 }).expect("chunk");
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcdefgh", "fghijklm", "klmnopqr", "pqrst"]);
        assert_eq!(chunks[1].metadata["start_char"], 5);
        assert_eq!(chunks[1].metadata["end_char"], 13);
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let doc = Document::new("ééééééééé");
        let chunks = chunk(&doc, &ChunkStrategy::Fixed { size: 4, overlap: 1 }).expect("chunk");
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 4));
        assert_eq!(chunks[0].text, "éééé");
    }
}
