/// Split `text` into segments of at most `max_len` characters.
///
/// Split points, in order of preference: after the last newline inside the
/// window, after the last space, or a hard cut at the limit. Delimiters stay
/// attached to the segment they end, so concatenating the result yields the
/// original text.
pub fn split_chunks(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some((limit, _)) = rest.char_indices().nth(max_len) else {
            chunks.push(rest.to_owned());
            break;
        };

        let window = &rest[..limit];
        let cut = split_point(window).unwrap_or(limit);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_owned());
        rest = tail;
    }

    chunks
}

fn split_point(window: &str) -> Option<usize> {
    window
        .rfind('\n')
        .filter(|&idx| idx > 0)
        .or_else(|| window.rfind(' ').filter(|&idx| idx > 0))
        .map(|idx| idx + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_len(s: &str) -> usize {
        s.chars().count()
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_chunks("hello", 10), vec!["hello"]);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(split_chunks("", 10).is_empty());
    }

    #[test]
    fn text_at_exact_limit_is_not_split() {
        assert_eq!(split_chunks("abcde", 5), vec!["abcde"]);
    }

    #[test]
    fn prefers_newline_over_space() {
        let chunks = split_chunks("aaa bbb\ncc dd", 10);
        assert_eq!(chunks, vec!["aaa bbb\n", "cc dd"]);
    }

    #[test]
    fn falls_back_to_last_space() {
        let chunks = split_chunks("one two three four", 10);
        assert_eq!(chunks[0], "one two ");
        assert_eq!(chunks.concat(), "one two three four");
    }

    #[test]
    fn hard_cut_without_delimiters() {
        let chunks = split_chunks("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn leading_newline_does_not_produce_tiny_chunk() {
        let chunks = split_chunks("\nabcdefgh", 4);
        assert_eq!(chunks[0], "\nabc");
    }

    #[test]
    fn multibyte_characters_count_as_one_unit() {
        let text = "ééééééé";
        let chunks = split_chunks(text, 3);
        assert_eq!(chunks, vec!["ééé", "ééé", "é"]);
    }

    #[test]
    fn chunks_are_bounded_and_reassemble() {
        let paragraph = "Lorem ipsum dolor sit amet, consectetur adipiscing elit.\n";
        let text = paragraph.repeat(120);
        let chunks = split_chunks(&text, 500);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| char_len(c) <= 500));
        assert!(chunks.iter().all(|c| !c.is_empty()));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn zero_limit_is_treated_as_one() {
        assert_eq!(split_chunks("ab", 0), vec!["a", "b"]);
    }
}
