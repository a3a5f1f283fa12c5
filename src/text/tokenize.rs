//! Q-gram and word tokenizers
//!
//! The q-gram tokenizer emits one token per codepoint position: a window of
//! two 16-bit code units, the second being zero at the final position. The
//! on-disk key is the UTF-8 encoding of the window with the zero unit
//! dropped, so the last-position token keys on the single trailing
//! character. The word tokenizer splits on a delimiter set and deduplicates
//! within a single record.

use super::normalize::from_units;
use ahash::AHashSet;

/// Delimiters of the word tokenizer: backspace, tab, newline, vertical tab,
/// form feed, carriage return and space.
pub const WORD_DELIMS: &str = "\u{8}\t\n\u{b}\u{c}\r ";

/// A q-gram window of two code units.
pub type Qgram = [u16; 2];

/// Stream of `(window, offset)` tokens over a normalized code-unit array.
pub fn qgram_stream(units: &[u16]) -> impl Iterator<Item = (Qgram, u32)> + '_ {
    (0..units.len()).map(move |i| {
        let a = units[i];
        let b = units.get(i + 1).copied().unwrap_or(0);
        ([a, b], i as u32)
    })
}

/// The on-disk key of a q-gram window.
pub fn qgram_key(gram: Qgram) -> Vec<u8> {
    let units: &[u16] = if gram[1] == 0 { &gram[..1] } else { &gram };
    from_units(units).into_bytes()
}

/// Split `text` into words on any character of `delims`, dropping empties.
pub fn split_words(text: &str, delims: &str) -> Vec<String> {
    text.split(|c: char| delims.contains(c))
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Keep the first occurrence of each word, preserving order.
pub fn dedup_words(words: &[String]) -> Vec<&str> {
    let mut seen = AHashSet::with_capacity(words.len());
    words
        .iter()
        .map(String::as_str)
        .filter(|w| seen.insert(*w))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::normalize::to_units;

    #[test]
    fn test_qgram_stream() {
        let units = to_units("abc");
        let grams: Vec<_> = qgram_stream(&units).collect();
        assert_eq!(
            grams,
            vec![
                ([b'a' as u16, b'b' as u16], 0),
                ([b'b' as u16, b'c' as u16], 1),
                ([b'c' as u16, 0], 2),
            ]
        );
    }

    #[test]
    fn test_qgram_single_char() {
        let units = to_units("x");
        let grams: Vec<_> = qgram_stream(&units).collect();
        assert_eq!(grams, vec![([b'x' as u16, 0], 0)]);
    }

    #[test]
    fn test_qgram_empty() {
        assert_eq!(qgram_stream(&[]).count(), 0);
    }

    #[test]
    fn test_qgram_key_drops_zero_unit() {
        assert_eq!(qgram_key([b'a' as u16, b'b' as u16]), b"ab".to_vec());
        assert_eq!(qgram_key([b'a' as u16, 0]), b"a".to_vec());
        // multibyte pair
        let units = to_units("んで");
        assert_eq!(qgram_key([units[0], units[1]]), "んで".as_bytes().to_vec());
    }

    #[test]
    fn test_split_words() {
        let words = split_words("the  quick\tbrown\nfox", WORD_DELIMS);
        assert_eq!(words, vec!["the", "quick", "brown", "fox"]);
    }

    #[test]
    fn test_split_custom_delims() {
        let words = split_words("a,b,,c", ",");
        assert_eq!(words, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dedup_words() {
        let words: Vec<String> = ["a", "b", "a", "c", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(dedup_words(&words), vec!["a", "b", "c"]);
    }
}
