//! Text normalization and tokenization

pub mod normalize;
pub mod tokenize;

pub use normalize::{normalize, NormalizeOptions};
pub use tokenize::{qgram_key, qgram_stream, split_words, Qgram, WORD_DELIMS};
