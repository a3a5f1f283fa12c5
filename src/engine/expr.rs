//! Compound search expressions
//!
//! An expression is a sequence of terms separated by `&&` (intersection),
//! `||` (union) and `!!` (difference). Quoted terms match verbatim with
//! `""` as a literal quote; `[[ ... ]]` terms select token matching with
//! optional leading/trailing `*` wildcards, and `[[[[word` / `word]]]]`
//! force prefix and suffix matching. Evaluation collects per-term ID sets,
//! unions runs joined by `||`, then left-folds: consecutive positive sets
//! intersect, consecutive negated sets subtract.

use super::SearchMode;
use crate::index::results;
use crate::text::normalize::{normalize, NormalizeOptions};
use crate::Result;

/// Split an expression into operator and term tokens.
pub fn parse_terms(expr: &str) -> Vec<String> {
    let norm = normalize(expr, NormalizeOptions::SPACE_SQUASH);
    let chars: Vec<char> = norm.chars().collect();
    let mut terms = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ' ' {
            i += 1;
        } else if chars[i] == '"' {
            let start = i;
            i += 1;
            while i < chars.len() {
                if chars[i] == '"' {
                    if chars.get(i + 1) == Some(&'"') {
                        i += 2;
                    } else {
                        i += 1;
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            terms.push(chars[start..i].iter().collect());
        } else if chars[i] == '[' && chars.get(i + 1) == Some(&'[') {
            let start = i;
            i += 2;
            while i < chars.len() && !(chars[i] == ']' && chars.get(i + 1) == Some(&']')) {
                i += 1;
            }
            if i < chars.len() {
                i += 2;
            }
            terms.push(chars[start..i].iter().collect());
        } else {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != ' ' && chars[i] != '"' {
                i += 1;
            }
            terms.push(chars[start..i].iter().collect());
        }
    }
    terms
}

/// Strip surrounding quotes, collapsing `""` to a literal quote.
fn unquote(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    let chars: Vec<char> = term.chars().collect();
    let mut i = 1; // skip the opening quote
    while i < chars.len() {
        if chars[i] == '"' {
            if chars.get(i + 1) == Some(&'"') {
                out.push('"');
                i += 2;
            } else {
                i += 1;
            }
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

/// A term resolved to a bare word and a search mode, or nothing when the
/// term collapses to an empty word.
pub type TermQuery = Option<(String, SearchMode)>;

/// Interpret a term the way the q-gram engine does: bare and quoted terms
/// are substring matches, brackets select the token meta-modes.
pub fn qgram_term_query(term: &str) -> TermQuery {
    bracket_term_query(
        term,
        SearchMode::Substring,
        SearchMode::Token,
        SearchMode::TokenPrefix,
        SearchMode::TokenSuffix,
    )
}

/// Interpret a term the way the word engine does: bare and quoted terms
/// match whole words, brackets map the wildcards onto vocabulary expansion.
pub fn word_term_query(term: &str) -> TermQuery {
    bracket_term_query(
        term,
        SearchMode::Full,
        SearchMode::Full,
        SearchMode::Prefix,
        SearchMode::Suffix,
    )
}

fn bracket_term_query(
    term: &str,
    bare_mode: SearchMode,
    token_mode: SearchMode,
    token_prefix_mode: SearchMode,
    token_suffix_mode: SearchMode,
) -> TermQuery {
    if term.starts_with('"') {
        return Some((unquote(term), bare_mode));
    }
    let len = term.len();
    if len < 4 {
        return Some((term.to_string(), bare_mode));
    }
    if let Some(bare) = term.strip_prefix("[[[[") {
        return Some((bare.to_string(), SearchMode::Prefix));
    }
    if let Some(bare) = term.strip_suffix("]]]]") {
        return Some((bare.to_string(), SearchMode::Suffix));
    }
    let Some(inner) = term.strip_prefix("[[").and_then(|t| t.strip_suffix("]]")) else {
        return Some((term.to_string(), bare_mode));
    };
    let (inner, suffix) = match inner.strip_prefix('*') {
        Some(rest) => (rest, true),
        None => (inner, false),
    };
    let (inner, prefix) = match inner.strip_suffix('*') {
        Some(rest) => (rest, true),
        None => (inner, false),
    };
    if inner.is_empty() {
        return None;
    }
    let mode = match (prefix, suffix) {
        (true, true) => SearchMode::Substring,
        (true, false) => token_prefix_mode,
        (false, true) => token_suffix_mode,
        (false, false) => token_mode,
    };
    Some((inner.to_string(), mode))
}

/// Evaluate parsed terms against `search`, folding the results with the
/// sign-tracking set algebra.
pub fn evaluate(
    terms: &[String],
    mut search: impl FnMut(&str) -> Result<Vec<u64>>,
) -> Result<Vec<u64>> {
    if terms.is_empty() {
        return Ok(Vec::new());
    }
    if terms.len() == 1 {
        return search(&terms[0]);
    }
    let mut rsets: Vec<(Vec<u64>, bool)> = Vec::new();
    let mut sign = true;
    let mut ti = 0;
    while ti < terms.len() {
        let term = &terms[ti];
        if term == "&&" || term == "||" {
            sign = true;
        } else if term == "!!" {
            sign = false;
        } else {
            let mut group = vec![search(term)?];
            while ti + 2 < terms.len() && terms[ti + 1] == "||" {
                group.push(search(&terms[ti + 2])?);
                ti += 2;
            }
            let ids = if group.len() > 1 {
                results::union(&group)
            } else {
                group.pop().unwrap()
            };
            rsets.push((ids, sign));
            sign = true;
        }
        ti += 1;
    }
    while rsets.len() > 1 {
        if !rsets[0].1 {
            rsets[0] = (Vec::new(), true);
        }
        let mut run = 0;
        while 1 + run < rsets.len() && rsets[1 + run].1 {
            run += 1;
        }
        if run > 0 {
            let chunk: Vec<Vec<u64>> = rsets.drain(..=run).map(|(ids, _)| ids).collect();
            rsets.insert(0, (results::intersect(&chunk), true));
        }
        if rsets.len() > 1 {
            let mut run = 0;
            while 1 + run < rsets.len() && !rsets[1 + run].1 {
                run += 1;
            }
            if run > 0 {
                let chunk: Vec<Vec<u64>> = rsets.drain(..=run).map(|(ids, _)| ids).collect();
                rsets.insert(0, (results::difference(&chunk), true));
            }
        }
    }
    match rsets.pop() {
        Some((ids, true)) => Ok(ids),
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_terms() {
        assert_eq!(parse_terms("alpha && beta"), vec!["alpha", "&&", "beta"]);
        assert_eq!(parse_terms("  a   b  "), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_quoted() {
        assert_eq!(parse_terms(r#""hello world" && x"#), vec![r#""hello world""#, "&&", "x"]);
        assert_eq!(parse_terms(r#""say ""hi""""#), vec![r#""say ""hi""""#]);
    }

    #[test]
    fn test_parse_brackets() {
        assert_eq!(
            parse_terms("[[tok en]] !! other"),
            vec!["[[tok en]]", "!!", "other"]
        );
        assert_eq!(parse_terms("[[unclosed"), vec!["[[unclosed"]);
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote(r#""plain""#), "plain");
        assert_eq!(unquote(r#""say ""hi""""#), r#"say "hi""#);
    }

    #[test]
    fn test_qgram_term_modes() {
        assert_eq!(
            qgram_term_query("word"),
            Some(("word".into(), SearchMode::Substring))
        );
        assert_eq!(
            qgram_term_query(r#""qu ot""#),
            Some(("qu ot".into(), SearchMode::Substring))
        );
        assert_eq!(
            qgram_term_query("[[[[pre"),
            Some(("pre".into(), SearchMode::Prefix))
        );
        assert_eq!(
            qgram_term_query("suf]]]]"),
            Some(("suf".into(), SearchMode::Suffix))
        );
        assert_eq!(
            qgram_term_query("[[tok]]"),
            Some(("tok".into(), SearchMode::Token))
        );
        assert_eq!(
            qgram_term_query("[[tok*]]"),
            Some(("tok".into(), SearchMode::TokenPrefix))
        );
        assert_eq!(
            qgram_term_query("[[*tok]]"),
            Some(("tok".into(), SearchMode::TokenSuffix))
        );
        assert_eq!(
            qgram_term_query("[[*tok*]]"),
            Some(("tok".into(), SearchMode::Substring))
        );
        assert_eq!(qgram_term_query("[[**]]"), None);
    }

    #[test]
    fn test_word_term_modes() {
        assert_eq!(
            word_term_query("word"),
            Some(("word".into(), SearchMode::Full))
        );
        assert_eq!(
            word_term_query("[[tok*]]"),
            Some(("tok".into(), SearchMode::Prefix))
        );
        assert_eq!(
            word_term_query("[[*tok]]"),
            Some(("tok".into(), SearchMode::Suffix))
        );
        assert_eq!(
            word_term_query("[[*tok*]]"),
            Some(("tok".into(), SearchMode::Substring))
        );
    }

    #[test]
    fn test_evaluate_and_or_not() {
        let data = |term: &str| -> Result<Vec<u64>> {
            Ok(match term {
                "a" => vec![1, 2, 3],
                "b" => vec![2, 3, 4],
                "c" => vec![3, 5],
                _ => vec![],
            })
        };
        let terms = |s: &str| parse_terms(s);
        assert_eq!(evaluate(&terms("a && b"), data).unwrap(), vec![2, 3]);
        assert_eq!(evaluate(&terms("a || c"), data).unwrap(), vec![1, 2, 3, 5]);
        assert_eq!(evaluate(&terms("a !! b"), data).unwrap(), vec![1]);
        assert_eq!(evaluate(&terms("a && b !! c"), data).unwrap(), vec![2]);
        assert_eq!(evaluate(&terms("a || b && c"), data).unwrap(), vec![3]);
        assert_eq!(evaluate(&terms(""), data).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_evaluate_leading_not() {
        let data = |term: &str| -> Result<Vec<u64>> {
            Ok(match term {
                "a" => vec![1, 2],
                _ => vec![],
            })
        };
        // a negated first set evaluates as empty
        assert_eq!(
            evaluate(&parse_terms("!! a && a"), data).unwrap(),
            Vec::<u64>::new()
        );
    }
}
