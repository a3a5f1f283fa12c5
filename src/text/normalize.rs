//! Codepoint-level text normalizer
//!
//! Normalization is the single source of Unicode policy for the whole
//! engine: search words and indexed tokens must run through the same options
//! or the index is invalid. The rules operate on an array of 16-bit code
//! units (text is folded through UTF-16, so astral codepoints pass as
//! surrogate pairs and are never matched as single units) and are
//! deterministic and idempotent.

use bitflags::bitflags;

bitflags! {
    /// Which optional folds to apply on top of the unconditional rules.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NormalizeOptions: u8 {
        /// Map capital letters (ASCII, Latin-1, Latin Extended-A, Greek,
        /// Cyrillic) to their lowercase counterparts.
        const LOWERCASE = 1 << 0;
        /// Fold Latin accented forms to their ASCII base letter.
        const NO_ACCENT = 1 << 1;
        /// Collapse runs of spaces and trim the ends.
        const SPACE_SQUASH = 1 << 2;
    }
}

impl NormalizeOptions {
    /// The folds every engine applies to record text and search words.
    pub fn standard() -> Self {
        Self::LOWERCASE | Self::NO_ACCENT | Self::SPACE_SQUASH
    }
}

/// Decode UTF-8 text into 16-bit code units.
pub fn to_units(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

/// Re-encode code units as UTF-8, replacing unpaired surrogates.
pub fn from_units(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

/// Normalize UTF-8 text, returning the folded string.
pub fn normalize(text: &str, opts: NormalizeOptions) -> String {
    let mut units = to_units(text);
    normalize_units(&mut units, opts);
    from_units(&units)
}

/// Normalize an array of code units in place.
pub fn normalize_units(units: &mut Vec<u16>, opts: NormalizeOptions) {
    let lower = opts.contains(NormalizeOptions::LOWERCASE);
    let noacc = opts.contains(NormalizeOptions::NO_ACCENT);
    let squash = opts.contains(NormalizeOptions::SPACE_SQUASH);
    let src = std::mem::take(units);
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let c = src[i];
        let next = src.get(i + 1).copied().unwrap_or(0);
        match c >> 8 {
            0x00 => {
                if c < 0x0020 || c == 0x007f {
                    // control characters
                    if !squash && (c == 0x0009 || c == 0x000a || c == 0x000d) {
                        out.push(c);
                    } else {
                        out.push(0x0020);
                    }
                } else if c == 0x00a0 {
                    // no-break space
                    out.push(0x0020);
                } else {
                    out.push(fold_latin1(c, lower, noacc));
                }
            }
            0x01 => out.push(fold_latin_ext(c, lower, noacc)),
            0x03 => out.push(fold_greek(c, lower)),
            0x04 => out.push(fold_cyrillic(c, lower)),
            0x20 => out.push(match c {
                // en / em / thin space
                0x2002 | 0x2003 | 0x2009 => 0x0020,
                // hyphen, horizontal line
                0x2010 | 0x2015 => 0x002d,
                // apostrophe
                0x2019 => 0x0027,
                // double quotes
                0x2033 => 0x0022,
                _ => c,
            }),
            0x22 => out.push(if c == 0x2212 { 0x002d } else { c }),
            0x30 => {
                if c == 0x3000 {
                    // fullwidth space
                    out.push(if squash { 0x0020 } else { c });
                } else {
                    out.push(c);
                }
            }
            0xff => {
                let consumed = fold_fullwidth(c, next, lower, &mut out);
                if consumed {
                    i += 1;
                }
            }
            _ => out.push(c),
        }
        i += 1;
    }
    if squash {
        squash_spaces(&mut out);
    }
    *units = out;
}

/// Latin-1 block (after the control-character rules).
fn fold_latin1(mut c: u16, lower: bool, noacc: bool) -> u16 {
    if lower {
        if c < 0x007f {
            if (0x0041..=0x005a).contains(&c) {
                c += 0x20;
            }
        } else if (0x00c0..=0x00de).contains(&c) && c != 0x00d7 {
            c += 0x20;
        }
    }
    if noacc {
        c = match c {
            0x00c0..=0x00c5 => b'A' as u16,
            0x00c7 => b'C' as u16,
            0x00c8..=0x00cb => b'E' as u16,
            0x00cc..=0x00cf => b'I' as u16,
            0x00d0 => b'D' as u16,
            0x00d1 => b'N' as u16,
            0x00d2..=0x00d6 | 0x00d8 => b'O' as u16,
            0x00d9..=0x00dc => b'U' as u16,
            0x00dd | 0x00de => b'Y' as u16,
            0x00df => b's' as u16,
            0x00e0..=0x00e5 => b'a' as u16,
            0x00e7 => b'c' as u16,
            0x00e8..=0x00eb => b'e' as u16,
            0x00ec..=0x00ef => b'i' as u16,
            0x00f0 => b'd' as u16,
            0x00f1 => b'n' as u16,
            0x00f2..=0x00f6 | 0x00f8 => b'o' as u16,
            0x00f9..=0x00fc => b'u' as u16,
            0x00fd..=0x00ff => b'y' as u16,
            _ => c,
        };
    }
    c
}

/// Latin Extended-A block: case pairs alternate between even-upper and
/// odd-upper runs, so the parity rules below follow the block layout.
fn fold_latin_ext(mut c: u16, lower: bool, noacc: bool) -> u16 {
    if lower {
        if c <= 0x0137 {
            if c & 1 == 0 {
                c += 1;
            }
        } else if c == 0x0138 || c == 0x0149 || c == 0x017f {
            // no uppercase partner
        } else if c <= 0x0148 {
            if c & 1 == 1 {
                c += 1;
            }
        } else if c <= 0x0177 {
            if c & 1 == 0 {
                c += 1;
            }
        } else if c == 0x0178 {
            c = 0x00ff;
        } else if c <= 0x017e {
            if c & 1 == 1 {
                c += 1;
            }
        }
    }
    if noacc {
        c = match c {
            0x00ff => b'y' as u16,
            0x0100..=0x0105 => parity_base(c, b'A', b'a'),
            0x0106..=0x010d => parity_base(c, b'C', b'c'),
            0x010e..=0x0111 => parity_base(c, b'D', b'd'),
            0x0112..=0x011b => parity_base(c, b'E', b'e'),
            0x011c..=0x0123 => parity_base(c, b'G', b'g'),
            0x0124..=0x0127 => parity_base(c, b'H', b'h'),
            0x0128..=0x0131 => parity_base(c, b'I', b'i'),
            0x0134 => b'J' as u16,
            0x0135 => b'j' as u16,
            0x0136 => b'K' as u16,
            0x0137 | 0x0138 => b'k' as u16,
            0x0139..=0x0142 => parity_base_odd(c, b'L', b'l'),
            0x0143..=0x0148 => parity_base_odd(c, b'N', b'n'),
            0x0149..=0x014b => parity_base(c, b'N', b'n'),
            0x014c..=0x0151 => parity_base(c, b'O', b'o'),
            0x0154..=0x0159 => parity_base(c, b'R', b'r'),
            0x015a..=0x0161 => parity_base(c, b'S', b's'),
            0x0162..=0x0167 => parity_base(c, b'T', b't'),
            0x0168..=0x0173 => parity_base(c, b'U', b'u'),
            0x0174 => b'W' as u16,
            0x0175 => b'w' as u16,
            0x0176 => b'Y' as u16,
            0x0177 => b'y' as u16,
            0x0178 => b'Y' as u16,
            0x0179..=0x017e => parity_base_odd(c, b'Z', b'z'),
            0x017f => b's' as u16,
            _ => c,
        };
    }
    c
}

fn parity_base(c: u16, upper: u8, lower: u8) -> u16 {
    if c & 1 == 0 {
        upper as u16
    } else {
        lower as u16
    }
}

fn parity_base_odd(c: u16, upper: u8, lower: u8) -> u16 {
    if c & 1 == 1 {
        upper as u16
    } else {
        lower as u16
    }
}

fn fold_greek(mut c: u16, lower: bool) -> u16 {
    if lower {
        if (0x0391..=0x03a9).contains(&c) {
            c += 0x20;
        } else if (0x03d8..=0x03ef).contains(&c) {
            if c & 1 == 0 {
                c += 1;
            }
        } else if c == 0x0374 || c == 0x03f7 || c == 0x03fa {
            c += 1;
        }
    }
    c
}

fn fold_cyrillic(mut c: u16, lower: bool) -> u16 {
    if lower {
        if c <= 0x040f {
            c += 0x50;
        } else if c <= 0x042f {
            c += 0x20;
        } else if (0x0460..=0x0481).contains(&c) || (0x048a..=0x04bf).contains(&c) {
            if c & 1 == 0 {
                c += 1;
            }
        } else if c == 0x04c0 {
            c = 0x04cf;
        } else if (0x04c1..=0x04ce).contains(&c) {
            if c & 1 == 1 {
                c += 1;
            }
        } else if c >= 0x04d0 {
            if c & 1 == 0 {
                c += 1;
            }
        }
    }
    c
}

/// Fullwidth forms and halfwidth katakana. Returns true when the following
/// code unit (a voiced or semi-voiced sound mark) was composed in.
fn fold_fullwidth(c: u16, next: u16, lower: bool, out: &mut Vec<u16>) -> bool {
    match c {
        0xff01 => out.push(0x0021),
        0xff03 => out.push(0x0023),
        0xff04 => out.push(0x0024),
        0xff05 => out.push(0x0025),
        0xff06 => out.push(0x0026),
        0xff0a => out.push(0x002a),
        0xff0b => out.push(0x002b),
        0xff0c => out.push(0x002c),
        0xff0e => out.push(0x002e),
        0xff0f => out.push(0x002f),
        0xff1a => out.push(0x003a),
        0xff1b => out.push(0x003b),
        0xff1d => out.push(0x003d),
        0xff1f => out.push(0x003f),
        0xff20 => out.push(0x0040),
        0xff3c => out.push(0x005c),
        0xff3e => out.push(0x005e),
        0xff3f => out.push(0x005f),
        0xff5c => out.push(0x007c),
        // fullwidth alphabets
        0xff21..=0xff3a => {
            let mut a = c - 0xfee0;
            if lower {
                a += 0x20;
            }
            out.push(a);
        }
        // fullwidth small alphabets and numbers
        0xff41..=0xff5a | 0xff10..=0xff19 => out.push(c - 0xfee0),
        // halfwidth punctuation
        0xff61 => out.push(0x3002),
        0xff62 => out.push(0x300c),
        0xff63 => out.push(0x300d),
        0xff64 => out.push(0x3001),
        0xff65 => out.push(0x30fb),
        // halfwidth wo
        0xff66 => out.push(0x30f2),
        // halfwidth small a-o
        0xff67..=0xff6b => out.push((c - 0xff67) * 2 + 0x30a1),
        // halfwidth small ya-yo
        0xff6c..=0xff6e => out.push((c - 0xff6c) * 2 + 0x30e3),
        // halfwidth small tu
        0xff6f => out.push(0x30c3),
        // halfwidth prolonged mark
        0xff70 => out.push(0x30fc),
        // halfwidth a-o, only u composes with the voiced mark
        0xff71..=0xff75 => {
            if c == 0xff73 && next == 0xff9e {
                out.push(0x30f4);
                return true;
            }
            out.push((c - 0xff71) * 2 + 0x30a2);
        }
        // halfwidth ka-ko
        0xff76..=0xff7a => {
            let base = (c - 0xff76) * 2 + 0x30ab;
            if next == 0xff9e {
                out.push(base + 1);
                return true;
            }
            out.push(base);
        }
        // halfwidth sa-so
        0xff7b..=0xff7f => {
            let base = (c - 0xff7b) * 2 + 0x30b5;
            if next == 0xff9e {
                out.push(base + 1);
                return true;
            }
            out.push(base);
        }
        // halfwidth ta-to
        0xff80..=0xff84 => {
            let base = (c - 0xff80) * 2 + 0x30bf + if c >= 0xff82 { 1 } else { 0 };
            if next == 0xff9e {
                out.push(base + 1);
                return true;
            }
            out.push(base);
        }
        // halfwidth na-no
        0xff85..=0xff89 => out.push(c - 0xcebb),
        // halfwidth ha-ho, voiced and semi-voiced
        0xff8a..=0xff8e => {
            let base = (c - 0xff8a) * 3 + 0x30cf;
            if next == 0xff9e {
                out.push(base + 1);
                return true;
            }
            if next == 0xff9f {
                out.push(base + 2);
                return true;
            }
            out.push(base);
        }
        // halfwidth ma-mo
        0xff8f..=0xff93 => out.push(c - 0xceb1),
        // halfwidth ya-yo
        0xff94..=0xff96 => out.push((c - 0xff94) * 2 + 0x30e4),
        // halfwidth ra-ro
        0xff97..=0xff9b => out.push(c - 0xceae),
        // halfwidth wa
        0xff9c => out.push(0x30ef),
        // halfwidth nn
        0xff9d => out.push(0x30f3),
        _ => out.push(c),
    }
    false
}

/// Collapse runs of spaces to one and trim leading and trailing spaces.
fn squash_spaces(units: &mut Vec<u16>) {
    let mut w = 0;
    let mut last_space = true;
    for i in 0..units.len() {
        let c = units[i];
        if c == 0x0020 {
            if last_space {
                continue;
            }
            last_space = true;
        } else {
            last_space = false;
        }
        units[w] = c;
        w += 1;
    }
    while w > 0 && units[w - 1] == 0x0020 {
        w -= 1;
    }
    units.truncate(w);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn std_norm(s: &str) -> String {
        normalize(s, NormalizeOptions::standard())
    }

    #[test]
    fn test_ascii_lowercase() {
        assert_eq!(std_norm("Hello World"), "hello world");
        assert_eq!(std_norm("ABCxyz123"), "abcxyz123");
    }

    #[test]
    fn test_accent_folding() {
        assert_eq!(std_norm("Café"), "cafe");
        assert_eq!(std_norm("RÉSUMÉ"), "resume");
        assert_eq!(std_norm("Çö"), "co");
        // sharp s folds to a single 's'
        assert_eq!(std_norm("straße"), "strase");
        assert_eq!(std_norm("ß"), "s");
        assert_eq!(std_norm("ø Ø"), "o o");
    }

    #[test]
    fn test_latin_extended() {
        assert_eq!(std_norm("Łódź"), "lodz");
        assert_eq!(std_norm("Ščř"), "scr");
    }

    #[test]
    fn test_space_squash() {
        assert_eq!(std_norm("  a   b  "), "a b");
        assert_eq!(std_norm("a\t\nb"), "a b");
        assert_eq!(std_norm("Café  RÉSUMÉ"), "cafe resume");
    }

    #[test]
    fn test_controls_without_squash() {
        let opts = NormalizeOptions::LOWERCASE;
        assert_eq!(normalize("a\tb\nc", opts), "a\tb\nc");
        assert_eq!(normalize("a\x01b", opts), "a b");
    }

    #[test]
    fn test_nbsp_and_unicode_spaces() {
        assert_eq!(std_norm("a\u{00a0}b"), "a b");
        assert_eq!(std_norm("a\u{2003}b"), "a b");
        assert_eq!(std_norm("a\u{3000}b"), "a b");
    }

    #[test]
    fn test_fullwidth_ascii() {
        assert_eq!(std_norm("ＡＢＣ"), "abc");
        assert_eq!(std_norm("１２３"), "123");
        assert_eq!(std_norm("！？"), "!?");
    }

    #[test]
    fn test_halfwidth_katakana() {
        // voiced mark composes: ｶﾞ -> ガ
        assert_eq!(std_norm("\u{ff76}\u{ff9e}"), "\u{30ac}");
        // semi-voiced: ﾊﾟ -> パ
        assert_eq!(std_norm("\u{ff8a}\u{ff9f}"), "\u{30d1}");
        // plain: ｱ -> ア
        assert_eq!(std_norm("\u{ff71}"), "\u{30a2}");
        // ｳﾞ -> ヴ
        assert_eq!(std_norm("\u{ff73}\u{ff9e}"), "\u{30f4}");
    }

    #[test]
    fn test_greek_and_cyrillic() {
        assert_eq!(std_norm("ΑΒΓ"), "αβγ");
        assert_eq!(std_norm("АБВ"), "абв");
        assert_eq!(std_norm("ЀЁ"), "ѐё");
    }

    #[test]
    fn test_idempotent() {
        for s in ["Hello  World", "Café RÉSUMÉ", "ＡＢｶﾞ ΑБ", "  x  \t y "] {
            let once = std_norm(s);
            assert_eq!(std_norm(&once), once);
        }
    }

    #[test]
    fn test_astral_passthrough() {
        // astral codepoints survive as surrogate pairs, untouched by folds
        let s = "a𝒳b";
        let n = std_norm(s);
        assert_eq!(n, "a𝒳b");
    }
}
