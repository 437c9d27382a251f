//! Text normalization for evidence matching.
//!
//! Folds text into a canonical comparison form: NFKD decomposition, combining
//! marks stripped, case-folded to lower, NFKC recomposition, whitespace
//! removed. Used only when anchoring model-quoted evidence to profile text;
//! the original text is preserved in emitted reasons.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalize `text` for substring comparison.
pub fn normalize(text: &str) -> String {
    text.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .nfkc()
        .filter(|c| !c.is_whitespace())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ascii_lowercases_and_strips_whitespace() {
        assert_eq!(normalize("Hello World"), "helloworld");
        assert_eq!(normalize("  tabs\tand\nnewlines  "), "tabsandnewlines");
    }

    #[test]
    fn test_diacritics_are_stripped() {
        assert_eq!(normalize("Café"), "cafe");
        assert_eq!(normalize("naïve résumé"), "naiveresume");
        assert_eq!(normalize("Ángel"), "angel");
    }

    #[test]
    fn test_fullwidth_folds_to_ascii() {
        assert_eq!(normalize("ＨＥＬＬＯ"), "hello");
        assert_eq!(normalize("ｈｉ　ｔｈｅｒｅ"), "hithere");
    }

    #[test]
    fn test_empty_and_whitespace_only() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \t\n"), "");
    }

    #[test]
    fn test_non_latin_preserved() {
        assert_eq!(normalize("Привет Мир"), "приветмир");
    }
}
