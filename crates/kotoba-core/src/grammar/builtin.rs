//! Grammars shipped with the engine, addressable by name from config.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;

use super::{GrammarDefinition, GrammarError};

/// JSON whose root is a multi-line array. Trailing whitespace after the root
/// array is not allowed, so generation can stop right after `]`. Strings may
/// contain Japanese characters.
pub const JSON_ARRAY: &str = r#"
root   ::= arr
value  ::= object | array | string | number | ("true" | "false" | "null") ws

arr  ::=
  "[\n" ws (
            value
    (",\n" ws value)*
  )? "]"

object ::=
  "{" ws (
            string ":" ws value
    ("," ws string ":" ws value)*
  )? "}" ws

array  ::=
  "[" ws (
            value
    ("," ws value)*
  )? "]" ws

string ::=
  "\"" (
    [^"\\\x7F\x00-\x1F] |
    "\\" (["\\bfnrt] | "u" [0-9a-fA-F]{4}) | # escapes
    jp-char
  )* "\"" ws

number ::= ("-"? ([0-9] | [1-9] [0-9]{0,15})) ("." [0-9]+)? ([eE] [-+]? [1-9] [0-9]{0,15})? ws

# optional space after literals
ws ::= | " " | "\n" [ \t]{0,20}

jp-char     ::= hiragana | katakana | punctuation | cjk
hiragana    ::= [ぁ-ゟ]
katakana    ::= [ァ-ヿ]
punctuation ::= [、-〾]
cjk         ::= [一-鿿]
"#;

/// Japanese prose: kana, kanji, Japanese punctuation and full-width forms,
/// one or more lines.
pub const JAPANESE: &str = r#"
root        ::= line ("\n" line)*
line        ::= jp-char+

jp-char     ::= hiragana | katakana | punctuation | cjk | fullwidth
hiragana    ::= [ぁ-ゟ]
katakana    ::= [ァ-ヿ]
punctuation ::= [、-〾]
cjk         ::= [一-鿿]
fullwidth   ::= [！-～]
"#;

/// Multi-line JSON array of `{"prefecture": ..., "capital": ...}` objects.
pub const PREFECTURES: &str = r#"
root   ::= "[\n" ws ( entry (",\n" ws entry)* )? "]"

entry  ::=
  "{" ws "\"prefecture\":" ws string "," ws "\"capital\":" ws string "}" ws

string ::=
  "\"" (
    [^"\\\x7F\x00-\x1F] |
    "\\" (["\\bfnrt] | "u" [0-9a-fA-F]{4})
  )* "\"" ws

ws ::= | " " | "\n" [ \t]{0,20}
"#;

static SOURCES: &[(&str, &str)] = &[
    ("json_array", JSON_ARRAY),
    ("japanese", JAPANESE),
    ("prefectures", PREFECTURES),
];

static COMPILED: Lazy<HashMap<&'static str, Result<Arc<GrammarDefinition>, GrammarError>>> =
    Lazy::new(|| {
        SOURCES
            .iter()
            .map(|&(name, src)| (name, GrammarDefinition::parse(src).map(Arc::new)))
            .collect()
    });

/// Names accepted by [`by_name`].
pub fn names() -> impl Iterator<Item = &'static str> {
    SOURCES.iter().map(|&(name, _)| name)
}

/// GBNF source of a built-in grammar.
pub fn source(name: &str) -> Option<&'static str> {
    SOURCES
        .iter()
        .find(|&&(n, _)| n == name)
        .map(|&(_, src)| src)
}

/// Compiled built-in grammar, parsed once per process and shared.
pub fn by_name(name: &str) -> Result<Arc<GrammarDefinition>, GrammarError> {
    COMPILED
        .get(name)
        .cloned()
        .unwrap_or_else(|| Err(GrammarError::UnknownBuiltin(name.to_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_compiles() {
        for name in names() {
            if let Err(e) = by_name(name) {
                panic!("builtin `{name}` failed to compile: {e}");
            }
        }
    }

    #[test]
    fn compiled_once_and_shared() {
        let a = by_name("json_array").unwrap();
        let b = by_name("json_array").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_name() {
        assert_eq!(
            by_name("yaml"),
            Err(GrammarError::UnknownBuiltin("yaml".into()))
        );
        assert_eq!(source("yaml"), None);
        assert!(source("japanese").is_some());
    }
}
