//! GBNF text → flat rule tables.
//!
//! Supported syntax: `name ::= alternates` rules, string literals, character
//! classes (`[a-z]`, `[^"]`), `.`, groups, rule references, the `*` `+` `?`
//! operators and bounded repetition `{m}` `{m,}` `{m,n}`. Comments start with
//! `#`. A newline ends a top-level sequence but is free inside groups.

use std::collections::HashMap;
use std::str::FromStr;

use super::{Element, GrammarError};

/// Upper bound for `{m,n}` counts; each optional repetition becomes a rule.
const MAX_REPETITION: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarDefinition {
    rules: Vec<Vec<Element>>,
    names: Vec<String>,
    root: usize,
}

impl GrammarDefinition {
    /// Parse and validate a grammar. The start rule is always `root`.
    pub fn parse(src: &str) -> Result<Self, GrammarError> {
        let mut parser = Parser::new(src);
        parser.parse_all()?;
        parser.finish()
    }

    /// Number of rules, including the ones generated for groups and repetitions.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rule_name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    #[inline]
    pub(crate) fn rules(&self) -> &[Vec<Element>] {
        &self.rules
    }

    #[inline]
    pub(crate) fn root(&self) -> usize {
        self.root
    }
}

impl FromStr for GrammarDefinition {
    type Err = GrammarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[inline]
fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

struct Parser {
    src: Vec<char>,
    symbols: HashMap<String, usize>,
    names: Vec<String>,
    rules: Vec<Vec<Element>>,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            src: src.chars().collect(),
            symbols: HashMap::new(),
            names: Vec::new(),
            rules: Vec::new(),
        }
    }

    #[inline]
    fn at(&self, pos: usize) -> Option<char> {
        self.src.get(pos).copied()
    }

    fn error(&self, pos: usize, message: impl Into<String>) -> GrammarError {
        let upto = &self.src[..pos.min(self.src.len())];
        let line = upto.iter().filter(|&&c| c == '\n').count() + 1;
        let column = upto.iter().rev().take_while(|&&c| c != '\n').count() + 1;
        GrammarError::Parse {
            line,
            column,
            message: message.into(),
        }
    }

    fn symbol_id(&mut self, name: &str) -> usize {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.names.len();
        self.symbols.insert(name.to_owned(), id);
        self.names.push(name.to_owned());
        id
    }

    fn generate_symbol_id(&mut self, base: &str) -> usize {
        let id = self.names.len();
        let name = format!("{base}_{id}");
        self.symbols.insert(name.clone(), id);
        self.names.push(name);
        id
    }

    fn add_rule(&mut self, id: usize, rule: Vec<Element>) {
        if self.rules.len() <= id {
            self.rules.resize_with(id + 1, Vec::new);
        }
        self.rules[id] = rule;
    }

    fn skip_space(&self, mut pos: usize, newline_ok: bool) -> usize {
        while let Some(c) = self.at(pos) {
            match c {
                '#' => {
                    while self.at(pos).is_some_and(|c| c != '\r' && c != '\n') {
                        pos += 1;
                    }
                }
                ' ' | '\t' => pos += 1,
                '\r' | '\n' if newline_ok => pos += 1,
                _ => break,
            }
        }
        pos
    }

    fn parse_name(&self, pos: usize) -> Result<(String, usize), GrammarError> {
        let mut end = pos;
        while self.at(end).is_some_and(is_word_char) {
            end += 1;
        }
        if end == pos {
            return Err(self.error(pos, "expecting name"));
        }
        Ok((self.src[pos..end].iter().collect(), end))
    }

    fn parse_int(&self, pos: usize) -> Result<(usize, usize), GrammarError> {
        let mut end = pos;
        while self.at(end).is_some_and(|c| c.is_ascii_digit()) {
            end += 1;
        }
        if end == pos {
            return Err(self.error(pos, "expecting integer"));
        }
        let digits: String = self.src[pos..end].iter().collect();
        let value = digits
            .parse::<usize>()
            .map_err(|_| self.error(pos, "integer out of range"))?;
        Ok((value, end))
    }

    fn parse_hex(&self, pos: usize, size: usize) -> Result<(u32, usize), GrammarError> {
        let mut value = 0u32;
        let mut end = pos;
        while end < pos + size {
            match self.at(end).and_then(|c| c.to_digit(16)) {
                Some(d) => {
                    value = (value << 4) | d;
                    end += 1;
                }
                None => break,
            }
        }
        if end != pos + size {
            return Err(self.error(pos, format!("expecting {size} hex chars")));
        }
        Ok((value, end))
    }

    fn parse_char(&self, pos: usize) -> Result<(u32, usize), GrammarError> {
        match self.at(pos) {
            Some('\\') => match self.at(pos + 1) {
                Some('x') => self.parse_hex(pos + 2, 2),
                Some('u') => self.parse_hex(pos + 2, 4),
                Some('U') => self.parse_hex(pos + 2, 8),
                Some('t') => Ok(('\t' as u32, pos + 2)),
                Some('r') => Ok(('\r' as u32, pos + 2)),
                Some('n') => Ok(('\n' as u32, pos + 2)),
                Some(c @ ('\\' | '"' | '[' | ']' | '-')) => Ok((c as u32, pos + 2)),
                Some(c) => Err(self.error(pos, format!("unknown escape `\\{c}`"))),
                None => Err(self.error(pos, "unexpected end of input")),
            },
            Some(c) => Ok((c as u32, pos + 1)),
            None => Err(self.error(pos, "unexpected end of input")),
        }
    }

    fn parse_sequence(
        &mut self,
        mut pos: usize,
        rule_name: &str,
        out: &mut Vec<Element>,
        is_nested: bool,
    ) -> Result<usize, GrammarError> {
        let mut last_sym_start = out.len();
        while let Some(c) = self.at(pos) {
            match c {
                '"' => {
                    pos += 1;
                    last_sym_start = out.len();
                    loop {
                        match self.at(pos) {
                            Some('"') => break,
                            Some(_) => {
                                let (ch, next) = self.parse_char(pos)?;
                                out.push(Element::Char(ch));
                                pos = next;
                            }
                            None => return Err(self.error(pos, "unexpected end of input")),
                        }
                    }
                    pos = self.skip_space(pos + 1, is_nested);
                }
                '[' => {
                    pos += 1;
                    let negated = self.at(pos) == Some('^');
                    if negated {
                        pos += 1;
                    }
                    last_sym_start = out.len();
                    loop {
                        match self.at(pos) {
                            Some(']') => break,
                            Some(_) => {
                                let (ch, next) = self.parse_char(pos)?;
                                pos = next;
                                out.push(if last_sym_start < out.len() {
                                    Element::CharAlt(ch)
                                } else if negated {
                                    Element::CharNot(ch)
                                } else {
                                    Element::Char(ch)
                                });
                                if self.at(pos) == Some('-') && self.at(pos + 1) != Some(']') {
                                    if self.at(pos + 1).is_none() {
                                        return Err(self.error(pos, "unexpected end of input"));
                                    }
                                    let (hi, next) = self.parse_char(pos + 1)?;
                                    pos = next;
                                    out.push(Element::CharRngUpper(hi));
                                }
                            }
                            None => return Err(self.error(pos, "unexpected end of input")),
                        }
                    }
                    pos = self.skip_space(pos + 1, is_nested);
                }
                c if is_word_char(c) => {
                    let (name, end) = self.parse_name(pos)?;
                    let id = self.symbol_id(&name);
                    last_sym_start = out.len();
                    out.push(Element::RuleRef(id));
                    pos = self.skip_space(end, is_nested);
                }
                '(' => {
                    pos = self.skip_space(pos + 1, true);
                    let sub = self.generate_symbol_id(rule_name);
                    pos = self.parse_alternates(pos, rule_name, sub, true)?;
                    last_sym_start = out.len();
                    out.push(Element::RuleRef(sub));
                    if self.at(pos) != Some(')') {
                        return Err(self.error(pos, "expecting ')'"));
                    }
                    pos = self.skip_space(pos + 1, is_nested);
                }
                '.' => {
                    last_sym_start = out.len();
                    out.push(Element::CharAny);
                    pos = self.skip_space(pos + 1, is_nested);
                }
                '*' | '+' | '?' => {
                    let (min, max) = match c {
                        '*' => (0, None),
                        '+' => (1, None),
                        _ => (0, Some(1)),
                    };
                    self.handle_repetitions(out, last_sym_start, rule_name, min, max, pos)?;
                    pos = self.skip_space(pos + 1, is_nested);
                }
                '{' => {
                    let open = pos;
                    pos = self.skip_space(pos + 1, is_nested);
                    if !self.at(pos).is_some_and(|c| c.is_ascii_digit()) {
                        return Err(self.error(pos, "expecting an int"));
                    }
                    let (min, end) = self.parse_int(pos)?;
                    pos = self.skip_space(end, is_nested);
                    let max = match self.at(pos) {
                        Some('}') => {
                            pos = self.skip_space(pos + 1, is_nested);
                            Some(min)
                        }
                        Some(',') => {
                            pos = self.skip_space(pos + 1, is_nested);
                            let mut max = None;
                            if self.at(pos).is_some_and(|c| c.is_ascii_digit()) {
                                let (m, end) = self.parse_int(pos)?;
                                max = Some(m);
                                pos = self.skip_space(end, is_nested);
                            }
                            if self.at(pos) != Some('}') {
                                return Err(self.error(pos, "expecting '}'"));
                            }
                            pos = self.skip_space(pos + 1, is_nested);
                            max
                        }
                        _ => return Err(self.error(pos, "expecting ','")),
                    };
                    self.handle_repetitions(out, last_sym_start, rule_name, min, max, open)?;
                }
                _ => break,
            }
        }
        Ok(pos)
    }

    /// Rewrite `S{m,n}` as `S` repeated m times followed by nested optional
    /// rules: `S{1,3}` → `S S_1`, `S_1 ::= S S_2 |`, `S_2 ::= S |`.
    /// Unbounded repetition becomes one self-recursive rule `S_k ::= S S_k |`.
    fn handle_repetitions(
        &mut self,
        out: &mut Vec<Element>,
        last_sym_start: usize,
        rule_name: &str,
        min: usize,
        max: Option<usize>,
        pos: usize,
    ) -> Result<(), GrammarError> {
        if last_sym_start == out.len() {
            return Err(self.error(pos, "expecting preceding item to */+/?/{"));
        }
        if min > MAX_REPETITION || max.is_some_and(|m| m > MAX_REPETITION) {
            return Err(self.error(pos, "number of repetitions exceeds sane defaults"));
        }
        if max.is_some_and(|m| m < min) {
            return Err(self.error(pos, "repetition upper bound below lower bound"));
        }

        let prev: Vec<Element> = out[last_sym_start..].to_vec();
        if min == 0 {
            out.truncate(last_sym_start);
        } else {
            for _ in 1..min {
                out.extend_from_slice(&prev);
            }
        }

        let n_opt = match max {
            None => 1,
            Some(max) => max - min,
        };
        let mut last_rec = 0;
        for i in 0..n_opt {
            let rec_id = self.generate_symbol_id(rule_name);
            let mut rec = prev.clone();
            if i > 0 || max.is_none() {
                rec.push(Element::RuleRef(if max.is_none() { rec_id } else { last_rec }));
            }
            rec.push(Element::Alt);
            rec.push(Element::End);
            self.add_rule(rec_id, rec);
            last_rec = rec_id;
        }
        if n_opt > 0 {
            out.push(Element::RuleRef(last_rec));
        }
        Ok(())
    }

    fn parse_alternates(
        &mut self,
        pos: usize,
        rule_name: &str,
        rule_id: usize,
        is_nested: bool,
    ) -> Result<usize, GrammarError> {
        let mut rule = Vec::new();
        let mut pos = self.parse_sequence(pos, rule_name, &mut rule, is_nested)?;
        while self.at(pos) == Some('|') {
            rule.push(Element::Alt);
            pos = self.skip_space(pos + 1, true);
            pos = self.parse_sequence(pos, rule_name, &mut rule, is_nested)?;
        }
        rule.push(Element::End);
        self.add_rule(rule_id, rule);
        Ok(pos)
    }

    fn parse_rule(&mut self, pos: usize) -> Result<usize, GrammarError> {
        let (name, end) = self.parse_name(pos)?;
        let mut pos = self.skip_space(end, false);
        let id = self.symbol_id(&name);

        let assign = [self.at(pos), self.at(pos + 1), self.at(pos + 2)];
        if assign != [Some(':'), Some(':'), Some('=')] {
            return Err(self.error(pos, "expecting ::="));
        }
        pos = self.skip_space(pos + 3, true);
        pos = self.parse_alternates(pos, &name, id, false)?;

        match self.at(pos) {
            Some('\r') => pos += if self.at(pos + 1) == Some('\n') { 2 } else { 1 },
            Some('\n') => pos += 1,
            Some(_) => return Err(self.error(pos, "expecting newline or end")),
            None => {}
        }
        Ok(self.skip_space(pos, true))
    }

    fn parse_all(&mut self) -> Result<(), GrammarError> {
        let mut pos = self.skip_space(0, true);
        while pos < self.src.len() {
            pos = self.parse_rule(pos)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<GrammarDefinition, GrammarError> {
        self.rules.resize_with(self.names.len(), Vec::new);

        let root = match self.symbols.get("root") {
            Some(&id) if !self.rules[id].is_empty() => id,
            _ => return Err(GrammarError::MissingRoot),
        };

        for rule in &self.rules {
            for el in rule {
                if let Element::RuleRef(id) = *el {
                    if self.rules.get(id).map_or(true, Vec::is_empty) {
                        return Err(GrammarError::UndefinedRule(self.names[id].clone()));
                    }
                }
            }
        }

        let n = self.rules.len();
        let mut visited = vec![false; n];
        let mut in_progress = vec![false; n];
        let mut may_be_empty = vec![false; n];
        for id in 0..n {
            if visited[id] {
                continue;
            }
            if detect_left_recursion(
                &self.rules,
                id,
                &mut visited,
                &mut in_progress,
                &mut may_be_empty,
            ) {
                return Err(GrammarError::LeftRecursion(self.names[id].clone()));
            }
        }

        Ok(GrammarDefinition {
            rules: self.rules,
            names: self.names,
            root,
        })
    }
}

/// Depth-first walk over leftmost references. A rule reached again while it
/// is still on the walk can match itself without consuming input.
fn detect_left_recursion(
    rules: &[Vec<Element>],
    id: usize,
    visited: &mut [bool],
    in_progress: &mut [bool],
    may_be_empty: &mut [bool],
) -> bool {
    if in_progress[id] {
        return true;
    }
    if visited[id] {
        return false;
    }
    in_progress[id] = true;
    let rule = &rules[id];

    let mut at_rule_start = true;
    for el in rule {
        if el.is_end_of_sequence() {
            if at_rule_start {
                may_be_empty[id] = true;
                break;
            }
            at_rule_start = true;
        } else {
            at_rule_start = false;
        }
    }

    let mut leftmost = true;
    for el in rule {
        match *el {
            Element::RuleRef(sub) if leftmost => {
                if detect_left_recursion(rules, sub, visited, in_progress, may_be_empty) {
                    return true;
                }
                if !may_be_empty[sub] {
                    leftmost = false;
                }
            }
            el if el.is_end_of_sequence() => leftmost = true,
            _ => leftmost = false,
        }
    }

    in_progress[id] = false;
    visited[id] = true;
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Element::*;

    fn root_rule(def: &GrammarDefinition) -> &[Element] {
        &def.rules()[def.root()]
    }

    #[test]
    fn literal_and_range() {
        let def = GrammarDefinition::parse(r#"root ::= "a" [b-c]"#).unwrap();
        assert_eq!(
            root_rule(&def),
            &[Char('a' as u32), Char('b' as u32), CharRngUpper('c' as u32), End]
        );
    }

    #[test]
    fn negated_class_with_escapes() {
        let def = GrammarDefinition::parse(r#"root ::= [^"\\\x00-\x1F]"#).unwrap();
        assert_eq!(
            root_rule(&def),
            &[CharNot('"' as u32), CharAlt('\\' as u32), CharAlt(0), CharRngUpper(0x1F), End]
        );
    }

    #[test]
    fn unicode_escapes() {
        let def = GrammarDefinition::parse(r#"root ::= "\x41あ\U0001F600""#).unwrap();
        assert_eq!(root_rule(&def), &[Char(0x41), Char(0x3042), Char(0x1F600), End]);
    }

    #[test]
    fn alternates_comments_and_groups() {
        let src = "# leading comment\nroot ::= ( \"x\"\n  | \"y\" ) # trailing\n";
        let def = GrammarDefinition::parse(src).unwrap();
        let [RuleRef(group), End] = root_rule(&def) else {
            panic!("unexpected root {:?}", root_rule(&def));
        };
        assert_eq!(
            def.rules()[*group],
            vec![Char('x' as u32), Alt, Char('y' as u32), End]
        );
        assert_eq!(def.rule_name(*group), Some("root_1"));
    }

    #[test]
    fn bounded_repetition_expands_into_optional_rules() {
        let def = GrammarDefinition::parse(r#"root ::= "a"{2,3}"#).unwrap();
        let rule = root_rule(&def);
        assert_eq!(&rule[..2], &[Char('a' as u32), Char('a' as u32)]);
        let RuleRef(opt) = rule[2] else {
            panic!("expected optional tail, got {:?}", rule);
        };
        assert_eq!(def.rules()[opt], vec![Char('a' as u32), Alt, End]);
    }

    #[test]
    fn star_becomes_self_recursive_rule() {
        let def = GrammarDefinition::parse(r#"root ::= "a"*"#).unwrap();
        let [RuleRef(rec), End] = root_rule(&def) else {
            panic!("unexpected root {:?}", root_rule(&def));
        };
        assert_eq!(def.rules()[*rec], vec![Char('a' as u32), RuleRef(*rec), Alt, End]);
    }

    #[test]
    fn missing_root() {
        assert_eq!(
            GrammarDefinition::parse(r#"start ::= "a""#),
            Err(GrammarError::MissingRoot)
        );
    }

    #[test]
    fn undefined_reference() {
        assert_eq!(
            GrammarDefinition::parse("root ::= value"),
            Err(GrammarError::UndefinedRule("value".into()))
        );
    }

    #[test]
    fn left_recursion_is_rejected() {
        assert_eq!(
            GrammarDefinition::parse("root ::= root \"a\" | \"b\""),
            Err(GrammarError::LeftRecursion("root".into()))
        );
        // Hidden behind a rule that can match nothing.
        let err = GrammarDefinition::parse("root ::= ws root | \"b\"\nws ::= | \" \"").unwrap_err();
        assert!(matches!(err, GrammarError::LeftRecursion(_)));
    }

    #[test]
    fn unterminated_literal_reports_position() {
        let err = GrammarDefinition::parse("root ::= \"a\"\nnext ::= \"bc").unwrap_err();
        let GrammarError::Parse { line, message, .. } = err else {
            panic!("expected parse error, got {err:?}");
        };
        assert_eq!(line, 2);
        assert_eq!(message, "unexpected end of input");
    }

    #[test]
    fn repetition_without_operand() {
        assert!(matches!(
            GrammarDefinition::parse("root ::= *"),
            Err(GrammarError::Parse { .. })
        ));
        assert!(matches!(
            GrammarDefinition::parse(r#"root ::= "a"{3,1}"#),
            Err(GrammarError::Parse { .. })
        ));
    }

    #[test]
    fn from_str_matches_parse() {
        let a: GrammarDefinition = "root ::= [a-z]+".parse().unwrap();
        assert_eq!(a, GrammarDefinition::parse("root ::= [a-z]+").unwrap());
    }
}
