//! Token trees: the hierarchical output of a successful match.
//!
//! Every token covers a span of the input buffer. Children nest inside their
//! parent's span, are ordered by start offset, and never overlap. Positions
//! are **byte** offsets into the matched buffer.

use std::fmt::Write as _;

use itertools::Itertools;

use crate::grammar::{Definition, KeywordId, RuleKey};

/// One node of a token tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub(crate) rule: RuleKey,
    pub(crate) keyword: Option<KeywordId>,
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) children: Vec<Token>,
}

impl Token {
    pub(crate) fn new(rule: RuleKey, start: usize) -> Self {
        Self {
            rule,
            keyword: None,
            start,
            end: start,
            children: Vec::new(),
        }
    }

    /// Identity of the rule that produced this token.
    pub fn rule(&self) -> RuleKey {
        self.rule
    }

    /// The keyword matched inside this token, if any.
    pub fn keyword(&self) -> Option<KeywordId> {
        self.keyword
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// The `[start, end)` span as a pair.
    pub fn span(&self) -> (usize, usize) {
        (self.start, self.end)
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Ordered child tokens.
    pub fn children(&self) -> &[Token] {
        &self.children
    }

    /// The bytes this token covers.
    pub fn text<'a>(&self, input: &'a [u8]) -> &'a [u8] {
        &input[self.start.min(input.len())..self.end.min(input.len())]
    }

    /// The covered bytes as (lossy) UTF-8, convenient in diagnostics.
    pub fn text_str<'a>(&self, input: &'a [u8]) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(self.text(input))
    }

    /// First child produced by the named rule, resolved against `def`.
    pub fn child_named<'a>(&'a self, def: &Definition, name: &str) -> Option<&'a Token> {
        self.children
            .iter()
            .find(|c| def.rule_name(c.rule) == Some(name))
    }

    /// Depth-first traversal of this token and all descendants.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Token)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// Indented tree rendering with rule names resolved against `def`,
    /// for debugging and the pattern tester.
    pub fn dump(&self, def: &Definition, input: &[u8]) -> String {
        let mut out = String::new();
        self.dump_into(def, input, 0, &mut out);
        out
    }

    fn dump_into(&self, def: &Definition, input: &[u8], depth: usize, out: &mut String) {
        let name = def.rule_name(self.rule).unwrap_or("?");
        let _ = write!(out, "{:indent$}{name} [{}..{})", "", self.start, self.end, indent = depth * 2);
        if let Some(kw) = self.keyword
            && let Some(word) = def.keyword_name(kw)
        {
            let _ = write!(out, " kw={word:?}");
        }
        if self.children.is_empty() {
            let _ = write!(out, " {:?}", self.text_str(input));
        } else {
            let summary = self
                .children
                .iter()
                .map(|c| def.rule_name(c.rule).unwrap_or("?"))
                .join(" ");
            let _ = write!(out, " ({summary})");
        }
        out.push('\n');
        for child in &self.children {
            child.dump_into(def, input, depth + 1, out);
        }
    }
}
