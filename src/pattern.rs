//! The pattern mini-language: a compact textual notation compiled on demand
//! into a fresh node graph.
//!
//! The notation is itself defined as a [`Definition`] built with the public
//! grammar builder, constructed once per process; compiling a pattern means
//! matching its text with that bootstrap grammar and walking the token tree.
//!
//! # Pattern syntax
//!
//! | Token          | Meaning                                            |
//! |----------------|----------------------------------------------------|
//! | `abc`          | Literal text (any byte except the specials)        |
//! | `#`            | Any single byte                                    |
//! | `*`            | Gap: skip to the first point the rest matches      |
//! | `E+`           | One or more, greedy                                |
//! | `[a..z]`       | Byte range; `[abc]` explicit set; mixes allowed    |
//! | `[^…]`         | Negated set                                        |
//! | `E{2..5}`      | Greedy repeat of the preceding element             |
//! | `{2..5:E}`     | Greedy repeat, self-contained form                 |
//! | `{?0..:E}`     | Lazy repeat (modifier right after the brace)       |
//! | `{~1..2:E}`    | Plain repeat (no backtracking against what follows)|
//! | `(@name:E)`    | Capture the span matched by `E`                    |
//! | `(&name)`      | Replay the text captured under `name`              |
//! | `(>: E)`       | Positive lookahead                                 |
//! | `(!>: E)`      | Negative lookahead                                 |
//! | `(<: E)`       | Lookbehind (fixed-length `E`)                      |
//! | `(!<: E)`      | Negative lookbehind                                |
//! | `(E)`          | Grouping                                           |
//! | `^` / `$`      | Start / end of the match window                    |
//! | `X\|Y`         | Ordered choice                                     |
//! | `\n \t \r \f \0 \" \/ \\` and `\xHH` | Escapes                     |
//!
//! The specials `# * [ ] ( ) { } ^ $ \| \ +` are written with `\xHH` when
//! meant literally. Quantifier bounds are `{n}`, `{n..}`, `{..m}`, `{n..m}`.

use once_cell::sync::Lazy;
use phf::{Map, phf_map};

use crate::grammar::{Definition, GrammarBuilder, KeywordId, RuleId};
use crate::node::{
    self, ByteSet, Node, ahead, behind, capture, choice, chr, fail, glue, greedy, hint, lazy,
    none_of, not_ahead, not_behind, one_of, opt, pass, range, repeat, rule_ref, string,
};
use crate::splice::glow;
use crate::state::MatchState;
use crate::token::Token;

/// A pattern that failed to compile, with the offending offset into the
/// pattern text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub offset: usize,
    pub message: String,
}

impl CompileError {
    fn new(offset: usize, message: &str) -> Self {
        Self {
            offset,
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pattern error at offset {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Escape characters accepted after a backslash.
static ESCAPES: Map<u8, u8> = phf_map! {
    b'n' => b'\n',
    b't' => b'\t',
    b'r' => b'\r',
    b'f' => 0x0c,
    b'0' => 0x00,
    b'"' => b'"',
    b'/' => b'/',
    b'\\' => b'\\',
};

/// Bytes that cannot appear as plain literals.
const SPECIALS: &[u8] = b"#*[](){}^$|\\+";

// ─── Bootstrap grammar ──────────────────────────────────────────────────────

struct Bootstrap {
    def: Definition,
    seq: RuleId,
    lit: RuleId,
    esc: RuleId,
    any: RuleId,
    gap: RuleId,
    boi: RuleId,
    eoi: RuleId,
    class: RuleId,
    neg: RuleId,
    crange: RuleId,
    cchar: RuleId,
    cap: RuleId,
    replay: RuleId,
    look: RuleId,
    group: RuleId,
    qexpr: RuleId,
    qfix: RuleId,
    qmod: RuleId,
    plus: RuleId,
    num: RuleId,
    dots: RuleId,
    name: RuleId,
    kw_behind: KeywordId,
    kw_not_behind: KeywordId,
    kw_ahead: KeywordId,
    kw_not_ahead: KeywordId,
}

static BOOTSTRAP: Lazy<Bootstrap> = Lazy::new(Bootstrap::build);

fn hex_digit() -> Node {
    let mut set = ByteSet::new();
    set.add_range(b'0', b'9');
    set.add_range(b'a', b'f');
    set.add_range(b'A', b'F');
    Node::Range(set)
}

fn name_char() -> Node {
    let mut set = ByteSet::new();
    set.add_range(b'a', b'z');
    set.add_range(b'A', b'Z');
    set.add_range(b'0', b'9');
    set.add(b'_');
    Node::Range(set)
}

/// A closing delimiter that reports its absence through the hint.
fn closer(byte: u8, message: &str) -> Node {
    choice(vec![chr(byte), glue(vec![hint(message), fail()])])
}

impl Bootstrap {
    fn build() -> Self {
        let mut b = GrammarBuilder::new();

        b.rule(
            "esc",
            glue(vec![
                chr(b'\\'),
                choice(vec![
                    one_of("ntrf0\"/\\"),
                    glue(vec![
                        chr(b'x'),
                        choice(vec![
                            glue(vec![hex_digit(), hex_digit()]),
                            glue(vec![hint("invalid hex escape"), fail()]),
                        ]),
                    ]),
                    glue(vec![hint("invalid escape"), fail()]),
                ]),
            ]),
        );
        b.rule(
            "lit",
            repeat(1, None, choice(vec![none_of(SPECIALS), rule_ref("esc")])),
        );
        b.rule("any", chr(b'#'));
        b.rule("gap", chr(b'*'));
        b.rule("boi", chr(b'^'));
        b.rule("eoi", chr(b'$'));
        b.rule("plus", chr(b'+'));

        b.rule("neg", chr(b'^'));
        b.rule("cchar", choice(vec![rule_ref("esc"), none_of("]\\.")]));
        b.rule(
            "crange",
            glue(vec![rule_ref("cchar"), string(".."), rule_ref("cchar")]),
        );
        b.void_rule("citem", choice(vec![rule_ref("crange"), rule_ref("cchar")]));
        b.rule(
            "class",
            glue(vec![
                chr(b'['),
                opt(rule_ref("neg")),
                repeat(0, None, rule_ref("citem")),
                closer(b']', "expected ']' in character class"),
            ]),
        );

        b.rule("name", repeat(1, None, name_char()));
        b.rule("num", repeat(1, None, range(b'0', b'9')));
        b.rule("dots", string(".."));
        b.void_rule(
            "bounds",
            choice(vec![
                glue(vec![rule_ref("num"), rule_ref("dots"), rule_ref("num")]),
                glue(vec![rule_ref("num"), rule_ref("dots")]),
                glue(vec![rule_ref("dots"), rule_ref("num")]),
                rule_ref("num"),
            ]),
        );
        b.rule("qmod", one_of("?~"));
        b.rule(
            "qexpr",
            glue(vec![
                chr(b'{'),
                opt(rule_ref("qmod")),
                rule_ref("bounds"),
                chr(b':'),
                rule_ref("alt"),
                closer(b'}', "expected '}'"),
            ]),
        );
        b.rule(
            "qfix",
            glue(vec![
                chr(b'{'),
                opt(rule_ref("qmod")),
                rule_ref("bounds"),
                closer(b'}', "expected '}' in quantifier"),
            ]),
        );

        let look_ops = b.keywords(&["<:", "!<:", ">:", "!>:"]);
        b.rule(
            "look",
            glue(vec![
                chr(b'('),
                look_ops,
                repeat(0, None, chr(b' ')),
                rule_ref("alt"),
                closer(b')', "expected ')'"),
            ]),
        );
        b.rule(
            "cap",
            glue(vec![
                string("(@"),
                rule_ref("name"),
                chr(b':'),
                rule_ref("alt"),
                closer(b')', "expected ')'"),
            ]),
        );
        b.rule(
            "replay",
            glue(vec![
                string("(&"),
                rule_ref("name"),
                closer(b')', "expected ')'"),
            ]),
        );
        b.rule(
            "group",
            glue(vec![
                chr(b'('),
                rule_ref("alt"),
                closer(b')', "expected ')'"),
            ]),
        );

        b.void_rule(
            "item",
            glue(vec![
                choice(vec![
                    rule_ref("cap"),
                    rule_ref("replay"),
                    rule_ref("look"),
                    rule_ref("group"),
                    rule_ref("qexpr"),
                    rule_ref("class"),
                    rule_ref("any"),
                    rule_ref("gap"),
                    rule_ref("boi"),
                    rule_ref("eoi"),
                    rule_ref("lit"),
                ]),
                opt(choice(vec![rule_ref("qfix"), rule_ref("plus")])),
            ]),
        );
        b.rule("seq", repeat(0, None, rule_ref("item")));
        b.void_rule(
            "alt",
            glue(vec![
                rule_ref("seq"),
                repeat(0, None, glue(vec![chr(b'|'), rule_ref("seq")])),
            ]),
        );
        b.rule(
            "pattern",
            glue(vec![
                rule_ref("alt"),
                choice(vec![
                    node::eoi(),
                    glue(vec![hint("unexpected character in pattern"), fail()]),
                ]),
            ]),
        );
        b.entry("pattern");

        let def = b.build().expect("bootstrap pattern grammar must link");
        let id = |name: &str| def.rule_id(name).expect("bootstrap rule");
        let kw = |word: &str| def.keyword_id(word).expect("bootstrap keyword");
        Bootstrap {
            seq: id("seq"),
            lit: id("lit"),
            esc: id("esc"),
            any: id("any"),
            gap: id("gap"),
            boi: id("boi"),
            eoi: id("eoi"),
            class: id("class"),
            neg: id("neg"),
            crange: id("crange"),
            cchar: id("cchar"),
            cap: id("cap"),
            replay: id("replay"),
            look: id("look"),
            group: id("group"),
            qexpr: id("qexpr"),
            qfix: id("qfix"),
            qmod: id("qmod"),
            plus: id("plus"),
            num: id("num"),
            dots: id("dots"),
            name: id("name"),
            kw_behind: kw("<:"),
            kw_not_behind: kw("!<:"),
            kw_ahead: kw(">:"),
            kw_not_ahead: kw("!>:"),
            def,
        }
    }
}

// ─── Compiler ───────────────────────────────────────────────────────────────

/// Compile a pattern into a node graph grafted onto `builder`: capture names
/// in the pattern are registered with the host grammar.
pub fn compile_pattern(text: &str, builder: &mut GrammarBuilder) -> Result<Node, CompileError> {
    let boot = &*BOOTSTRAP;
    let input = text.as_bytes();
    let mut state = MatchState::new(&boot.def);
    let Some(tree) = boot.def.matches_with(input, &mut state) else {
        let (message, offset) = match state.hint() {
            Some((message, offset)) => (message.to_string(), offset),
            None => ("invalid pattern".to_string(), 0),
        };
        return Err(CompileError { offset, message });
    };
    compile_alt(boot, input, tree.children(), builder)
}

fn compile_alt(
    boot: &Bootstrap,
    input: &[u8],
    seqs: &[Token],
    builder: &mut GrammarBuilder,
) -> Result<Node, CompileError> {
    let mut alts = Vec::new();
    for seq in seqs.iter().filter(|t| t.rule().rule == boot.seq) {
        alts.push(compile_seq(boot, input, seq, builder)?);
    }
    Ok(match alts.len() {
        0 => pass(),
        1 => alts.remove(0),
        _ => choice(alts),
    })
}

fn compile_seq(
    boot: &Bootstrap,
    input: &[u8],
    seq: &Token,
    builder: &mut GrammarBuilder,
) -> Result<Node, CompileError> {
    let mut nodes: Vec<Node> = Vec::new();
    for child in seq.children() {
        let rule = child.rule().rule;
        if rule == boot.qfix {
            let inner = nodes
                .pop()
                .ok_or_else(|| CompileError::new(child.start(), "quantifier without an element"))?;
            let (min, max) = parse_bounds(boot, input, child)?;
            let modifier = quant_modifier(boot, input, child);
            nodes.push(apply_quantifier(modifier, min, max, inner, child.start())?);
        } else if rule == boot.plus {
            let inner = nodes
                .pop()
                .ok_or_else(|| CompileError::new(child.start(), "'+' without an element"))?;
            nodes.push(greedy(1, None, inner));
        } else {
            nodes.push(compile_primary(boot, input, child, builder)?);
        }
    }
    Ok(match nodes.len() {
        0 => pass(),
        1 => nodes.remove(0),
        _ => glue(nodes),
    })
}

fn compile_primary(
    boot: &Bootstrap,
    input: &[u8],
    tok: &Token,
    builder: &mut GrammarBuilder,
) -> Result<Node, CompileError> {
    let rule = tok.rule().rule;
    if rule == boot.lit {
        compile_literal(boot, input, tok)
    } else if rule == boot.any {
        Ok(node::any())
    } else if rule == boot.gap {
        // The gap stops at the first position where the trailing pattern
        // matches; `find` over `#*x` depends on this.
        Ok(lazy(0, node::any()))
    } else if rule == boot.boi {
        Ok(node::boi())
    } else if rule == boot.eoi {
        Ok(node::eoi())
    } else if rule == boot.class {
        compile_class(boot, input, tok)
    } else if rule == boot.group {
        compile_alt(boot, input, tok.children(), builder)
    } else if rule == boot.cap {
        let name = capture_name(boot, input, tok)?;
        let slot = builder.capture(&name);
        let inner = compile_alt(boot, input, &tok.children()[1..], builder)?;
        Ok(capture(slot, inner))
    } else if rule == boot.replay {
        let name = capture_name(boot, input, tok)?;
        Ok(node::replay(builder.capture(&name)))
    } else if rule == boot.look {
        let inner = compile_alt(boot, input, tok.children(), builder)?;
        let op = tok
            .keyword()
            .ok_or_else(|| CompileError::new(tok.start(), "unknown lookaround"))?;
        Ok(if op == boot.kw_behind {
            behind(inner)
        } else if op == boot.kw_not_behind {
            not_behind(inner)
        } else if op == boot.kw_ahead {
            ahead(inner)
        } else {
            not_ahead(inner)
        })
    } else if rule == boot.qexpr {
        let (min, max) = parse_bounds(boot, input, tok)?;
        let modifier = quant_modifier(boot, input, tok);
        let inner = compile_alt(boot, input, tok.children(), builder)?;
        apply_quantifier(modifier, min, max, inner, tok.start())
    } else {
        Err(CompileError::new(tok.start(), "unsupported pattern element"))
    }
}

fn compile_literal(boot: &Bootstrap, input: &[u8], tok: &Token) -> Result<Node, CompileError> {
    let mut bytes = Vec::new();
    let mut bad = None;
    glow(tok, &mut |owner, from, to| {
        if owner.rule().rule == boot.esc {
            match decode_escape(&input[from..to]) {
                Some(b) => bytes.push(b),
                None => bad = Some(from),
            }
        } else {
            bytes.extend_from_slice(&input[from..to]);
        }
    });
    if let Some(offset) = bad {
        return Err(CompileError::new(offset, "invalid escape"));
    }
    Ok(match bytes.as_slice() {
        [b] => chr(*b),
        _ => string(bytes),
    })
}

fn compile_class(boot: &Bootstrap, input: &[u8], tok: &Token) -> Result<Node, CompileError> {
    let mut set = ByteSet::new();
    let mut negated = false;
    for child in tok.children() {
        let rule = child.rule().rule;
        if rule == boot.neg {
            negated = true;
        } else if rule == boot.crange {
            let lo = class_byte(boot, input, &child.children()[0])?;
            let hi = class_byte(boot, input, &child.children()[1])?;
            if lo > hi {
                return Err(CompileError::new(child.start(), "invalid character range"));
            }
            set.add_range(lo, hi);
        } else if rule == boot.cchar {
            set.add(class_byte(boot, input, child)?);
        }
    }
    Ok(if negated {
        Node::Except(set)
    } else {
        Node::Range(set)
    })
}

fn class_byte(boot: &Bootstrap, input: &[u8], tok: &Token) -> Result<u8, CompileError> {
    match tok.children().first() {
        Some(esc) if esc.rule().rule == boot.esc => decode_escape(esc.text(input))
            .ok_or_else(|| CompileError::new(esc.start(), "invalid escape")),
        _ => Ok(input[tok.start()]),
    }
}

fn capture_name(boot: &Bootstrap, input: &[u8], tok: &Token) -> Result<String, CompileError> {
    tok.children()
        .first()
        .filter(|c| c.rule().rule == boot.name)
        .map(|c| String::from_utf8_lossy(c.text(input)).into_owned())
        .ok_or_else(|| CompileError::new(tok.start(), "missing capture name"))
}

fn quant_modifier(boot: &Bootstrap, input: &[u8], tok: &Token) -> Option<u8> {
    tok.children()
        .iter()
        .find(|c| c.rule().rule == boot.qmod)
        .map(|c| input[c.start()])
}

fn parse_bounds(
    boot: &Bootstrap,
    input: &[u8],
    tok: &Token,
) -> Result<(usize, Option<usize>), CompileError> {
    let mut lo = None;
    let mut hi = None;
    let mut dots = false;
    for child in tok.children() {
        let rule = child.rule().rule;
        if rule == boot.num {
            let value = parse_number(input, child)?;
            if dots {
                hi = Some(value);
            } else {
                lo = Some(value);
            }
        } else if rule == boot.dots {
            dots = true;
        }
    }
    let bounds = match (lo, dots, hi) {
        (Some(n), false, _) => (n, Some(n)),
        (Some(n), true, None) => (n, None),
        (Some(n), true, Some(m)) => (n, Some(m)),
        (None, true, Some(m)) => (0, Some(m)),
        _ => (0, None),
    };
    if let (n, Some(m)) = bounds
        && n > m
    {
        return Err(CompileError::new(tok.start(), "invalid quantifier range"));
    }
    Ok(bounds)
}

fn parse_number(input: &[u8], tok: &Token) -> Result<usize, CompileError> {
    std::str::from_utf8(tok.text(input))
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CompileError::new(tok.start(), "number out of range"))
}

fn apply_quantifier(
    modifier: Option<u8>,
    min: usize,
    max: Option<usize>,
    inner: Node,
    at: usize,
) -> Result<Node, CompileError> {
    match modifier {
        None => Ok(greedy(min, max, inner)),
        Some(b'~') => Ok(repeat(min, max, inner)),
        Some(b'?') => {
            if max.is_some() {
                Err(CompileError::new(at, "lazy quantifier needs an open upper bound"))
            } else {
                Ok(lazy(min, inner))
            }
        }
        Some(_) => Err(CompileError::new(at, "unknown quantifier modifier")),
    }
}

fn decode_escape(text: &[u8]) -> Option<u8> {
    match text {
        [b'\\', b'x', h1, h2] => Some(hex_value(*h1)? * 16 + hex_value(*h2)?),
        [b'\\', c] => ESCAPES.get(c).copied(),
        _ => None,
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// ─── Pattern facade ─────────────────────────────────────────────────────────

/// A compiled pattern wrapped in its own single-rule definition.
#[derive(Debug)]
pub struct Pattern {
    text: String,
    def: Definition,
}

impl Pattern {
    pub fn new(text: &str) -> Result<Self, CompileError> {
        let mut builder = GrammarBuilder::new();
        let node = compile_pattern(text, &mut builder)?;
        builder.rule("pattern", node);
        builder.entry("pattern");
        let def = builder.build().map_err(|e| CompileError {
            offset: 0,
            message: e.to_string(),
        })?;
        Ok(Self {
            text: text.to_string(),
            def,
        })
    }

    /// The pattern source text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The single-rule definition behind this pattern (for capture ids and
    /// token dumps).
    pub fn definition(&self) -> &Definition {
        &self.def
    }

    /// A state sized for this pattern's captures.
    pub fn state(&self) -> MatchState {
        MatchState::new(&self.def)
    }

    /// Match at `pos` without requiring the rest of the buffer to be
    /// consumed.
    pub fn match_at(&self, input: &[u8], pos: usize) -> Option<Token> {
        self.def.match_prefix(input, pos)
    }

    pub fn match_at_with(&self, input: &[u8], pos: usize, state: &mut MatchState) -> Option<Token> {
        self.def.match_prefix_with(input, pos, state)
    }

    /// Whole-buffer match.
    pub fn is_match(&self, input: &[u8]) -> bool {
        self.def.matches(input).is_some()
    }

    /// First start offset at or after `from` where the pattern matches.
    pub fn find(&self, input: &[u8], from: usize) -> Option<(Token, usize)> {
        self.def.find(input, from)
    }

    pub fn find_with(
        &self,
        input: &[u8],
        from: usize,
        state: &mut MatchState,
    ) -> Option<(Token, usize)> {
        self.def.find_with(input, from, state)
    }
}
