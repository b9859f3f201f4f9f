use std::sync::Arc;

use crate::grammar::{Definition, GrammarBuilder};
use crate::node::*;
use crate::state::MatchState;
use crate::token::Token;

fn def_of(node: Node) -> Definition {
    let mut b = GrammarBuilder::new();
    b.rule("top", node);
    b.entry("top");
    b.build().expect("grammar should link")
}

fn span_of(def: &Definition, input: &[u8]) -> Option<(usize, usize)> {
    def.matches(input).map(|t| t.span())
}

/// Rule names and spans of a token and all descendants, in depth-first order.
fn flatten(def: &Definition, tok: &Token) -> Vec<(String, usize, usize)> {
    let mut out = Vec::new();
    tok.walk(&mut |t| {
        let name = def.rule_name(t.rule()).unwrap_or("?").to_string();
        out.push((name, t.start(), t.end()));
    });
    out
}

// --- Primitives ---

#[test]
fn char_and_string() {
    let def = def_of(glue(vec![chr(b'a'), string("bc")]));
    assert_eq!(span_of(&def, b"abc"), Some((0, 3)));
    assert_eq!(span_of(&def, b"abd"), None);
    assert_eq!(span_of(&def, b"ab"), None);
}

#[test]
fn any_consumes_one_byte() {
    let def = def_of(glue(vec![any(), any()]));
    assert_eq!(span_of(&def, b"xy"), Some((0, 2)));
    assert_eq!(span_of(&def, b"x"), None);
}

#[test]
fn ranges_and_exceptions() {
    let def = def_of(glue(vec![range(b'a', b'z'), except_range(b'0', b'9')]));
    assert_eq!(span_of(&def, b"ax"), Some((0, 2)));
    assert_eq!(span_of(&def, b"a4"), None);
    assert_eq!(span_of(&def, b"Ax"), None);
}

#[test]
fn one_of_and_none_of() {
    let def = def_of(glue(vec![one_of("+-"), none_of("+-")]));
    assert_eq!(span_of(&def, b"+x"), Some((0, 2)));
    assert_eq!(span_of(&def, b"-+"), None);
}

#[test]
fn boi_eoi_anchor_the_window() {
    let def = def_of(glue(vec![boi(), string("ab"), eoi()]));
    assert_eq!(span_of(&def, b"ab"), Some((0, 2)));
    // In a suffix window the anchors move with the window.
    let def = def_of(glue(vec![boi(), string("b"), eoi()]));
    assert!(def.match_from(b"ab", 1).is_some());
}

#[test]
fn pass_and_fail() {
    let def = def_of(glue(vec![pass(), string("a"), choice(vec![fail(), chr(b'b')])]));
    assert_eq!(span_of(&def, b"ab"), Some((0, 2)));
}

#[test]
fn case_insensitive_literals() {
    let mut b = GrammarBuilder::new();
    b.case_insensitive(true);
    b.rule("top", glue(vec![string("if"), range(b'a', b'z')]));
    b.entry("top");
    let def = b.build().unwrap();
    assert!(def.matches(b"IFX").is_some());
    assert!(def.matches(b"ifx").is_some());
    assert!(def.matches(b"if1").is_none());
}

// --- Choice and sequence rollback ---

#[test]
fn choice_first_match_wins() {
    let def = def_of(choice(vec![string("a"), string("ab")]));
    // Ordered choice: "a" wins, leaving "b" unconsumed, so a full match fails.
    assert_eq!(span_of(&def, b"ab"), None);
    assert_eq!(span_of(&def, b"a"), Some((0, 1)));
}

#[test]
fn failed_alternative_rolls_back_tokens() {
    let mut b = GrammarBuilder::new();
    b.rule("a", chr(b'a'));
    b.rule(
        "top",
        choice(vec![
            glue(vec![rule_ref("a"), chr(b'x')]),
            glue(vec![rule_ref("a"), chr(b'y')]),
        ]),
    );
    b.entry("top");
    let def = b.build().unwrap();
    let tok = def.matches(b"ay").unwrap();
    // The first alternative's "a" token must not survive its failure.
    assert_eq!(tok.children().len(), 1);
    assert_eq!(tok.children()[0].span(), (0, 1));
}

// --- Repeats ---

#[test]
fn plain_repeat_bounds() {
    let def = def_of(repeat(2, Some(3), chr(b'a')));
    assert_eq!(span_of(&def, b"a"), None);
    assert_eq!(span_of(&def, b"aa"), Some((0, 2)));
    assert_eq!(span_of(&def, b"aaa"), Some((0, 3)));
    assert_eq!(span_of(&def, b"aaaa"), None);
}

#[test]
fn repeat_rejects_zero_length_inner() {
    let def = def_of(repeat(0, None, pass()));
    assert_eq!(span_of(&def, b""), None);
    let def = def_of(greedy(0, None, pass()));
    assert_eq!(span_of(&def, b""), None);
    // Lazy hits the zero-length check once the successor chain fails.
    let def = def_of(glue(vec![lazy(0, pass()), fail()]));
    assert_eq!(span_of(&def, b""), None);
}

#[test]
fn greedy_backtracks_against_successor() {
    // GreedyRepeat(0,inf,Any) then 'x' over "aaax": repeat consumes [0,3).
    let mut b = GrammarBuilder::new();
    b.rule("c", any());
    b.rule("top", glue(vec![greedy(0, None, rule_ref("c")), chr(b'x')]));
    b.entry("top");
    let def = b.build().unwrap();
    let tok = def.matches(b"aaax").unwrap();
    assert_eq!(tok.span(), (0, 4));
    assert_eq!(tok.children().len(), 3);
    assert_eq!(tok.children()[2].span(), (2, 3));
}

#[test]
fn greedy_takes_the_largest_workable_count() {
    let mut b = GrammarBuilder::new();
    b.rule("c", any());
    b.rule("top", glue(vec![greedy(0, None, rule_ref("c")), chr(b'x')]));
    b.entry("top");
    let def = b.build().unwrap();
    // Two candidate stops; greedy picks the later 'x'.
    let tok = def.matches(b"aaaxbbbx").unwrap();
    assert_eq!(tok.span(), (0, 8));
    assert_eq!(tok.children().len(), 7);
}

#[test]
fn lazy_stops_at_the_smallest_workable_count() {
    let mut b = GrammarBuilder::new();
    b.rule("c", any());
    b.rule("top", glue(vec![lazy(0, rule_ref("c")), chr(b'x')]));
    b.entry("top");
    let def = b.build().unwrap();
    // Same split point as greedy on a single-'x' input.
    let tok = def.matches(b"aaax").unwrap();
    assert_eq!(tok.span(), (0, 4));
    assert_eq!(tok.children().len(), 3);
    // With two 'x's, lazy stops at the first (prefix match).
    let tok = def.match_prefix(b"aaaxbbbx", 0).unwrap();
    assert_eq!(tok.span(), (0, 4));
    assert_eq!(tok.children().len(), 3);
}

#[test]
fn lazy_respects_min() {
    let def = def_of(glue(vec![lazy(2, any()), chr(b'x')]));
    assert_eq!(span_of(&def, b"x"), None);
    assert_eq!(span_of(&def, b"aax"), Some((0, 3)));
}

#[test]
fn greedy_respects_max() {
    let def = def_of(glue(vec![greedy(0, Some(2), chr(b'a')), chr(b'a')]));
    assert_eq!(span_of(&def, b"aaa"), Some((0, 3)));
    assert_eq!(span_of(&def, b"aaaa"), None);
}

// --- Find ---

#[test]
fn find_node_scans_forward() {
    let def = def_of(glue(vec![find(string("ab")), eoi()]));
    assert_eq!(span_of(&def, b"xxab"), Some((0, 4)));
    assert_eq!(span_of(&def, b"xxax"), None);
}

#[test]
fn find_entry_point_returns_first_start() {
    let def = def_of(glue(vec![chr(b'a'), chr(b'b')]));
    let (tok, end) = def.find(b"xxabxab", 0).unwrap();
    assert_eq!(tok.span(), (2, 4));
    assert_eq!(end, 4);
    assert!(def.find(b"xxx", 0).is_none());
}

// --- Lookaround ---

#[test]
fn lookahead_is_zero_width() {
    let def = def_of(glue(vec![ahead(string("ab")), any(), any()]));
    assert_eq!(span_of(&def, b"ab"), Some((0, 2)));
    assert_eq!(span_of(&def, b"ba"), None);
}

#[test]
fn negative_lookahead() {
    let def = def_of(glue(vec![not_ahead(chr(b'0')), any()]));
    assert_eq!(span_of(&def, b"x"), Some((0, 1)));
    assert_eq!(span_of(&def, b"0"), None);
}

#[test]
fn lookahead_discards_tokens() {
    let mut b = GrammarBuilder::new();
    b.rule("a", chr(b'a'));
    b.rule("top", glue(vec![ahead(rule_ref("a")), any()]));
    b.entry("top");
    let def = b.build().unwrap();
    let tok = def.matches(b"a").unwrap();
    assert!(tok.children().is_empty(), "lookahead tokens must not leak");
}

#[test]
fn lookbehind_requires_exact_text() {
    let def = def_of(glue(vec![string("ab"), behind(string("ab")), chr(b'c')]));
    assert_eq!(span_of(&def, b"abc"), Some((0, 3)));
    let def = def_of(glue(vec![string("ab"), behind(string("xb")), chr(b'c')]));
    assert_eq!(span_of(&def, b"abc"), None);
}

#[test]
fn negative_lookbehind() {
    let def = def_of(glue(vec![any(), not_behind(chr(b'0')), chr(b'!')]));
    assert_eq!(span_of(&def, b"a!"), Some((0, 2)));
    assert_eq!(span_of(&def, b"0!"), None);
}

#[test]
fn lookbehind_at_window_start_fails() {
    let def = def_of(glue(vec![behind(any()), string("ab")]));
    assert_eq!(span_of(&def, b"ab"), None);
    let def = def_of(glue(vec![not_behind(any()), string("ab")]));
    assert_eq!(span_of(&def, b"ab"), Some((0, 2)));
}

// --- Length ---

#[test]
fn length_restricts_consumed_span() {
    let word = || repeat(1, None, range(b'a', b'z'));
    let def = def_of(length(2, Some(3), word()));
    assert_eq!(span_of(&def, b"a"), None);
    assert_eq!(span_of(&def, b"ab"), Some((0, 2)));
    assert_eq!(span_of(&def, b"abc"), Some((0, 3)));
    assert_eq!(span_of(&def, b"abcd"), None);
}

// --- Captures and replay ---

#[test]
fn capture_then_replay() {
    let mut b = GrammarBuilder::new();
    let x = b.capture("x");
    b.rule(
        "top",
        glue(vec![
            capture(x, repeat(1, None, range(b'a', b'z'))),
            chr(b' '),
            replay(x),
        ]),
    );
    b.entry("top");
    let def = b.build().unwrap();
    assert!(def.matches(b"abc abc").is_some());
    assert!(def.matches(b"abc abd").is_none());

    let mut state = MatchState::new(&def);
    assert!(def.matches_with(b"abc abc", &mut state).is_some());
    assert_eq!(state.capture(x), Some((0, 3)));
}

#[test]
fn replay_of_unset_capture_matches_empty() {
    let mut b = GrammarBuilder::new();
    let x = b.capture("x");
    b.rule("top", glue(vec![replay(x), string("abc")]));
    b.entry("top");
    let def = b.build().unwrap();
    assert_eq!(def.matches(b"abc").map(|t| t.span()), Some((0, 3)));
}

// --- Hints ---

#[test]
fn hint_records_message_and_offset() {
    let def = def_of(glue(vec![
        string("ab"),
        hint("expected digit"),
        range(b'0', b'9'),
    ]));
    let mut state = MatchState::new(&def);
    assert!(def.matches_with(b"abx", &mut state).is_none());
    assert_eq!(state.hint(), Some(("expected digit", 2)));
}

#[test]
fn first_hint_wins() {
    let def = def_of(glue(vec![
        hint("at start"),
        string("ab"),
        hint("after ab"),
        fail(),
    ]));
    let mut state = MatchState::new(&def);
    assert!(def.matches_with(b"ab", &mut state).is_none());
    assert_eq!(state.hint(), Some(("at start", 0)));
}

#[test]
fn hint_resets_per_match() {
    let def = def_of(glue(vec![hint("expected ab"), string("ab")]));
    let mut state = MatchState::new(&def);
    assert!(def.matches_with(b"xx", &mut state).is_none());
    assert_eq!(state.hint(), Some(("expected ab", 0)));
    assert!(def.matches_with(b"ab", &mut state).is_some());
    // A fresh attempt starts with no hint; the successful one recorded
    // its own visit at offset 0 again.
    assert_eq!(state.hint(), Some(("expected ab", 0)));
}

// --- Flags ---

#[test]
fn flags_gate_alternatives() {
    let mut b = GrammarBuilder::new();
    let seen = b.flag("seen");
    let arm = |f| if_flag(f, chr(b'1'), chr(b'0'));
    b.rule(
        "top",
        glue(vec![arm(seen), set_flag(seen, true), arm(seen)]),
    );
    b.entry("top");
    let def = b.build().unwrap();
    assert!(def.matches(b"01").is_some());
    assert!(def.matches(b"00").is_none());
    assert!(def.matches(b"11").is_none());
}

// --- Host calls ---

#[test]
fn host_call_controls_the_match() {
    fn even_offset(_input: &[u8], pos: usize, state: &mut MatchState) -> Option<usize> {
        if pos % 2 == 0 {
            Some(pos)
        } else {
            state.note_hint("odd offset", pos);
            None
        }
    }
    let def = def_of(glue(vec![any(), any(), call(even_offset)]));
    assert!(def.matches(b"ab").is_some());
    let def = def_of(glue(vec![any(), call(even_offset)]));
    let mut state = MatchState::new(&def);
    assert!(def.matches_with(b"ab", &mut state).is_none());
    assert_eq!(state.hint(), Some(("odd offset", 1)));
}

// --- Void rules ---

#[test]
fn void_wrapper_leaves_descendants_unchanged() {
    let expr = || {
        glue(vec![
            rule_ref("word"),
            chr(b' '),
            rule_ref("word"),
        ])
    };
    let word = || repeat(1, None, range(b'a', b'z'));

    let mut direct = GrammarBuilder::new();
    direct.rule("word", word());
    direct.rule("top", expr());
    direct.entry("top");
    let direct = direct.build().unwrap();

    let mut wrapped = GrammarBuilder::new();
    wrapped.rule("word", word());
    wrapped.void_rule("inner", expr());
    wrapped.rule("top", rule_ref("inner"));
    wrapped.entry("top");
    let wrapped = wrapped.build().unwrap();

    let input = b"ab cd";
    let a = direct.matches(input).unwrap();
    let b = wrapped.matches(input).unwrap();
    assert_eq!(flatten(&direct, &a), flatten(&wrapped, &b));
}

// --- Previous ---

#[test]
fn previous_checks_the_preceding_sibling() {
    // The probe lives in a void rule so it runs against the token being
    // assembled in "top", where the "a" sibling accumulates.
    let mut b = GrammarBuilder::new();
    b.rule("a", chr(b'a'));
    b.void_rule("b", glue(vec![previous("a"), chr(b'b')]));
    b.rule("top", glue(vec![rule_ref("a"), rule_ref("b")]));
    b.entry("top");
    let def = b.build().unwrap();
    assert!(def.matches(b"ab").is_some());

    let mut b = GrammarBuilder::new();
    b.rule("a", chr(b'a'));
    b.void_rule("b", glue(vec![previous("a"), chr(b'b')]));
    b.rule("top", rule_ref("b"));
    b.entry("top");
    let def = b.build().unwrap();
    assert!(def.matches(b"b").is_none(), "no preceding sibling");
}

#[test]
fn previous_with_keyword() {
    let mut b = GrammarBuilder::new();
    let kw = b.keywords(&["let", "var"]);
    b.rule("kw", kw);
    b.void_rule("bang", glue(vec![previous_keyword("kw", "let"), chr(b'!')]));
    b.rule("top", glue(vec![rule_ref("kw"), rule_ref("bang")]));
    b.entry("top");
    let def = b.build().unwrap();
    assert!(def.matches(b"let!").is_some());
    assert!(def.matches(b"var!").is_none());
}

// --- Context ---

#[test]
fn context_requires_the_enclosing_rule() {
    let mut b = GrammarBuilder::new();
    b.void_rule("item", context_with("pair", chr(b'x')));
    b.rule("pair", glue(vec![chr(b'('), rule_ref("item"), chr(b')')]));
    b.rule("brack", glue(vec![chr(b'['), rule_ref("item"), chr(b']')]));
    b.rule("top", choice(vec![rule_ref("pair"), rule_ref("brack")]));
    b.entry("top");
    let def = b.build().unwrap();
    assert!(def.matches(b"(x)").is_some());
    assert!(def.matches(b"[x]").is_none(), "item is only valid in pair");
}

// --- Invoke ---

fn sub_with_memory() -> Arc<Definition> {
    let mut b = GrammarBuilder::new();
    let seen = b.flag("seen");
    b.rule(
        "s",
        glue(vec![
            if_flag(seen, chr(b'b'), chr(b'a')),
            set_flag(seen, true),
        ]),
    );
    b.entry("s");
    Arc::new(b.build().unwrap())
}

#[test]
fn invoke_keeps_a_persistent_child_state() {
    let sub = sub_with_memory();
    let mut b = GrammarBuilder::new();
    b.import("sub", &sub);
    b.rule("top", glue(vec![invoke("sub"), invoke("sub")]));
    b.entry("top");
    let def = b.build().unwrap();
    // The second invocation sees the flag the first one set.
    assert!(def.matches(b"ab").is_some());
    assert!(def.matches(b"aa").is_none());
    assert!(def.matches(b"bb").is_none());
}

#[test]
fn invoke_with_coverage_bounds_the_sub_range() {
    let mut sub = GrammarBuilder::new();
    sub.rule("word", repeat(1, None, range(b'a', b'z')));
    sub.entry("word");
    let sub = Arc::new(sub.build().unwrap());

    let mut b = GrammarBuilder::new();
    b.import("sub", &sub);
    b.rule(
        "top",
        glue(vec![
            invoke_over("sub", repeat(1, None, none_of("!"))),
            chr(b'!'),
        ]),
    );
    b.entry("top");
    let def = b.build().unwrap();

    let tok = def.matches(b"abc!").unwrap();
    assert_eq!(tok.children().len(), 1);
    assert_eq!(tok.children()[0].span(), (0, 3));
    // The sub-grammar must cover the coverage range exactly.
    assert!(def.matches(b"ab3!").is_none());
}

#[test]
fn invoke_without_coverage_consumes_the_sub_match() {
    let mut sub = GrammarBuilder::new();
    sub.rule("word", repeat(1, None, range(b'a', b'z')));
    sub.entry("word");
    let sub = Arc::new(sub.build().unwrap());

    let mut b = GrammarBuilder::new();
    b.import("sub", &sub);
    b.rule("top", glue(vec![invoke("sub"), string("123")]));
    b.entry("top");
    let def = b.build().unwrap();
    assert!(def.matches(b"abc123").is_some());
    assert!(def.matches(b"123").is_none());
}

#[test]
fn invoked_tokens_resolve_rule_names() {
    let mut sub = GrammarBuilder::new();
    sub.rule("word", repeat(1, None, range(b'a', b'z')));
    sub.entry("word");
    let sub = Arc::new(sub.build().unwrap());

    let mut b = GrammarBuilder::new();
    b.import("sub", &sub);
    b.rule("top", invoke("sub"));
    b.entry("top");
    let def = b.build().unwrap();
    let tok = def.matches(b"abc").unwrap();
    assert_eq!(def.rule_name(tok.children()[0].rule()), Some("word"));
}

// --- Windows ---

#[test]
fn match_from_requires_the_window_end() {
    let def = def_of(repeat(1, None, range(b'a', b'z')));
    assert!(def.match_from(b"12ab", 2).is_some());
    assert!(def.match_from(b"12ab3", 2).is_none());
}

#[test]
fn match_prefix_stops_early() {
    let def = def_of(repeat(1, None, range(b'a', b'z')));
    let tok = def.match_prefix(b"ab34", 0).unwrap();
    assert_eq!(tok.span(), (0, 2));
}

// --- Token reading ---

#[test]
fn token_read_interface() {
    let mut b = GrammarBuilder::new();
    b.rule("word", repeat(1, None, range(b'a', b'z')));
    b.rule("num", repeat(1, None, range(b'0', b'9')));
    b.rule(
        "top",
        glue(vec![rule_ref("word"), chr(b'='), rule_ref("num")]),
    );
    b.entry("top");
    let def = b.build().unwrap();
    let input = b"abc=42";
    let tok = def.matches(input).unwrap();

    assert_eq!(tok.span(), (0, 6));
    assert_eq!(tok.len(), 6);
    assert_eq!(tok.children().len(), 2);
    let word = tok.child_named(&def, "word").unwrap();
    assert_eq!(word.text(input), b"abc");
    let num = tok.child_named(&def, "num").unwrap();
    assert_eq!(num.text_str(input), "42");

    let dump = tok.dump(&def, input);
    assert!(dump.contains("top [0..6)"));
    assert!(dump.contains("word [0..3)"));
    assert!(dump.contains("num [4..6)"));
}

// --- Properties ---

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn list_grammar() -> Definition {
        let mut b = GrammarBuilder::new();
        b.rule("word", repeat(1, None, range(b'a', b'z')));
        b.rule("num", repeat(1, None, range(b'0', b'9')));
        b.rule(
            "list",
            glue(vec![chr(b'('), repeat(0, None, rule_ref("item")), chr(b')')]),
        );
        b.void_rule(
            "item",
            choice(vec![
                rule_ref("word"),
                rule_ref("num"),
                rule_ref("list"),
                chr(b' '),
                chr(b','),
            ]),
        );
        b.rule("top", repeat(0, None, rule_ref("item")));
        b.entry("top");
        b.build().unwrap()
    }

    fn check_tree(tok: &Token, lo: usize, hi: usize) {
        assert!(lo <= tok.start() && tok.end() <= hi, "child span escapes parent");
        assert!(tok.start() <= tok.end());
        let mut at = tok.start();
        for child in tok.children() {
            assert!(child.start() >= at, "siblings must be ordered and disjoint");
            at = child.end();
            check_tree(child, tok.start(), tok.end());
        }
    }

    proptest! {
        #[test]
        fn spans_nest_and_siblings_stay_ordered(input in "[a-z0-9(), ]{0,48}") {
            let def = list_grammar();
            if let Some(tok) = def.match_prefix(input.as_bytes(), 0) {
                check_tree(&tok, 0, input.len());
            }
        }

        #[test]
        fn full_matches_consume_everything(input in "\\(?[a-z0-9(), ]{0,32}\\)?") {
            let def = list_grammar();
            if let Some(tok) = def.matches(input.as_bytes()) {
                prop_assert_eq!(tok.span(), (0, input.len()));
                check_tree(&tok, 0, input.len());
            }
        }
    }
}
