//! The matcher: recursive descent with backtracking over a linked
//! [`Definition`].
//!
//! Matching walks the node graph against a byte window `[start, end)`.
//! Failure is an ordinary `None`, never an error. Tokens are built
//! incrementally into per-rule frames; every composite that tentatively
//! appended children rolls them back to its checkpoint on failure, which is
//! the sole mechanism keeping the token tree well-formed under backtracking.
//!
//! Repeat nodes need to know what follows them in the enclosing
//! sequence/choice chain. Definitions are shared immutably and carry no
//! parent pointers, so the matcher threads an explicit continuation ([`Cont`])
//! instead: sequence remainders, reset at rule boundaries and inside
//! lookaround. Greedy and lazy repeats trial-match that chain to pick their
//! count, then the enclosing sequence matches it again for real. The repeated
//! work is unbounded in pathological grammars; no memoization is attempted.

use crate::grammar::{Definition, KeywordId, RuleId, RuleKey};
use crate::node::{ByteSet, Node};
use crate::state::MatchState;
use crate::token::Token;

/// What follows the current node, up to the enclosing rule boundary.
#[derive(Clone, Copy)]
enum Cont<'d, 'c> {
    Done,
    Seq {
        rest: &'d [Node],
        next: &'c Cont<'d, 'c>,
    },
}

/// One open token under construction.
struct Frame {
    rule: RuleKey,
    keyword: Option<KeywordId>,
    start: usize,
    children: Vec<Token>,
}

impl Frame {
    fn new(rule: RuleKey, start: usize) -> Self {
        Self {
            rule,
            keyword: None,
            start,
            children: Vec::new(),
        }
    }
}

/// Checkpoint of the innermost frame, for rollback.
struct Mark {
    children: usize,
    keyword: Option<KeywordId>,
}

/// Successor chain seed for matches that must reach the window end.
static EOI_SEED: [Node; 1] = [Node::Eoi];

struct Run<'d, 's, 'i> {
    def: &'d Definition,
    input: &'i [u8],
    start: usize,
    end: usize,
    fold: bool,
    frames: Vec<Frame>,
    state: Option<&'s mut MatchState>,
}

/// Match `def` against `input[start..end]`.
///
/// With `require_end`, the entry rule must consume the window exactly.
/// Allocates a state on the fly when the definition needs one and the caller
/// did not supply it.
pub(crate) fn run_match(
    def: &Definition,
    input: &[u8],
    start: usize,
    end: usize,
    require_end: bool,
    state: Option<&mut MatchState>,
) -> Option<Token> {
    if def.needs_state() && state.is_none() {
        let mut owned = MatchState::new(def);
        return run_match_inner(def, input, start, end, require_end, Some(&mut owned));
    }
    run_match_inner(def, input, start, end, require_end, state)
}

fn run_match_inner(
    def: &Definition,
    input: &[u8],
    start: usize,
    end: usize,
    require_end: bool,
    mut state: Option<&mut MatchState>,
) -> Option<Token> {
    if let Some(state) = state.as_deref_mut() {
        state.clear_hint();
    }
    let entry = def.entry();
    let key = RuleKey {
        def: def.id(),
        rule: entry,
    };
    let mut run = Run {
        def,
        input,
        start,
        end,
        fold: def.case_insensitive(),
        frames: vec![Frame::new(key, start)],
        state,
    };
    // When the whole window must be consumed, seed the outermost successor
    // chain with Eoi so trailing greedy/lazy repeats pick a count that
    // actually reaches the end. The final check still guards non-repeat
    // tails.
    let cont = if require_end {
        Cont::Seq {
            rest: &EOI_SEED,
            next: &Cont::Done,
        }
    } else {
        Cont::Done
    };
    let p = run.call_rule(entry, start, &cont)?;
    if require_end && p != end {
        return None;
    }
    let mut root = run.frames.pop()?;
    if !def.rule(entry).is_void() && root.children.len() == 1 {
        return root.children.pop();
    }
    // Void entry rules still yield one tree: a synthetic wrapper carrying the
    // spliced children.
    Some(Token {
        rule: key,
        keyword: root.keyword,
        start,
        end: p,
        children: root.children,
    })
}

/// Probe successive start offsets until the entry rule matches (prefix
/// semantics). The hint resets on every probe.
pub(crate) fn run_find(
    def: &Definition,
    input: &[u8],
    from: usize,
    mut state: Option<&mut MatchState>,
) -> Option<(Token, usize)> {
    let len = input.len();
    let mut at = from.min(len);
    loop {
        if let Some(token) = run_match(def, input, at, len, false, state.as_deref_mut()) {
            let end = token.end();
            return Some((token, end));
        }
        if at >= len {
            return None;
        }
        at += 1;
    }
}

impl<'d> Run<'d, '_, '_> {
    // ─── Frames and rollback ────────────────────────────────────────────

    fn mark(&self) -> Mark {
        match self.frames.last() {
            Some(top) => Mark {
                children: top.children.len(),
                keyword: top.keyword,
            },
            None => Mark {
                children: 0,
                keyword: None,
            },
        }
    }

    fn rollback(&mut self, mark: &Mark) {
        if let Some(top) = self.frames.last_mut() {
            top.children.truncate(mark.children);
            top.keyword = mark.keyword;
        }
    }

    fn push_token(&mut self, token: Token) {
        if let Some(top) = self.frames.last_mut() {
            top.children.push(token);
        }
    }

    /// Invoke a rule. Non-void rules open a frame and wrap their children in
    /// a token; void rules splice children straight into the parent frame.
    /// `cont` is `Done` at every rule boundary except the seeded outermost
    /// call.
    fn call_rule(&mut self, id: RuleId, pos: usize, cont: &Cont<'d, '_>) -> Option<usize> {
        let def = self.def;
        let rule = def.rule(id);
        if rule.is_void() {
            return self.match_node(&rule.entry, pos, cont);
        }
        let key = RuleKey { def: def.id(), rule: id };
        self.frames.push(Frame::new(key, pos));
        match self.match_node(&rule.entry, pos, cont) {
            Some(p) => {
                let frame = self.frames.pop()?;
                self.push_token(Token {
                    rule: frame.rule,
                    keyword: frame.keyword,
                    start: frame.start,
                    end: p,
                    children: frame.children,
                });
                Some(p)
            }
            None => {
                self.frames.pop();
                None
            }
        }
    }

    // ─── Byte tests ─────────────────────────────────────────────────────

    fn byte_eq(&self, a: u8, b: u8) -> bool {
        if self.fold {
            a.eq_ignore_ascii_case(&b)
        } else {
            a == b
        }
    }

    fn in_set(&self, set: &ByteSet, b: u8) -> bool {
        if set.contains(b) {
            return true;
        }
        self.fold && (set.contains(b.to_ascii_lowercase()) || set.contains(b.to_ascii_uppercase()))
    }

    // ─── Successor chain ────────────────────────────────────────────────

    fn try_cont(&mut self, cont: &Cont<'d, '_>, pos: usize) -> Option<usize> {
        match *cont {
            Cont::Done => Some(pos),
            Cont::Seq { rest, next } => {
                let mut p = pos;
                for (i, node) in rest.iter().enumerate() {
                    let chain = Cont::Seq {
                        rest: &rest[i + 1..],
                        next,
                    };
                    p = self.match_node(node, p, &chain)?;
                }
                self.try_cont(next, p)
            }
        }
    }

    // ─── Node dispatch ──────────────────────────────────────────────────

    fn match_node(&mut self, node: &'d Node, pos: usize, cont: &Cont<'d, '_>) -> Option<usize> {
        match node {
            Node::Char(b) => {
                (pos < self.end && self.byte_eq(self.input[pos], *b)).then(|| pos + 1)
            }
            Node::Range(set) => {
                (pos < self.end && self.in_set(set, self.input[pos])).then(|| pos + 1)
            }
            Node::Except(set) => {
                (pos < self.end && !self.in_set(set, self.input[pos])).then(|| pos + 1)
            }
            Node::Str(bytes) => {
                if pos + bytes.len() > self.end {
                    return None;
                }
                bytes
                    .iter()
                    .enumerate()
                    .all(|(i, &b)| self.byte_eq(self.input[pos + i], b))
                    .then(|| pos + bytes.len())
            }
            Node::Keyword(members) => {
                let (id, len) =
                    self.def
                        .trie()
                        .longest_in(self.input, pos, self.end, members, self.fold)?;
                if let Some(top) = self.frames.last_mut() {
                    top.keyword = Some(id);
                }
                Some(pos + len)
            }
            Node::Any => (pos < self.end).then(|| pos + 1),
            Node::Boi => (pos == self.start).then_some(pos),
            Node::Eoi => (pos == self.end).then_some(pos),
            Node::Pass => Some(pos),
            Node::Fail => None,
            Node::Find(inner) => {
                let mut at = pos;
                loop {
                    if let Some(end) = self.match_node(inner, at, &Cont::Done) {
                        return Some(end);
                    }
                    if at >= self.end {
                        return None;
                    }
                    at += 1;
                }
            }
            Node::Ahead(inner) => {
                let mark = self.mark();
                let result = self.match_node(inner, pos, &Cont::Done);
                self.rollback(&mark);
                result.map(|_| pos)
            }
            Node::Not(inner) => {
                let mark = self.mark();
                let result = self.match_node(inner, pos, &Cont::Done);
                self.rollback(&mark);
                match result {
                    Some(_) => None,
                    None => Some(pos),
                }
            }
            Node::Behind { node: inner, len } => {
                if pos < self.start + len {
                    return None;
                }
                let mark = self.mark();
                let result = self.match_node(inner, pos - len, &Cont::Done);
                self.rollback(&mark);
                (result == Some(pos)).then_some(pos)
            }
            Node::NotBehind { node: inner, len } => {
                if pos < self.start + len {
                    return Some(pos);
                }
                let mark = self.mark();
                let result = self.match_node(inner, pos - len, &Cont::Done);
                self.rollback(&mark);
                (result != Some(pos)).then_some(pos)
            }
            Node::Choice(alts) => {
                for alt in alts {
                    let mark = self.mark();
                    if let Some(p) = self.match_node(alt, pos, cont) {
                        return Some(p);
                    }
                    self.rollback(&mark);
                }
                None
            }
            Node::Glue(parts) => {
                let mark = self.mark();
                let mut p = pos;
                for (i, part) in parts.iter().enumerate() {
                    let chain = Cont::Seq {
                        rest: &parts[i + 1..],
                        next: cont,
                    };
                    match self.match_node(part, p, &chain) {
                        Some(q) => p = q,
                        None => {
                            self.rollback(&mark);
                            return None;
                        }
                    }
                }
                Some(p)
            }
            Node::Repeat {
                min,
                max,
                node: inner,
            } => {
                let entry = self.mark();
                let mut p = pos;
                let mut count = 0usize;
                while max.is_none_or(|m| count < m) {
                    match self.match_node(inner, p, cont) {
                        // Zero-length inner match: reject rather than loop.
                        Some(q) if q == p => {
                            self.rollback(&entry);
                            return None;
                        }
                        Some(q) => {
                            p = q;
                            count += 1;
                        }
                        None => break,
                    }
                }
                if count >= *min {
                    Some(p)
                } else {
                    self.rollback(&entry);
                    None
                }
            }
            Node::Greedy {
                min,
                max,
                node: inner,
            } => {
                // Take every repetition available, remembering the end and
                // token checkpoint after each count.
                let mut ends = vec![pos];
                let mut marks = vec![self.mark()];
                while max.is_none_or(|m| ends.len() - 1 < m) {
                    let p = ends[ends.len() - 1];
                    match self.match_node(inner, p, cont) {
                        Some(q) if q == p => {
                            self.rollback(&marks[0]);
                            return None;
                        }
                        Some(q) => {
                            ends.push(q);
                            marks.push(self.mark());
                        }
                        None => break,
                    }
                }
                // Largest count whose successor chain also matches wins;
                // only that count's tokens are committed.
                let mut count = ends.len() - 1;
                loop {
                    if count < *min {
                        self.rollback(&marks[0]);
                        return None;
                    }
                    self.rollback(&marks[count]);
                    let trial = self.mark();
                    let ok = self.try_cont(cont, ends[count]).is_some();
                    self.rollback(&trial);
                    if ok {
                        return Some(ends[count]);
                    }
                    if count == 0 {
                        self.rollback(&marks[0]);
                        return None;
                    }
                    count -= 1;
                }
            }
            Node::Lazy { min, node: inner } => {
                let entry = self.mark();
                let mut p = pos;
                let mut count = 0usize;
                while count < *min {
                    match self.match_node(inner, p, cont) {
                        Some(q) if q == p => {
                            self.rollback(&entry);
                            return None;
                        }
                        Some(q) => {
                            p = q;
                            count += 1;
                        }
                        None => {
                            self.rollback(&entry);
                            return None;
                        }
                    }
                }
                // Smallest count whose successor chain matches wins.
                loop {
                    let trial = self.mark();
                    let ok = self.try_cont(cont, p).is_some();
                    self.rollback(&trial);
                    if ok {
                        return Some(p);
                    }
                    match self.match_node(inner, p, cont) {
                        Some(q) if q == p => {
                            self.rollback(&entry);
                            return None;
                        }
                        Some(q) => p = q,
                        None => {
                            self.rollback(&entry);
                            return None;
                        }
                    }
                }
            }
            Node::Length {
                min,
                max,
                node: inner,
            } => {
                let mark = self.mark();
                let p = self.match_node(inner, pos, cont)?;
                let taken = p - pos;
                if taken >= *min && max.is_none_or(|m| taken <= m) {
                    Some(p)
                } else {
                    self.rollback(&mark);
                    None
                }
            }
            Node::Hint(message) => {
                if let Some(state) = self.state.as_deref_mut() {
                    state.note_hint(message, pos);
                }
                Some(pos)
            }
            Node::Call(f) => {
                let state = self.state.as_deref_mut()?;
                f(self.input, pos, state)
            }
            Node::Set { flag, value } => {
                if let Some(state) = self.state.as_deref_mut() {
                    state.set_flag(*flag, *value);
                }
                Some(pos)
            }
            Node::If {
                flag,
                then,
                otherwise,
            } => {
                let on = self
                    .state
                    .as_deref()
                    .map(|state| state.flag(*flag))
                    .unwrap_or(false);
                self.match_node(if on { then } else { otherwise }, pos, cont)
            }
            Node::Capture { slot, node: inner } => {
                let p = self.match_node(inner, pos, cont)?;
                if let Some(state) = self.state.as_deref_mut() {
                    state.set_capture(*slot, pos, p);
                }
                Some(p)
            }
            Node::Replay(slot) => {
                // An unset capture replays as empty text.
                let Some((s, e)) = self.state.as_deref().and_then(|state| state.capture(*slot))
                else {
                    return Some(pos);
                };
                let len = e - s;
                if pos + len > self.end {
                    return None;
                }
                (0..len)
                    .all(|i| self.byte_eq(self.input[pos + i], self.input[s + i]))
                    .then(|| pos + len)
            }
            Node::Ref { target, .. } => self.call_rule(*target, pos, &Cont::Done),
            Node::Inline { target, .. } => {
                let def = self.def;
                self.match_node(&def.rule(*target).entry, pos, &Cont::Done)
            }
            Node::Previous {
                target, keyword_id, ..
            } => {
                let key = RuleKey {
                    def: self.def.id(),
                    rule: *target,
                };
                let prev = self.frames.last()?.children.last()?;
                let same_rule = prev.rule == key;
                let kw_ok = match keyword_id {
                    Some(kw) => prev.keyword == Some(*kw),
                    None => true,
                };
                (same_rule && kw_ok).then_some(pos)
            }
            Node::Context {
                target,
                node: inner,
                ..
            } => {
                let key = RuleKey {
                    def: self.def.id(),
                    rule: *target,
                };
                if self.frames.last()?.rule != key {
                    return None;
                }
                match inner {
                    Some(inner) => self.match_node(inner, pos, cont),
                    None => Some(pos),
                }
            }
            Node::Invoke {
                import, coverage, ..
            } => {
                let def = self.def;
                let sub = &def.import(*import).def;
                let sub_end = match coverage {
                    Some(cover) => {
                        let mark = self.mark();
                        let end = self.match_node(cover, pos, &Cont::Done);
                        self.rollback(&mark);
                        Some(end?)
                    }
                    None => None,
                };
                let state = match self.state.as_deref_mut() {
                    Some(state) => Some(state.sub_state(*import, sub)),
                    None => None,
                };
                let token = match sub_end {
                    Some(end) => sub.match_exact(self.input, pos, end, state)?,
                    None => sub.match_within(self.input, pos, self.end, state)?,
                };
                let p = token.end();
                self.push_token(token);
                Some(p)
            }
        }
    }
}

#[cfg(test)]
mod tests;
