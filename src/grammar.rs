//! Grammar definitions: named rules, keyword tables, flags, captures and
//! imports, plus the optimize and link passes that turn builder output into
//! an immutable, shareable [`Definition`].
//!
//! Linking resolves every deferred name to a direct id. An unresolved name is
//! a configuration error ([`LinkError`]), never a match failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::matcher;
use crate::node::Node;
use crate::state::MatchState;
use crate::token::Token;

/// Process-unique identity of a [`Definition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefId(pub(crate) u32);

/// Index of a rule within its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(pub(crate) u32);

/// Index of a keyword within its definition's keyword table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeywordId(pub(crate) u32);

/// Index of a boolean flag slot in the match state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagId(pub(crate) u32);

/// Index of a capture slot in the match state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureId(pub(crate) u32);

/// Fully qualified rule identity: definition plus local rule id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub def: DefId,
    pub rule: RuleId,
}

static NEXT_DEF_ID: AtomicU32 = AtomicU32::new(0);

/// Errors raised while building and linking a definition.
///
/// These are fatal configuration errors, meant to surface during grammar
/// development; they are distinct from ordinary match failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    DuplicateRule(String),
    UndefinedRule(String),
    UndefinedKeyword(String),
    UndefinedGrammar(String),
    MissingEntry,
    /// A lookbehind whose inner expression has no statically fixed length;
    /// the offending rule is named.
    VariableLookbehind(String),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateRule(name) => write!(f, "duplicate rule name {name:?}"),
            Self::UndefinedRule(name) => write!(f, "undefined rule {name:?}"),
            Self::UndefinedKeyword(name) => write!(f, "undefined keyword {name:?}"),
            Self::UndefinedGrammar(name) => write!(f, "undefined grammar alias {name:?}"),
            Self::MissingEntry => write!(f, "no entry rule declared"),
            Self::VariableLookbehind(rule) => {
                write!(f, "lookbehind in rule {rule:?} has no fixed length")
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// A named, linkable grammar production.
#[derive(Debug)]
pub struct Rule {
    pub(crate) id: RuleId,
    pub(crate) name: String,
    pub(crate) entry: Node,
    pub(crate) is_void: bool,
    pub(crate) used: bool,
}

impl Rule {
    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Void rules splice their children into the parent token instead of
    /// producing a wrapper token.
    pub fn is_void(&self) -> bool {
        self.is_void
    }

    /// Whether any `Ref` still targets this rule after optimization (the
    /// entry rule always counts as used).
    pub fn is_used(&self) -> bool {
        self.used
    }
}

#[derive(Debug)]
pub(crate) struct Import {
    pub(crate) alias: String,
    pub(crate) def: Arc<Definition>,
}

// ─── Keyword trie ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TrieNode {
    next: Vec<(u8, u32)>,
    word: Option<KeywordId>,
}

/// Byte trie over all keywords of one definition.
#[derive(Debug)]
pub(crate) struct KeywordTrie {
    nodes: Vec<TrieNode>,
}

impl KeywordTrie {
    fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }

    fn insert(&mut self, word: &[u8], id: KeywordId) {
        let mut at = 0usize;
        for &b in word {
            at = match self.nodes[at].next.iter().find(|(byte, _)| *byte == b) {
                Some(&(_, next)) => next as usize,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[at].next.push((b, next as u32));
                    next
                }
            };
        }
        self.nodes[at].word = Some(id);
    }

    /// Longest keyword at `input[pos..end]` whose id is in `members`
    /// (sorted). Returns `(keyword id, length)`.
    pub(crate) fn longest_in(
        &self,
        input: &[u8],
        pos: usize,
        end: usize,
        members: &[KeywordId],
        fold: bool,
    ) -> Option<(KeywordId, usize)> {
        let mut best = None;
        let mut at = 0usize;
        let mut len = 0usize;
        loop {
            if let Some(id) = self.nodes[at].word
                && members.binary_search_by_key(&id.0, |m| m.0).is_ok()
            {
                best = Some((id, len));
            }
            if pos + len >= end {
                return best;
            }
            let mut b = input[pos + len];
            if fold {
                b = b.to_ascii_lowercase();
            }
            match self.nodes[at].next.iter().find(|(byte, _)| *byte == b) {
                Some(&(_, next)) => {
                    at = next as usize;
                    len += 1;
                }
                None => return best,
            }
        }
    }
}

// ─── Definition ─────────────────────────────────────────────────────────────

/// A linked, immutable grammar: safe to share across threads and match
/// against concurrently.
#[derive(Debug)]
pub struct Definition {
    id: DefId,
    rules: Vec<Rule>,
    rule_ids: HashMap<String, RuleId>,
    entry: RuleId,
    keywords: Vec<String>,
    keyword_ids: HashMap<String, KeywordId>,
    trie: KeywordTrie,
    flags: Vec<String>,
    flag_ids: HashMap<String, FlagId>,
    captures: Vec<String>,
    capture_ids: HashMap<String, CaptureId>,
    imports: Vec<Import>,
    case_insensitive: bool,
    needs_state: bool,
}

impl Definition {
    pub fn id(&self) -> DefId {
        self.id
    }

    pub fn entry(&self) -> RuleId {
        self.entry
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0 as usize]
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn rule_id(&self, name: &str) -> Option<RuleId> {
        self.rule_ids.get(name).copied()
    }

    /// Resolve a rule key to its name, searching imported definitions when
    /// the key belongs to one of them (tokens produced by `Invoke`).
    pub fn rule_name(&self, key: RuleKey) -> Option<&str> {
        self.find_def(key.def)
            .and_then(|def| def.rules.get(key.rule.0 as usize))
            .map(|rule| rule.name.as_str())
    }

    pub fn keyword_id(&self, word: &str) -> Option<KeywordId> {
        self.keyword_ids.get(word).copied()
    }

    pub fn keyword_name(&self, id: KeywordId) -> Option<&str> {
        self.keywords.get(id.0 as usize).map(String::as_str)
    }

    pub fn flag_id(&self, name: &str) -> Option<FlagId> {
        self.flag_ids.get(name).copied()
    }

    pub fn capture_id(&self, name: &str) -> Option<CaptureId> {
        self.capture_ids.get(name).copied()
    }

    pub fn capture_name(&self, slot: CaptureId) -> Option<&str> {
        self.captures.get(slot.0 as usize).map(String::as_str)
    }

    /// Named capture slots, in declaration order.
    pub fn captures(&self) -> impl Iterator<Item = (CaptureId, &str)> {
        self.captures
            .iter()
            .enumerate()
            .map(|(i, name)| (CaptureId(i as u32), name.as_str()))
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// False for grammars with no flags, captures, imports, hints or host
    /// calls; such grammars match without allocating a [`MatchState`].
    pub fn needs_state(&self) -> bool {
        self.needs_state
    }

    pub(crate) fn flag_count(&self) -> usize {
        self.flags.len()
    }

    pub(crate) fn capture_count(&self) -> usize {
        self.captures.len()
    }

    pub(crate) fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub(crate) fn import(&self, index: usize) -> &Import {
        &self.imports[index]
    }

    pub(crate) fn trie(&self) -> &KeywordTrie {
        &self.trie
    }

    pub(crate) fn find_def(&self, id: DefId) -> Option<&Definition> {
        if id == self.id {
            return Some(self);
        }
        self.imports
            .iter()
            .find_map(|import| import.def.find_def(id))
    }

    // ─── Match entry points ─────────────────────────────────────────────

    /// Match the whole buffer against the entry rule.
    pub fn matches(&self, input: &[u8]) -> Option<Token> {
        matcher::run_match(self, input, 0, input.len(), true, None)
    }

    /// Like [`Definition::matches`], recording flags/captures/hints into the
    /// caller's state.
    pub fn matches_with(&self, input: &[u8], state: &mut MatchState) -> Option<Token> {
        matcher::run_match(self, input, 0, input.len(), true, Some(state))
    }

    /// Match the suffix window `[start, len)`, requiring it to be consumed
    /// entirely.
    pub fn match_from(&self, input: &[u8], start: usize) -> Option<Token> {
        matcher::run_match(self, input, start.min(input.len()), input.len(), true, None)
    }

    pub fn match_from_with(
        &self,
        input: &[u8],
        start: usize,
        state: &mut MatchState,
    ) -> Option<Token> {
        matcher::run_match(
            self,
            input,
            start.min(input.len()),
            input.len(),
            true,
            Some(state),
        )
    }

    /// Match at `start` without requiring the buffer end to be reached.
    pub fn match_prefix(&self, input: &[u8], start: usize) -> Option<Token> {
        matcher::run_match(self, input, start.min(input.len()), input.len(), false, None)
    }

    pub fn match_prefix_with(
        &self,
        input: &[u8],
        start: usize,
        state: &mut MatchState,
    ) -> Option<Token> {
        matcher::run_match(
            self,
            input,
            start.min(input.len()),
            input.len(),
            false,
            Some(state),
        )
    }

    /// Probe successive start offsets from `from`; the first offset where the
    /// entry rule matches wins. Returns the token and its end offset.
    pub fn find(&self, input: &[u8], from: usize) -> Option<(Token, usize)> {
        matcher::run_find(self, input, from, None)
    }

    pub fn find_with(
        &self,
        input: &[u8],
        from: usize,
        state: &mut MatchState,
    ) -> Option<(Token, usize)> {
        matcher::run_find(self, input, from, Some(state))
    }

    /// Match a definition against exactly `[start, end)`; used by `Invoke`
    /// with a coverage bound.
    pub(crate) fn match_exact(
        &self,
        input: &[u8],
        start: usize,
        end: usize,
        state: Option<&mut MatchState>,
    ) -> Option<Token> {
        matcher::run_match(self, input, start, end, true, state)
    }

    /// Prefix-match a definition inside the window `[start, end)`.
    pub(crate) fn match_within(
        &self,
        input: &[u8],
        start: usize,
        end: usize,
        state: Option<&mut MatchState>,
    ) -> Option<Token> {
        matcher::run_match(self, input, start, end, false, state)
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Accumulates rules, keywords, flags, captures and imports, then produces a
/// linked [`Definition`] via [`GrammarBuilder::build`].
#[derive(Debug, Default)]
pub struct GrammarBuilder {
    case_insensitive: bool,
    rules: Vec<(String, Node, bool)>,
    entry: Option<String>,
    keywords: Vec<String>,
    keyword_ids: HashMap<String, KeywordId>,
    flags: Vec<String>,
    flag_ids: HashMap<String, FlagId>,
    captures: Vec<String>,
    capture_ids: HashMap<String, CaptureId>,
    imports: Vec<Import>,
    import_ids: HashMap<String, usize>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold ASCII case in all literal, range, keyword and replay comparisons.
    pub fn case_insensitive(&mut self, yes: bool) -> &mut Self {
        self.case_insensitive = yes;
        self
    }

    /// Register a token-producing rule.
    pub fn rule(&mut self, name: &str, entry: Node) -> &mut Self {
        self.rules.push((name.to_string(), entry, false));
        self
    }

    /// Register a void rule: it produces no wrapper token, its children
    /// splice into the parent.
    pub fn void_rule(&mut self, name: &str, entry: Node) -> &mut Self {
        self.rules.push((name.to_string(), entry, true));
        self
    }

    /// Declare the entry rule by name.
    pub fn entry(&mut self, name: &str) -> &mut Self {
        self.entry = Some(name.to_string());
        self
    }

    /// Id for a named flag, assigned on first reference.
    pub fn flag(&mut self, name: &str) -> FlagId {
        if let Some(&id) = self.flag_ids.get(name) {
            return id;
        }
        let id = FlagId(self.flags.len() as u32);
        self.flags.push(name.to_string());
        self.flag_ids.insert(name.to_string(), id);
        id
    }

    /// Id for a named capture slot, assigned on first reference.
    pub fn capture(&mut self, name: &str) -> CaptureId {
        if let Some(&id) = self.capture_ids.get(name) {
            return id;
        }
        let id = CaptureId(self.captures.len() as u32);
        self.captures.push(name.to_string());
        self.capture_ids.insert(name.to_string(), id);
        id
    }

    /// Register a keyword set and return the node matching its members.
    /// Keyword names are shared across sets within one definition.
    pub fn keywords(&mut self, words: &[&str]) -> Node {
        let mut members = Vec::with_capacity(words.len());
        for word in words {
            let id = match self.keyword_ids.get(*word) {
                Some(&id) => id,
                None => {
                    let id = KeywordId(self.keywords.len() as u32);
                    self.keywords.push((*word).to_string());
                    self.keyword_ids.insert((*word).to_string(), id);
                    id
                }
            };
            members.push(id);
        }
        members.sort_by_key(|id| id.0);
        members.dedup();
        Node::Keyword(members)
    }

    /// Import another definition under a local alias for `Invoke`.
    pub fn import(&mut self, alias: &str, def: &Arc<Definition>) -> &mut Self {
        self.import_ids.insert(alias.to_string(), self.imports.len());
        self.imports.push(Import {
            alias: alias.to_string(),
            def: Arc::clone(def),
        });
        self
    }

    /// Optimize and link, producing an immutable definition.
    pub fn build(self) -> Result<Definition, LinkError> {
        let GrammarBuilder {
            case_insensitive,
            rules: protos,
            entry,
            keywords,
            keyword_ids,
            flags,
            flag_ids,
            captures,
            capture_ids,
            imports,
            import_ids,
        } = self;

        let mut rule_ids = HashMap::new();
        for (i, (name, _, _)) in protos.iter().enumerate() {
            if rule_ids.insert(name.clone(), RuleId(i as u32)).is_some() {
                return Err(LinkError::DuplicateRule(name.clone()));
            }
        }
        let entry_name = entry.ok_or(LinkError::MissingEntry)?;
        let entry = *rule_ids
            .get(&entry_name)
            .ok_or(LinkError::UndefinedRule(entry_name))?;

        let voidness: Vec<bool> = protos.iter().map(|(_, _, is_void)| *is_void).collect();
        let mut rules: Vec<Rule> = protos
            .into_iter()
            .enumerate()
            .map(|(i, (name, entry, is_void))| Rule {
                id: RuleId(i as u32),
                name,
                entry,
                is_void,
                used: false,
            })
            .collect();

        // Optimize: a Ref to a void rule behaves like Inline (no wrapper
        // token either way), so rewrite it and let the wrapper machinery go
        // dead.
        for rule in &mut rules {
            rewrite_void_refs(&mut rule.entry, &rule_ids, &voidness);
        }

        // Recompute which rules still have Ref uses.
        let mut referenced = vec![false; rules.len()];
        for rule in &rules {
            collect_refs(&rule.entry, &rule_ids, &mut referenced);
        }
        referenced[entry.0 as usize] = true;
        for (rule, used) in rules.iter_mut().zip(referenced) {
            rule.used = used;
        }

        // Link: resolve every deferred name.
        let ctx = LinkCtx {
            rules: &rule_ids,
            keywords: &keyword_ids,
            imports: &import_ids,
        };
        for rule in &mut rules {
            link_node(&mut rule.entry, &ctx)?;
        }

        // Fixed lookbehind lengths, now that rule refs are resolved.
        for i in 0..rules.len() {
            let name = rules[i].name.clone();
            let mut node = std::mem::replace(&mut rules[i].entry, Node::Pass);
            let result = fill_lookbehind(&mut node, &rules, &keywords, RuleId(i as u32), &name);
            rules[i].entry = node;
            result?;
        }

        let has_hints = rules.iter().any(|rule| contains_stateful(&rule.entry));
        let needs_state =
            !flags.is_empty() || !captures.is_empty() || !imports.is_empty() || has_hints;

        let mut trie = KeywordTrie::new();
        for (i, word) in keywords.iter().enumerate() {
            if case_insensitive {
                trie.insert(word.to_ascii_lowercase().as_bytes(), KeywordId(i as u32));
            } else {
                trie.insert(word.as_bytes(), KeywordId(i as u32));
            }
        }

        Ok(Definition {
            id: DefId(NEXT_DEF_ID.fetch_add(1, Ordering::Relaxed)),
            rules,
            rule_ids,
            entry,
            keywords,
            keyword_ids,
            trie,
            flags,
            flag_ids,
            captures,
            capture_ids,
            imports,
            case_insensitive,
            needs_state,
        })
    }
}

// ─── Build passes ───────────────────────────────────────────────────────────

fn rewrite_void_refs(node: &mut Node, rule_ids: &HashMap<String, RuleId>, voidness: &[bool]) {
    if let Node::Ref { name, target } = node
        && let Some(id) = rule_ids.get(name.as_str())
        && voidness[id.0 as usize]
    {
        *node = Node::Inline {
            name: std::mem::take(name),
            target: *target,
        };
        return;
    }
    for child in node.children_mut() {
        rewrite_void_refs(child, rule_ids, voidness);
    }
}

fn collect_refs(node: &Node, rule_ids: &HashMap<String, RuleId>, referenced: &mut [bool]) {
    if let Node::Ref { name, .. } = node
        && let Some(id) = rule_ids.get(name.as_str())
    {
        referenced[id.0 as usize] = true;
    }
    for child in node.children() {
        collect_refs(child, rule_ids, referenced);
    }
}

struct LinkCtx<'a> {
    rules: &'a HashMap<String, RuleId>,
    keywords: &'a HashMap<String, KeywordId>,
    imports: &'a HashMap<String, usize>,
}

impl LinkCtx<'_> {
    fn rule(&self, name: &str) -> Result<RuleId, LinkError> {
        self.rules
            .get(name)
            .copied()
            .ok_or_else(|| LinkError::UndefinedRule(name.to_string()))
    }

    fn keyword(&self, word: &str) -> Result<KeywordId, LinkError> {
        self.keywords
            .get(word)
            .copied()
            .ok_or_else(|| LinkError::UndefinedKeyword(word.to_string()))
    }

    fn import(&self, alias: &str) -> Result<usize, LinkError> {
        self.imports
            .get(alias)
            .copied()
            .ok_or_else(|| LinkError::UndefinedGrammar(alias.to_string()))
    }
}

fn link_node(node: &mut Node, ctx: &LinkCtx) -> Result<(), LinkError> {
    match node {
        Node::Ref { name, target } | Node::Inline { name, target } => {
            *target = ctx.rule(name)?;
        }
        Node::Previous {
            rule,
            target,
            keyword,
            keyword_id,
        } => {
            *target = ctx.rule(rule)?;
            if let Some(word) = keyword {
                *keyword_id = Some(ctx.keyword(word)?);
            }
        }
        Node::Context { rule, target, node } => {
            *target = ctx.rule(rule)?;
            if let Some(inner) = node {
                link_node(inner, ctx)?;
            }
        }
        Node::Invoke {
            alias,
            import,
            coverage,
        } => {
            *import = ctx.import(alias)?;
            if let Some(cover) = coverage {
                link_node(cover, ctx)?;
            }
        }
        _ => {
            for child in node.children_mut() {
                link_node(child, ctx)?;
            }
        }
    }
    Ok(())
}

fn fill_lookbehind(
    node: &mut Node,
    rules: &[Rule],
    keywords: &[String],
    current: RuleId,
    rule_name: &str,
) -> Result<(), LinkError> {
    if let Node::Behind { node: inner, len } | Node::NotBehind { node: inner, len } = node {
        fill_lookbehind(inner, rules, keywords, current, rule_name)?;
        let mut visiting = vec![current];
        *len = fixed_len(inner, rules, keywords, &mut visiting)
            .ok_or_else(|| LinkError::VariableLookbehind(rule_name.to_string()))?;
        return Ok(());
    }
    for child in node.children_mut() {
        fill_lookbehind(child, rules, keywords, current, rule_name)?;
    }
    Ok(())
}

/// Structurally fixed match length of a node, or `None` when the length can
/// vary (which makes the node unusable inside a lookbehind).
fn fixed_len(
    node: &Node,
    rules: &[Rule],
    keywords: &[String],
    visiting: &mut Vec<RuleId>,
) -> Option<usize> {
    match node {
        Node::Char(_) | Node::Range(_) | Node::Except(_) | Node::Any => Some(1),
        Node::Str(bytes) => Some(bytes.len()),
        Node::Keyword(members) => {
            let mut lens = members
                .iter()
                .map(|id| keywords.get(id.0 as usize).map(String::len));
            let first = lens.next()??;
            lens.all(|len| len == Some(first)).then_some(first)
        }
        Node::Boi
        | Node::Eoi
        | Node::Pass
        | Node::Hint(_)
        | Node::Set { .. }
        | Node::Previous { .. }
        | Node::Ahead(_)
        | Node::Not(_)
        | Node::Behind { .. }
        | Node::NotBehind { .. } => Some(0),
        Node::Context { node: inner, .. } => match inner {
            Some(inner) => fixed_len(inner, rules, keywords, visiting),
            None => Some(0),
        },
        Node::Fail
        | Node::Find(_)
        | Node::Call(_)
        | Node::Replay(_)
        | Node::Lazy { .. }
        | Node::Invoke { .. } => None,
        Node::Choice(alts) => {
            let mut lens = alts
                .iter()
                .map(|alt| fixed_len(alt, rules, keywords, visiting));
            let first = lens.next()??;
            lens.all(|len| len == Some(first)).then_some(first)
        }
        Node::Glue(parts) => parts
            .iter()
            .map(|part| fixed_len(part, rules, keywords, visiting))
            .try_fold(0usize, |sum, len| Some(sum + len?)),
        Node::Repeat {
            min,
            max,
            node: inner,
        }
        | Node::Greedy {
            min,
            max,
            node: inner,
        } => {
            if *max != Some(*min) {
                return None;
            }
            Some(min * fixed_len(inner, rules, keywords, visiting)?)
        }
        Node::Length {
            min,
            max,
            node: inner,
        } => {
            let len = fixed_len(inner, rules, keywords, visiting)?;
            (len >= *min && max.is_none_or(|m| len <= m)).then_some(len)
        }
        Node::If {
            then, otherwise, ..
        } => {
            let a = fixed_len(then, rules, keywords, visiting)?;
            let b = fixed_len(otherwise, rules, keywords, visiting)?;
            (a == b).then_some(a)
        }
        Node::Capture { node: inner, .. } => fixed_len(inner, rules, keywords, visiting),
        Node::Ref { target, .. } | Node::Inline { target, .. } => {
            if visiting.contains(target) {
                return None;
            }
            visiting.push(*target);
            let len = fixed_len(
                &rules[target.0 as usize].entry,
                rules,
                keywords,
                visiting,
            );
            visiting.pop();
            len
        }
    }
}

fn contains_stateful(node: &Node) -> bool {
    matches!(node, Node::Hint(_) | Node::Call(_))
        || node.children().into_iter().any(contains_stateful)
}
