//! Token tree algebra: gap projection (`glow`) and the interval surgery
//! (`meld`, `burn`) used to splice overlapping parses.
//!
//! `meld` is what allows re-parsing a sub-range of a buffer with a refined
//! grammar and splicing the result back into the original tree without losing
//! the outer structure.

use crate::token::Token;

/// Depth-first gap projection.
///
/// Calls the visitor once per nonempty contiguous region of a token not
/// covered by one of its children, as `(owning token, start, end)`, recursing
/// into each child in offset order. Over a whole tree the visited regions
/// tile the root span exactly, in offset order.
pub fn glow<F>(token: &Token, visit: &mut F)
where
    F: FnMut(&Token, usize, usize),
{
    let mut at = token.start;
    for child in &token.children {
        if at < child.start {
            visit(token, at, child.start);
        }
        glow(child, visit);
        at = child.end;
    }
    if at < token.end {
        visit(token, at, token.end);
    }
}

/// Merge `b` into `a` in place, ordered by start offset.
///
/// A token of `b` fully contained in a token of `a` is recursively melded
/// under it. Where `b` overlaps existing content, that content is burned
/// away first and `b` takes its place among the siblings. The root span of
/// `a` grows to cover `b` if needed.
pub fn meld(a: &mut Token, b: Token) {
    a.start = a.start.min(b.start);
    a.end = a.end.max(b.end);
    meld_into(a, b);
}

fn meld_into(a: &mut Token, b: Token) {
    if let Some(child) = a
        .children
        .iter_mut()
        .find(|c| c.start <= b.start && b.end <= c.end)
    {
        return meld_into(child, b);
    }
    if a
        .children
        .iter()
        .any(|c| c.start < b.end && b.start < c.end)
    {
        a.children.retain_mut(|c| burn(c, b.start, b.end));
    }
    let at = a
        .children
        .iter()
        .position(|c| c.start >= b.start)
        .unwrap_or(a.children.len());
    a.children.insert(at, b);
}

/// Clip a token (and recursively its children) against a deletion range.
///
/// Returns `false` when the token itself falls entirely inside the range and
/// must be removed by its owner. Otherwise the token survives, with the
/// overlapping side truncated (or untouched, for an interior range) and its
/// children filtered the same way.
pub fn burn(token: &mut Token, from: usize, to: usize) -> bool {
    if to <= token.start || token.end <= from {
        return true;
    }
    if from <= token.start && token.end <= to {
        return false;
    }
    if token.start < from && to < token.end {
        // Interior hole: the span still covers it, only children are clipped.
    } else if token.start < from {
        token.end = from;
    } else {
        token.start = to;
    }
    token.children.retain_mut(|child| burn(child, from, to));
    true
}
