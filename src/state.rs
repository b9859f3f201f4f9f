//! Per-match mutable state: flags, capture ranges, the diagnostic hint, and
//! nested sub-grammar states.
//!
//! A `MatchState` is owned by one top-level match at a time. Definitions that
//! need no state (no flags, captures, imports, hints or host calls) skip the
//! allocation entirely.

use crate::grammar::{CaptureId, Definition, FlagId};

/// Mutable store threaded through one top-level match.
#[derive(Debug, Default)]
pub struct MatchState {
    flags: Vec<bool>,
    captures: Vec<Option<(usize, usize)>>,
    hint: Option<(String, usize)>,
    /// One lazily created child state per import, persistent across repeated
    /// `Invoke`s within a single top-level match.
    subs: Vec<Option<Box<MatchState>>>,
}

impl MatchState {
    /// A state sized for the given definition.
    pub fn new(def: &Definition) -> Self {
        Self {
            flags: vec![false; def.flag_count()],
            captures: vec![None; def.capture_count()],
            hint: None,
            subs: (0..def.import_count()).map(|_| None).collect(),
        }
    }

    /// Clear contents (recursively) for reuse, keeping allocations.
    pub fn reset(&mut self) {
        self.flags.fill(false);
        self.captures.fill(None);
        self.hint = None;
        for sub in self.subs.iter_mut().flatten() {
            sub.reset();
        }
    }

    pub fn flag(&self, flag: FlagId) -> bool {
        self.flags.get(flag.0 as usize).copied().unwrap_or(false)
    }

    pub(crate) fn set_flag(&mut self, flag: FlagId, value: bool) {
        if let Some(slot) = self.flags.get_mut(flag.0 as usize) {
            *slot = value;
        }
    }

    /// The `[start, end)` range recorded for a capture, if it matched.
    pub fn capture(&self, slot: CaptureId) -> Option<(usize, usize)> {
        self.captures.get(slot.0 as usize).copied().flatten()
    }

    pub(crate) fn set_capture(&mut self, slot: CaptureId, start: usize, end: usize) {
        if let Some(c) = self.captures.get_mut(slot.0 as usize) {
            *c = Some((start, end));
        }
    }

    /// The recorded diagnostic hint, as `(message, offset)`.
    pub fn hint(&self) -> Option<(&str, usize)> {
        self.hint.as_ref().map(|(m, p)| (m.as_str(), *p))
    }

    /// First recorded hint wins for the duration of one match attempt.
    pub(crate) fn note_hint(&mut self, message: &str, pos: usize) {
        if self.hint.is_none() {
            self.hint = Some((message.to_string(), pos));
        }
    }

    pub(crate) fn clear_hint(&mut self) {
        self.hint = None;
    }

    /// The persistent child state for an import, created on first use.
    pub(crate) fn sub_state(&mut self, import: usize, sub: &Definition) -> &mut MatchState {
        self.subs[import].get_or_insert_with(|| Box::new(MatchState::new(sub)))
    }

    /// Render the hint as a line/column annotated message against the input
    /// it was recorded on.
    pub fn hint_message(&self, input: &[u8]) -> Option<String> {
        let (message, offset) = self.hint()?;
        let (line, col) = line_col(input, offset);
        Some(format!("{line}:{col}: {message}"))
    }
}

/// 1-based line and column of a byte offset.
pub fn line_col(input: &[u8], offset: usize) -> (usize, usize) {
    let upto = offset.min(input.len());
    let line = 1 + input[..upto].iter().filter(|&&b| b == b'\n').count();
    let col = 1 + upto - input[..upto].iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
    (line, col)
}
