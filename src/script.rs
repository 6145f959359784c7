// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Script elements (C2) and interpretation map (C3), compiled from
//! `config::ScriptElementSpec`. Grounded on `original_source/src/config.h`
//! (`Script_El`, `Send_T`, `Expect_T`, `Delay_T`, `Interpretation`).

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::device::PlugHandle;

/// One binding from an EXPECT's capture subgroup to a plug. `plug` is
/// `None` when the plug at `match_pos` is unoccupied/unmanaged — spec
/// §4.4(a): "A null node binding on the plug means skip."
#[derive(Debug, Clone)]
pub struct Interpretation {
    pub plug: Option<PlugHandle>,
    pub match_pos: usize,
}

/// A compiled script element.
#[derive(Debug, Clone)]
pub enum ScriptElement {
    /// `format` holds at most one `%s` slot, substituted with the action's
    /// target iff the action has one (spec §4.2).
    Send { format: String },
    /// `completion` gates when the buffer holds a full reply; `capture` is
    /// run against the consumed text to pull out subgroups. `map` is
    /// absent for EXPECTs with no semantic effect (e.g. a login ack).
    Expect { completion: Regex, capture: Regex, map: Option<Vec<Interpretation>> },
    Delay { duration: Duration },
}

/// A full per-command script, shared (via `Arc`) across every `DeviceAction`
/// that runs it — the same script is replayed on every reconnect-then-retry
/// and every periodic refresh.
pub type CompiledScript = Vec<ScriptElement>;

/// An external cursor over one device's compiled script for one action.
/// Spec §9: "the script iterator advances one element at a time between
/// event-loop turns... driven externally by the loop, not by a for-each
/// pattern." `position` is the index of the *next* unconsumed element;
/// `None` once exhausted.
#[derive(Clone)]
pub struct ScriptCursor {
    script: Arc<CompiledScript>,
    position: Option<usize>,
}

impl ScriptCursor {
    /// Scripts are compiled once at config load and shared for the life of
    /// the device; callers hold the canonical `Arc` on the `Device` and
    /// clone it (cheap, refcount bump) for each new per-device action.
    pub fn new(script: Arc<CompiledScript>) -> Self {
        let position = if script.is_empty() { None } else { Some(0) };
        Self { script, position }
    }

    /// The element currently being processed, or `None` if the script is
    /// exhausted.
    pub fn current(&self) -> Option<&ScriptElement> {
        self.position.and_then(|i| self.script.get(i))
    }

    /// Advance to the next element. Returns the new current element, or
    /// `None` if the script is now exhausted.
    pub fn advance(&mut self) -> Option<&ScriptElement> {
        let next = self.position.map(|i| i + 1).unwrap_or(0);
        if next < self.script.len() {
            self.position = Some(next);
        } else {
            self.position = None;
        }
        self.current()
    }

    pub fn is_exhausted(&self) -> bool {
        self.position.is_none()
    }

    /// Reset to the first element (spec §4.3 step 6 / §4.5 case 4: a
    /// preempted action's script restarts from the beginning).
    pub fn reset(&mut self) {
        self.position = if self.script.is_empty() { None } else { Some(0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(fmt: &str) -> ScriptElement {
        ScriptElement::Send { format: fmt.to_string() }
    }

    #[test]
    fn cursor_starts_at_first_element() {
        let script: Arc<CompiledScript> = Arc::new(vec![send("a"), send("b")]);
        let cursor = ScriptCursor::new(script);
        assert!(matches!(cursor.current(), Some(ScriptElement::Send { format }) if format == "a"));
    }

    #[test]
    fn cursor_advances_then_exhausts() {
        let script: Arc<CompiledScript> = Arc::new(vec![send("a"), send("b")]);
        let mut cursor = ScriptCursor::new(script);
        cursor.advance();
        assert!(matches!(cursor.current(), Some(ScriptElement::Send { format }) if format == "b"));
        cursor.advance();
        assert!(cursor.current().is_none());
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn empty_script_starts_exhausted() {
        let script: Arc<CompiledScript> = Arc::new(vec![]);
        let cursor = ScriptCursor::new(script);
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn reset_returns_to_first_element() {
        let script: Arc<CompiledScript> = Arc::new(vec![send("a"), send("b")]);
        let mut cursor = ScriptCursor::new(script);
        cursor.advance();
        cursor.reset();
        assert!(matches!(cursor.current(), Some(ScriptElement::Send { format }) if format == "a"));
    }
}
