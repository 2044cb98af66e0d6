//! Strategy objects driving a single `operate()` attempt.
//!
//! A [`DecisionMaker`] is consulted once per retry of
//! [`crate::map::MVMap::operate`], given the value currently stored for a
//! key (if any) and the value the caller is offering, and returns a
//! [`Decision`] telling the engine what to do next. Pulling this decision
//! out of the engine loop is what lets `put`, `remove`, `putIfAbsent`,
//! `replace(key, old, new)` and friends share one mutation path.

/// Outcome of a single [`DecisionMaker::decide`] call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// Write `select_value(existing, providing)` into the slot.
    Put,
    /// Remove the entry.
    Remove,
    /// Leave the tree unchanged; the caller's operation did not apply.
    Abort,
    /// The value observed was stale (another writer raced ahead); reload
    /// the current root and call `decide` again.
    Repeat,
}

/// Decides what a single [`crate::map::MVMap::operate`] attempt should do.
///
/// Implementations are free to be stateful (e.g. [`RewriteDecisionMaker`]
/// remembers the version it expects to still find), so `decide` takes
/// `&mut self` and the engine calls [`DecisionMaker::reset`] before each
/// fresh attempt at the root.
pub trait DecisionMaker<V>: Send + Sync {
    /// `existing` is the value currently stored for the key, if any.
    /// `providing` is the value the caller supplied, if any (absent for a
    /// plain `remove`).
    fn decide(&mut self, existing: Option<&V>, providing: Option<&V>) -> Decision;

    /// Picks the value actually written on [`Decision::Put`]. Defaults to
    /// the caller-provided value; [`RewriteDecisionMaker`] overrides this to
    /// re-write the existing value verbatim.
    fn select_value(&self, existing: Option<V>, providing: Option<V>) -> Option<V> {
        let _ = existing;
        providing
    }

    /// Called before the first `decide` of a new attempt. Stateless
    /// decision makers (the common case) use the default no-op.
    fn reset(&mut self) {}
}

/// Unconditional `put`: always writes the provided value.
pub struct Put;

impl<V> DecisionMaker<V> for Put {
    fn decide(&mut self, _existing: Option<&V>, _providing: Option<&V>) -> Decision {
        Decision::Put
    }
}

/// Unconditional `remove`: always removes, regardless of the current value.
pub struct Remove;

impl<V> DecisionMaker<V> for Remove {
    fn decide(&mut self, _existing: Option<&V>, _providing: Option<&V>) -> Decision {
        Decision::Remove
    }
}

/// `putIfAbsent`: writes only when no entry currently exists for the key.
pub struct IfAbsent;

impl<V> DecisionMaker<V> for IfAbsent {
    fn decide(&mut self, existing: Option<&V>, _providing: Option<&V>) -> Decision {
        if existing.is_none() {
            Decision::Put
        } else {
            Decision::Abort
        }
    }
}

/// `replace(key, value)`: writes only when an entry already exists.
pub struct IfPresent;

impl<V> DecisionMaker<V> for IfPresent {
    fn decide(&mut self, existing: Option<&V>, _providing: Option<&V>) -> Decision {
        if existing.is_some() {
            Decision::Put
        } else {
            Decision::Abort
        }
    }
}

/// `replace(key, oldValue, newValue)` / `remove(key, value)`: acts only if
/// the current value equals an expected one.
pub struct Equals<V> {
    expected: V,
    /// `true` removes on match; `false` writes the provided value on match.
    remove_on_match: bool,
}

impl<V> Equals<V> {
    /// Builds a conditional-write decision maker (used by
    /// `replace(key, old, new)`).
    pub fn write(expected: V) -> Self {
        Equals {
            expected,
            remove_on_match: false,
        }
    }

    /// Builds a conditional-remove decision maker (used by
    /// `remove(key, value)`).
    pub fn remove(expected: V) -> Self {
        Equals {
            expected,
            remove_on_match: true,
        }
    }
}

impl<V: PartialEq + Send + Sync> DecisionMaker<V> for Equals<V> {
    fn decide(&mut self, existing: Option<&V>, _providing: Option<&V>) -> Decision {
        match existing {
            Some(v) if *v == self.expected => {
                if self.remove_on_match {
                    Decision::Remove
                } else {
                    Decision::Put
                }
            }
            _ => Decision::Abort,
        }
    }
}

/// Re-saves a page's existing entries verbatim, used by background
/// compaction to move a value onto a fresh page without changing it.
/// Aborts (rather than overwriting) if a concurrent writer already changed
/// the value since it was read.
pub struct RewriteDecisionMaker<V> {
    expected: V,
}

impl<V> RewriteDecisionMaker<V> {
    /// `expected` is the value observed when the rewrite was scheduled.
    pub fn new(expected: V) -> Self {
        RewriteDecisionMaker { expected }
    }
}

impl<V: PartialEq + Clone + Send + Sync> DecisionMaker<V> for RewriteDecisionMaker<V> {
    fn decide(&mut self, existing: Option<&V>, _providing: Option<&V>) -> Decision {
        match existing {
            Some(v) if *v == self.expected => Decision::Put,
            _ => Decision::Abort,
        }
    }

    fn select_value(&self, existing: Option<V>, _providing: Option<V>) -> Option<V> {
        existing
    }
}
