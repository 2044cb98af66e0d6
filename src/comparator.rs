//! Pluggable key ordering.
//!
//! The core never assumes `K: Ord`; every traversal and split routine takes
//! a `&dyn Comparator<K>` so callers can install a custom total order
//! without forcing it through `Ord` — a free-function comparison boundary
//! rather than baking ordering into the key type itself, since this core
//! owns no on-disk encoding to compare against.

use std::cmp::Ordering;

/// A total order over `K`, injected into every map at construction time.
pub trait Comparator<K>: Send + Sync {
    /// Compares two keys.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Wraps a plain function or closure as a [`Comparator`].
pub struct FnComparator<F>(pub F);

impl<K, F> Comparator<K> for FnComparator<F>
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.0)(a, b)
    }
}

struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// The default comparator for any `K: Ord`: delegates to `Ord::cmp`.
///
/// Deliberately does not special-case numeric-looking strings (treating any
/// decimal-parseable string as numeric and falling back to lexicographic
/// order otherwise, see DESIGN.md) — mixed numeric/non-numeric key sets have
/// ambiguous total order under that rule, so comparison stays fully
/// pluggable instead. Callers who need that behavior supply it via
/// [`FnComparator`].
pub fn natural_order<K: Ord>() -> impl Comparator<K> {
    NaturalOrder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_order_matches_ord() {
        let cmp = natural_order::<i32>();
        assert_eq!(cmp.compare(&1, &2), Ordering::Less);
        assert_eq!(cmp.compare(&2, &2), Ordering::Equal);
        assert_eq!(cmp.compare(&3, &2), Ordering::Greater);
    }

    #[test]
    fn fn_comparator_reverses() {
        let cmp = FnComparator(|a: &i32, b: &i32| b.cmp(a));
        assert_eq!(cmp.compare(&1, &2), Ordering::Greater);
    }
}
