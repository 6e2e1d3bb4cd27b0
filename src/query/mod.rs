//! Declarative selection and ordering over instances and pods
//!
//! A [`Selector`] is a predicate that composes with `select` (and) and
//! `filter` (and not). Pipelines start from [`query`], which matches
//! everything, so every pipeline reads the same way:
//!
//! ```
//! use node_drainer::query::{self, instance::*};
//!
//! let deletable = query::query()
//!     .select(has_ec2_data())
//!     .select(has_lifecycle_message())
//!     .filter(lifecycle_completed());
//! # let _ = deletable;
//! ```
//!
//! A [`By`] is a comparator. Sorting applies one stable sort per key, so
//! keys are applied from least to most significant: the key applied last
//! decides the order, earlier keys only break its ties.

pub mod instance;
pub mod pod;

use std::cmp::Ordering;
use std::sync::Arc;

pub use instance::Instances;
pub use pod::Pods;

/// A composable predicate over `T`
pub struct Selector<T> {
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> Clone for Selector<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

/// The neutral selector, matching everything
pub fn query<T>() -> Selector<T> {
    Selector::new(|_| true)
}

impl<T> Selector<T> {
    pub fn new(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    pub fn matches(&self, item: &T) -> bool {
        (self.predicate)(item)
    }
}

impl<T: 'static> Selector<T> {
    /// Both this selector and `other` must match
    pub fn select(self, other: Selector<T>) -> Selector<T> {
        Selector::new(move |item| self.matches(item) && other.matches(item))
    }

    /// This selector must match and `other` must not
    pub fn filter(self, other: Selector<T>) -> Selector<T> {
        Selector::new(move |item| self.matches(item) && !other.matches(item))
    }

    /// Either this selector or `other` must match
    pub fn or(self, other: Selector<T>) -> Selector<T> {
        Selector::new(move |item| self.matches(item) || other.matches(item))
    }

    pub fn negate(self) -> Selector<T> {
        Selector::new(move |item| !self.matches(item))
    }
}

/// A comparator used for stable multi-key sorting
pub struct By<T> {
    compare: Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>,
}

impl<T> Clone for By<T> {
    fn clone(&self) -> Self {
        Self {
            compare: Arc::clone(&self.compare),
        }
    }
}

impl<T> By<T> {
    pub fn new(compare: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            compare: Arc::new(compare),
        }
    }

    /// Compare by a derived key
    pub fn key<K: Ord>(key: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        Self::new(move |a, b| key(a).cmp(&key(b)))
    }

    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.compare)(a, b)
    }

    /// Stable sort `items` in place
    pub fn sort(&self, items: &mut [T]) {
        items.sort_by(|a, b| self.compare(a, b));
    }
}

impl<T: 'static> By<T> {
    pub fn descending(self) -> By<T> {
        By::new(move |a, b| self.compare(b, a))
    }
}
