//! The metadata model: sets of small integer label identifiers.

use bitvec::prelude::*;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Number of 64-bit words backing a [`MetaSet`]'s bitmap.
pub const META_SET_WORDS: usize = 2;

/// Number of 32-bit argument slots carried alongside the bitmap.
pub const META_SET_ARGS: usize = 2;

/// Largest label id (exclusive) representable in a [`MetaSet`].
pub const MAX_LABELS: usize = META_SET_WORDS * 64;

// Policies are written against label ids up to ~128.
const_assert!(MAX_LABELS >= 128);

type MetaBits = BitArr!(for MAX_LABELS, in u64, Lsb0);

/// A set of metadata label identifiers, plus optional argument slots.
///
/// Conceptually an unordered set of small integers: inserting a label twice
/// has no effect, and insertion order is irrelevant. The representation is a
/// dense bitmap of [`MAX_LABELS`] bits.
///
/// Equality and hashing are value-based over the bitmap *only*; the argument
/// slots ride along but do not participate in identity. This is what makes
/// canonicalization by bitmap sound (see
/// [`MetaSetCache`](crate::meta_cache::MetaSetCache)).
#[derive(Clone, Default)]
pub struct MetaSet {
    bits: MetaBits,
    args: [u32; META_SET_ARGS],
}

impl MetaSet {
    /// Returns the empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a label id, returning `true` if it was not already present.
    ///
    /// # Panics
    ///
    /// Panics if `label >= MAX_LABELS`. Callers reading untrusted label ids
    /// (e.g. from a tag file) must range-check first.
    pub fn insert(&mut self, label: u32) -> bool {
        let label = label as usize;
        if label >= MAX_LABELS {
            panic!("label id {label} out of range");
        }
        !self.bits.replace(label, true)
    }

    /// Returns `true` if the given label id is in the set.
    pub fn contains(&self, label: u32) -> bool {
        (label as usize) < MAX_LABELS && self.bits[label as usize]
    }

    /// Unions all labels of `other` into `self`. Argument slots of `self` are
    /// left untouched.
    pub fn union_with(&mut self, other: &MetaSet) {
        for (word, other_word) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *word |= *other_word;
        }
    }

    /// Returns `true` if the set holds no labels.
    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// Number of labels in the set.
    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    /// Iterates the label ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_ones().map(|i| i as u32)
    }

    /// The argument slots attached to this set.
    pub fn args(&self) -> &[u32; META_SET_ARGS] {
        &self.args
    }

    /// Overwrites the argument slots from `values`, zero-filling any slot
    /// beyond `values.len()`. Surplus values are ignored.
    pub fn set_args(&mut self, values: &[u32]) {
        for (slot, value) in self
            .args
            .iter_mut()
            .zip(values.iter().copied().chain(std::iter::repeat(0)))
        {
            *slot = value;
        }
    }
}

impl PartialEq for MetaSet {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl Eq for MetaSet {}

impl Hash for MetaSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits.as_raw_slice().hash(state);
    }
}

impl FromIterator<u32> for MetaSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = Self::new();
        for label in iter {
            set.insert(label);
        }
        set
    }
}

impl fmt::Debug for MetaSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
