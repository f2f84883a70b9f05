//! Trie key space partitioning
//!
//! A shard covers a half-open range of words `[start, end)` compared as raw
//! bytes. The full key space is `["", ∞)`, so any complete partition places
//! every possible word in exactly one range.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of letters in the word alphabet used for split points
const ALPHABET_LEN: i32 = 26;

/// Deepest prefix considered when searching for a split point
const MAX_SPLIT_DEPTH: usize = 64;

/// Half-open key range `[start, end)`; `end == None` is unbounded
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound
    pub start: String,
    /// Exclusive upper bound
    pub end: Option<String>,
}

impl KeyRange {
    /// Create a range from explicit bounds
    pub fn new(start: impl Into<String>, end: Option<String>) -> Self {
        Self {
            start: start.into(),
            end,
        }
    }

    /// The range covering every key
    pub fn full() -> Self {
        Self::new("", None)
    }

    /// True if this range covers the whole key space
    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_none()
    }

    /// True if `key` falls inside the range
    pub fn contains(&self, key: &str) -> bool {
        key >= self.start.as_str() && self.end.as_deref().map_or(true, |end| key < end)
    }

    /// True if `key` lies inside the range and is not its lower bound
    pub fn strictly_contains(&self, key: &str) -> bool {
        key > self.start.as_str() && self.end.as_deref().map_or(true, |end| key < end)
    }

    /// True if `other` begins exactly where this range ends
    pub fn adjoins(&self, other: &KeyRange) -> bool {
        self.end.as_deref() == Some(other.start.as_str())
    }

    /// Split into `[start, point)` and `[point, end)`
    ///
    /// Returns `None` unless `point` lies strictly inside the range, which
    /// keeps both halves non-empty.
    pub fn split_at(&self, point: &str) -> Option<(KeyRange, KeyRange)> {
        if !self.strictly_contains(point) {
            return None;
        }
        let lower = KeyRange::new(self.start.clone(), Some(point.to_string()));
        let upper = KeyRange::new(point.to_string(), self.end.clone());
        Some((lower, upper))
    }

    /// Deterministic median of the range over the `a..=z` word alphabet
    ///
    /// Walks the common prefix of both bounds and picks the middle letter at
    /// the first position where they are at least two letters apart. The
    /// full space yields `"m"`.
    pub fn midpoint(&self) -> Option<String> {
        let lo = self.start.as_bytes();
        let hi = self.end.as_deref().map(str::as_bytes);
        let mut upper_open = hi.is_none();
        let mut prefix: Vec<u8> = Vec::new();

        for i in 0..MAX_SPLIT_DEPTH {
            let a = lo.get(i).map_or(-1, |&c| letter_index(c));
            let b = if upper_open {
                ALPHABET_LEN
            } else {
                // Upper bound exhausted on a shared prefix: nothing fits.
                letter_index(*hi?.get(i)?)
            };

            if b - a >= 2 {
                let m = (a + b).div_euclid(2);
                prefix.push(b'a' + m as u8);
                let candidate = String::from_utf8(prefix).ok()?;
                return self.strictly_contains(&candidate).then_some(candidate);
            }

            let Some(&c) = lo.get(i) else {
                // Lower bound is a prefix of what has been built; follow the upper bound
                if i > lo.len() {
                    let candidate = String::from_utf8(prefix).ok()?;
                    return self.strictly_contains(&candidate).then_some(candidate);
                }
                prefix.push(*hi?.get(i)?);
                continue;
            };
            if !upper_open {
                let h = hi?[i];
                if h < c {
                    return None;
                }
                upper_open = h > c;
            }
            prefix.push(c);
        }

        None
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            Some(end) => write!(f, "[{:?}, {:?})", self.start, end),
            None => write!(f, "[{:?}, ∞)", self.start),
        }
    }
}

/// Alphabet position of a byte, clamped to one step past either end
fn letter_index(c: u8) -> i32 {
    (c as i32 - b'a' as i32).clamp(-1, ALPHABET_LEN)
}
