// This file is part of chainweb-indexer.
// Copyright (C) 2025 Chainweb Indexer Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Deserializer, Serialize};

/// A set of unsigned integers, stored as a sorted list of disjoint closed
/// intervals. Overlapping and adjacent intervals are always merged, so two
/// sets containing the same integers compare equal and serialize identically.
///
/// The serialized form is a list of `[lo, hi]` pairs, e.g. `[[3, 7], [10, 10]]`;
/// the empty set serializes to `[]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntervalSet(Vec<(u64, u64)>);

impl IntervalSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The closed interval `[lo, hi]`; empty when `lo > hi`.
    pub fn closed(lo: u64, hi: u64) -> Self {
        if lo <= hi {
            Self(vec![(lo, hi)])
        } else {
            Self::new()
        }
    }

    /// The single integer `value`, i.e. `[value, value]`.
    pub fn singleton(value: u64) -> Self {
        Self::closed(value, value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, value: u64) -> bool {
        self.0
            .binary_search_by(|&(lo, hi)| {
                if value < lo {
                    std::cmp::Ordering::Greater
                } else if value > hi {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// The disjoint intervals in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, u64)> + '_ {
        self.0.iter().copied()
    }

    /// The smallest and largest contained integer.
    pub fn bounds(&self) -> Option<(u64, u64)> {
        match (self.0.first(), self.0.last()) {
            (Some(&(lo, _)), Some(&(_, hi))) => Some((lo, hi)),
            _ => None,
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        self.0.iter().chain(other.0.iter()).copied().collect()
    }

    pub fn intersection(&self, other: &Self) -> Self {
        let mut intervals = Vec::new();
        let (mut i, mut j) = (0, 0);

        while i < self.0.len() && j < other.0.len() {
            let (a_lo, a_hi) = self.0[i];
            let (b_lo, b_hi) = other.0[j];

            let lo = a_lo.max(b_lo);
            let hi = a_hi.min(b_hi);
            if lo <= hi {
                intervals.push((lo, hi));
            }

            // Advance the interval that ends first.
            if a_hi <= b_hi {
                i += 1;
            } else {
                j += 1;
            }
        }

        Self(intervals)
    }

    pub fn difference(&self, other: &Self) -> Self {
        let mut intervals = Vec::new();
        let mut j = 0;

        for &(lo, hi) in &self.0 {
            // Intervals of `other` entirely below this one stay behind for
            // good, since both lists are sorted.
            while j < other.0.len() && other.0[j].1 < lo {
                j += 1;
            }

            let mut remaining = Some(lo);
            let mut k = j;
            while let Some(cursor) = remaining {
                match other.0.get(k) {
                    Some(&(b_lo, b_hi)) if b_lo <= hi => {
                        if b_lo > cursor {
                            intervals.push((cursor, b_lo - 1));
                        }
                        remaining = (b_hi < hi).then(|| b_hi + 1);
                        k += 1;
                    }

                    _ => {
                        intervals.push((cursor, hi));
                        remaining = None;
                    }
                }
            }
        }

        Self(intervals)
    }
}

/// Canonicalize arbitrary closed intervals by sorting and merging overlapping
/// or adjacent ones (`[a, b]` and `[b + 1, c]` become `[a, c]`); intervals
/// with `lo > hi` are dropped.
impl FromIterator<(u64, u64)> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = (u64, u64)>>(iter: T) -> Self {
        let mut intervals = iter
            .into_iter()
            .filter(|&(lo, hi)| lo <= hi)
            .collect::<Vec<_>>();
        intervals.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
        for (lo, hi) in intervals {
            match merged.last_mut() {
                Some((_, last_hi)) if lo <= last_hi.saturating_add(1) => {
                    *last_hi = (*last_hi).max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }

        Self(merged)
    }
}

impl<'de> Deserialize<'de> for IntervalSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let intervals = Vec::<(u64, u64)>::deserialize(deserializer)?;
        Ok(intervals.into_iter().collect())
    }
}
