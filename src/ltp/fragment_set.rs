// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ordered set of half-open `[begin, end)` byte ranges.
//!
//! The invariant after every operation: ranges are disjoint and
//! non-adjacent (touching ranges are merged), so set membership and gap
//! queries are O(log n + k) over the underlying ordered map.

use std::collections::BTreeMap;

/// Half-open byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub begin: u64,
    pub end: u64,
}

impl Fragment {
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin < end);
        Self { begin, end }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FragmentSet {
    /// begin → end for every stored range.
    ranges: BTreeMap<u64, u64>,
}

impl FragmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Total bytes covered.
    pub fn covered_bytes(&self) -> u64 {
        self.ranges.iter().map(|(b, e)| e - b).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = Fragment> + '_ {
        self.ranges
            .iter()
            .map(|(&begin, &end)| Fragment { begin, end })
    }

    /// Inserts `[begin, end)`, merging overlapping and adjacent ranges.
    /// Returns true when the insert extended coverage (a pure duplicate
    /// returns false).
    pub fn insert(&mut self, begin: u64, end: u64) -> bool {
        if begin >= end {
            return false;
        }
        let mut new_begin = begin;
        let mut new_end = end;

        // a predecessor that reaches begin (or beyond) absorbs the range
        if let Some((&pb, &pe)) = self.ranges.range(..=begin).next_back() {
            if pe >= begin {
                if pe >= end {
                    return false; // fully covered already
                }
                new_begin = pb;
            }
        }

        // swallow every successor that starts within the (possibly grown)
        // range or immediately after it
        let mut doomed = Vec::new();
        for (&sb, &se) in self.ranges.range(new_begin..=new_end) {
            doomed.push(sb);
            if se > new_end {
                new_end = se;
            }
        }
        for key in doomed {
            self.ranges.remove(&key);
        }

        self.ranges.insert(new_begin, new_end);
        true
    }

    /// True when `[begin, end)` is entirely covered.
    pub fn contains(&self, begin: u64, end: u64) -> bool {
        if begin >= end {
            return true;
        }
        match self.ranges.range(..=begin).next_back() {
            Some((_, &pe)) => pe >= end,
            None => false,
        }
    }

    /// The gaps of this set within `[0, bound)`, in ascending order.
    pub fn complement_up_to(&self, bound: u64) -> Vec<Fragment> {
        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for (&b, &e) in &self.ranges {
            if b >= bound {
                break;
            }
            if b > cursor {
                gaps.push(Fragment::new(cursor, b));
            }
            cursor = cursor.max(e);
        }
        if cursor < bound {
            gaps.push(Fragment::new(cursor, bound));
        }
        gaps
    }

    /// Sub-ranges of `self` within `[0, bound)` that are not covered by
    /// `known`, capped at `max` fragments.  This is the claim list for one
    /// report segment: everything received that the peer does not yet know
    /// about.  Returns `(claims, truncated)` where `truncated` signals that
    /// `max` cut the enumeration short and another report is needed.
    pub fn fragments_needing_claim(
        &self,
        known: &FragmentSet,
        bound: u64,
        max: usize,
    ) -> (Vec<Fragment>, bool) {
        let mut claims = Vec::new();
        for frag in self.iter() {
            if frag.begin >= bound {
                break;
            }
            let end = frag.end.min(bound);
            // walk the unknown parts of [frag.begin, end)
            let mut cursor = frag.begin;
            let mut known_iter = known
                .ranges
                .range(..end)
                .filter(move |&(_, &ke)| ke > frag.begin)
                .map(|(&kb, &ke)| (kb, ke))
                .collect::<Vec<_>>()
                .into_iter();
            let mut next_known = known_iter.next();
            while cursor < end {
                match next_known {
                    Some((kb, ke)) if kb <= cursor => {
                        cursor = cursor.max(ke);
                        next_known = known_iter.next();
                    },
                    Some((kb, _)) if kb < end => {
                        if claims.len() == max {
                            return (claims, true);
                        }
                        claims.push(Fragment::new(cursor, kb));
                        cursor = kb;
                    },
                    _ => {
                        if claims.len() == max {
                            return (claims, true);
                        }
                        claims.push(Fragment::new(cursor, end));
                        cursor = end;
                    },
                }
            }
        }
        (claims, false)
    }
}
