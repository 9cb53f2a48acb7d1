//! Ordered set of replication ids.
//!
//! Stored as coalesced inclusive ranges, so the large contiguous runs typical
//! of queue contents cost one map entry each. The representation is
//! canonical: two sets holding the same ids compare equal.
use super::types::{ReplicationError, ReplicationResult};
use crate::core::ReplicationId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ReplicationIdSet {
    /// start -> end (inclusive); ranges neither overlap nor touch
    ranges: BTreeMap<ReplicationId, ReplicationId>,
}

impl ReplicationIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding every id in `start..=end`
    pub fn from_range(start: ReplicationId, end: ReplicationId) -> Self {
        let mut set = Self::new();
        set.insert_range(start, end);
        set
    }

    pub fn contains(&self, id: ReplicationId) -> bool {
        self.ranges
            .range(..=id)
            .next_back()
            .is_some_and(|(_, &end)| id <= end)
    }

    pub fn insert(&mut self, id: ReplicationId) {
        self.insert_range(id, id);
    }

    /// Add every id in `start..=end`. Empty ranges are ignored.
    pub fn insert_range(&mut self, start: ReplicationId, end: ReplicationId) {
        if start > end {
            return;
        }
        let (mut lo, mut hi) = (start, end);

        let before = self.ranges.range(..=lo).next_back().map(|(&s, &e)| (s, e));
        if let Some((s, e)) = before {
            if e.saturating_add(1) >= lo {
                lo = s;
                hi = hi.max(e);
                self.ranges.remove(&s);
            }
        }
        while let Some((s, e)) = self.ranges.range(lo..).next().map(|(&s, &e)| (s, e)) {
            if s > hi.saturating_add(1) {
                break;
            }
            hi = hi.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(lo, hi);
    }

    /// Remove `id`; no-op if absent
    pub fn remove(&mut self, id: ReplicationId) {
        self.remove_range(id, id);
    }

    /// Remove every id in `start..=end`
    pub fn remove_range(&mut self, start: ReplicationId, end: ReplicationId) {
        if start > end {
            return;
        }
        let overlapping: Vec<(ReplicationId, ReplicationId)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start - 1);
            }
            if e > end {
                self.ranges.insert(end + 1, e);
            }
        }
    }

    /// Ids in `self` and in `other`
    pub fn intersection(&self, other: &ReplicationIdSet) -> ReplicationIdSet {
        self - &(self - other)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Number of ids in the set
    pub fn len(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |n, (&s, &e)| n.saturating_add(e - s).saturating_add(1))
    }

    pub fn first(&self) -> Option<ReplicationId> {
        self.ranges.keys().next().copied()
    }

    pub fn last(&self) -> Option<ReplicationId> {
        self.ranges.values().next_back().copied()
    }

    /// Inclusive ranges in ascending order
    pub fn ranges(&self) -> impl Iterator<Item = (ReplicationId, ReplicationId)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    /// Ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = ReplicationId> + '_ {
        self.ranges.iter().flat_map(|(&s, &e)| s..=e)
    }

    /// Compact text form: `1-3,5,9-12`. The empty set encodes as "".
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(s: &str) -> ReplicationResult<Self> {
        s.parse()
    }
}

impl fmt::Display for ReplicationIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (s, e)) in self.ranges().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if s == e {
                write!(f, "{}", s)?;
            } else {
                write!(f, "{}-{}", s, e)?;
            }
        }
        Ok(())
    }
}

impl FromStr for ReplicationIdSet {
    type Err = ReplicationError;

    fn from_str(s: &str) -> ReplicationResult<Self> {
        let mut set = ReplicationIdSet::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(set);
        }

        let parse = |token: &str| {
            token
                .trim()
                .parse::<ReplicationId>()
                .map_err(|e| ReplicationError::InvalidIdSet(format!("{:?}: {}", token, e)))
        };
        for token in s.split(',') {
            match token.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse(start)?, parse(end)?);
                    if start > end {
                        return Err(ReplicationError::InvalidIdSet(format!(
                            "descending range {:?}",
                            token
                        )));
                    }
                    set.insert_range(start, end);
                }
                None => set.insert(parse(token)?),
            }
        }
        Ok(set)
    }
}

impl From<ReplicationIdSet> for String {
    fn from(set: ReplicationIdSet) -> String {
        set.encode()
    }
}

impl TryFrom<String> for ReplicationIdSet {
    type Error = ReplicationError;

    fn try_from(s: String) -> ReplicationResult<Self> {
        s.parse()
    }
}

impl FromIterator<ReplicationId> for ReplicationIdSet {
    fn from_iter<I: IntoIterator<Item = ReplicationId>>(iter: I) -> Self {
        let mut set = ReplicationIdSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<ReplicationId> for ReplicationIdSet {
    fn extend<I: IntoIterator<Item = ReplicationId>>(&mut self, iter: I) {
        for id in iter {
            self.insert(id);
        }
    }
}

impl Sub<&ReplicationIdSet> for &ReplicationIdSet {
    type Output = ReplicationIdSet;

    fn sub(self, rhs: &ReplicationIdSet) -> ReplicationIdSet {
        let mut result = self.clone();
        result -= rhs;
        result
    }
}

impl Add<&ReplicationIdSet> for &ReplicationIdSet {
    type Output = ReplicationIdSet;

    fn add(self, rhs: &ReplicationIdSet) -> ReplicationIdSet {
        let mut result = self.clone();
        result += rhs;
        result
    }
}

impl SubAssign<&ReplicationIdSet> for ReplicationIdSet {
    fn sub_assign(&mut self, rhs: &ReplicationIdSet) {
        for (s, e) in rhs.ranges() {
            if self.is_empty() {
                break;
            }
            self.remove_range(s, e);
        }
    }
}

impl AddAssign<&ReplicationIdSet> for ReplicationIdSet {
    fn add_assign(&mut self, rhs: &ReplicationIdSet) {
        for (s, e) in rhs.ranges() {
            self.insert_range(s, e);
        }
    }
}

impl SubAssign<ReplicationId> for ReplicationIdSet {
    fn sub_assign(&mut self, id: ReplicationId) {
        self.remove(id);
    }
}

impl AddAssign<ReplicationId> for ReplicationIdSet {
    fn add_assign(&mut self, id: ReplicationId) {
        self.insert(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(ids: &[ReplicationId]) -> ReplicationIdSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_add_coalesces_ranges() {
        let mut s = set(&[1, 2, 3, 7]);
        assert_eq!(s.ranges().collect::<Vec<_>>(), vec![(1, 3), (7, 7)]);

        s.insert(5);
        s.insert(6);
        assert_eq!(s.ranges().collect::<Vec<_>>(), vec![(1, 3), (5, 7)]);

        s.insert(4);
        assert_eq!(s.ranges().collect::<Vec<_>>(), vec![(1, 7)]);
        assert_eq!(s.len(), 7);
    }

    #[test]
    fn test_remove_splits_ranges() {
        let mut s = ReplicationIdSet::from_range(1, 10);
        s.remove(5);
        assert!(!s.contains(5));
        assert!(s.contains(4) && s.contains(6));
        assert_eq!(s.ranges().collect::<Vec<_>>(), vec![(1, 4), (6, 10)]);

        // Absent id is a no-op
        s.remove(42);
        assert_eq!(s.len(), 9);

        s.remove_range(3, 8);
        assert_eq!(s.ranges().collect::<Vec<_>>(), vec![(1, 2), (9, 10)]);
    }

    #[test]
    fn test_difference_and_union() {
        let primary = set(&[1, 2, 3, 5]);
        let backup = set(&[1, 2, 4]);

        assert_eq!(&backup - &primary, set(&[4]));
        assert_eq!(&primary - &backup, set(&[3, 5]));
        assert_eq!(&primary + &backup, ReplicationIdSet::from_range(1, 5));
        assert_eq!(primary.intersection(&backup), set(&[1, 2]));
    }

    #[test]
    fn test_operator_assign_forms() {
        let mut s = set(&[1, 2]);
        s += 3u64;
        s -= 1u64;
        assert_eq!(s, set(&[2, 3]));

        s += &set(&[10, 11]);
        s -= &set(&[3, 11]);
        assert_eq!(s, set(&[2, 10]));
    }

    #[test]
    fn test_encode_decode() {
        let s = set(&[1, 2, 3, 5, 9, 10, 11, 12]);
        assert_eq!(s.encode(), "1-3,5,9-12");
        assert_eq!(ReplicationIdSet::decode("1-3,5,9-12").unwrap(), s);
        assert_eq!(ReplicationIdSet::decode(" 5 , 1-3 ,9-12").unwrap(), s);

        assert_eq!(ReplicationIdSet::new().encode(), "");
        assert!(ReplicationIdSet::decode("").unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for bad in ["x", "1,,2", "5-3", "1-", "-1", "1-2-3"] {
            assert!(
                matches!(
                    ReplicationIdSet::decode(bad),
                    Err(ReplicationError::InvalidIdSet(_))
                ),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_serde_as_string() {
        let s = set(&[4, 5, 6]);
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"4-6\"");
        let back: ReplicationIdSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_extremes() {
        let mut s = ReplicationIdSet::from_range(u64::MAX - 1, u64::MAX);
        s.insert(0);
        assert!(s.contains(u64::MAX));
        assert_eq!(s.first(), Some(0));
        assert_eq!(s.last(), Some(u64::MAX));
        s.remove(u64::MAX);
        assert_eq!(s.encode(), format!("0,{}", u64::MAX - 1));
    }

    fn id_set_strategy() -> impl Strategy<Value = ReplicationIdSet> {
        prop::collection::vec(0u64..64, 0..40).prop_map(|ids| ids.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_difference_disjoint_from_rhs(a in id_set_strategy(), b in id_set_strategy()) {
            let d = &a - &b;
            prop_assert!(d.intersection(&b).is_empty());
            prop_assert!(d.iter().all(|id| a.contains(id) && !b.contains(id)));
        }

        #[test]
        fn prop_difference_and_intersection_cover(a in id_set_strategy(), b in id_set_strategy()) {
            let cover = &(&a - &b) + &a.intersection(&b);
            prop_assert_eq!(cover, a);
        }

        #[test]
        fn prop_encode_round_trips(a in id_set_strategy()) {
            prop_assert_eq!(ReplicationIdSet::decode(&a.encode()).unwrap(), a);
        }

        #[test]
        fn prop_matches_btreeset_model(ids in prop::collection::vec((any::<bool>(), 0u64..32), 0..60)) {
            let mut model = std::collections::BTreeSet::new();
            let mut s = ReplicationIdSet::new();
            for (insert, id) in ids {
                if insert {
                    model.insert(id);
                    s.insert(id);
                } else {
                    model.remove(&id);
                    s.remove(id);
                }
            }
            prop_assert_eq!(s.iter().collect::<Vec<_>>(), model.into_iter().collect::<Vec<_>>());
        }
    }
}
