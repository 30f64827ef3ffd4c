//! Scored entity sets, the values bound to plan variables.

use ahash::AHashMap;
use roaring::RoaringBitmap;

/// Entity ordinals with a score each. Membership lives in a bitmap so set
/// algebra stays cheap on large universes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSet {
    members: RoaringBitmap,
    scores: AHashMap<u32, f32>,
}

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every member of `members` with the same score.
    pub fn uniform(members: &RoaringBitmap, score: f32) -> Self {
        Self {
            members: members.clone(),
            scores: members.iter().map(|o| (o, score)).collect(),
        }
    }

    /// Inserts `ordinal`, keeping the higher score if already present.
    pub fn insert(&mut self, ordinal: u32, score: f32) {
        self.members.insert(ordinal);
        self.scores
            .entry(ordinal)
            .and_modify(|s| *s = s.max(score))
            .or_insert(score);
    }

    pub fn len(&self) -> usize {
        self.members.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, ordinal: u32) -> bool {
        self.members.contains(ordinal)
    }

    pub fn score(&self, ordinal: u32) -> Option<f32> {
        self.scores.get(&ordinal).copied()
    }

    pub fn members(&self) -> &RoaringBitmap {
        &self.members
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        self.members
            .iter()
            .map(|o| (o, self.scores.get(&o).copied().unwrap_or(0.0)))
    }

    /// Intersection; the combined score is the lower of the two.
    pub fn and(&self, other: &MatchSet) -> MatchSet {
        let members = &self.members & &other.members;
        let scores = members
            .iter()
            .map(|o| {
                let a = self.score(o).unwrap_or(0.0);
                let b = other.score(o).unwrap_or(0.0);
                (o, a.min(b))
            })
            .collect();
        MatchSet { members, scores }
    }

    /// Union; duplicates keep the higher score.
    pub fn or(&self, other: &MatchSet) -> MatchSet {
        let mut out = self.clone();
        for (o, s) in other.iter() {
            out.insert(o, s);
        }
        out
    }

    /// Members of `universe` not in `self`, each scored 1.0.
    pub fn complement(&self, universe: &RoaringBitmap) -> MatchSet {
        MatchSet::uniform(&(universe - &self.members), 1.0)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(u32) -> bool) {
        let dropped: Vec<u32> = self.members.iter().filter(|o| !keep(*o)).collect();
        for o in dropped {
            self.members.remove(o);
            self.scores.remove(&o);
        }
    }

    /// Members by descending score, ties by ordinal.
    pub fn ranked(&self) -> Vec<(u32, f32)> {
        let mut out: Vec<(u32, f32)> = self.iter().collect();
        out.sort_by(|(ia, sa), (ib, sb)| sb.total_cmp(sa).then_with(|| ia.cmp(ib)));
        out
    }

    /// Highest-ranked member.
    pub fn best(&self) -> Option<(u32, f32)> {
        self.ranked().into_iter().next()
    }

    /// The `k` best members.
    pub fn top(&self, k: usize) -> MatchSet {
        self.ranked().into_iter().take(k).collect()
    }
}

impl FromIterator<(u32, f32)> for MatchSet {
    fn from_iter<I: IntoIterator<Item = (u32, f32)>>(iter: I) -> Self {
        let mut out = MatchSet::new();
        for (o, s) in iter {
            out.insert(o, s);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[(u32, f32)]) -> MatchSet {
        items.iter().copied().collect()
    }

    #[test]
    fn and_takes_min_and_or_takes_max() {
        let a = set(&[(1, 0.9), (2, 0.4)]);
        let b = set(&[(2, 0.8), (3, 0.7)]);
        let both = a.and(&b);
        assert_eq!(both.ranked(), vec![(2, 0.4)]);
        let either = a.or(&b);
        assert_eq!(either.ranked(), vec![(1, 0.9), (2, 0.8), (3, 0.7)]);
    }

    #[test]
    fn complement_within_universe() {
        let a = set(&[(1, 0.5)]);
        let universe: RoaringBitmap = [0u32, 1, 2].into_iter().collect();
        let rest = a.complement(&universe);
        assert_eq!(rest.ranked(), vec![(0, 1.0), (2, 1.0)]);
    }

    #[test]
    fn ranking_is_stable_on_ties() {
        let a = set(&[(5, 0.5), (3, 0.5), (9, 0.7)]);
        assert_eq!(a.ranked(), vec![(9, 0.7), (3, 0.5), (5, 0.5)]);
        assert_eq!(a.top(2).len(), 2);
        assert_eq!(a.best(), Some((9, 0.7)));
    }

    #[test]
    fn retain_drops_scores_too() {
        let mut a = set(&[(1, 0.1), (2, 0.2)]);
        a.retain(|o| o == 2);
        assert_eq!(a.len(), 1);
        assert_eq!(a.score(1), None);
    }
}
