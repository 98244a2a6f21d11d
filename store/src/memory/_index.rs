// Quad indexes over term indices.
//
// Every quad is stored four times, in the SPOG, POSG, OSPG and GSPO orderings,
// so that any pattern with at least one bound position is answered by a range scan.

use std::collections::{btree_set::Range, BTreeSet};

/// Term index used for the default graph in the graph position.
pub const DEFAULT_GRAPH: usize = usize::MAX;

pub trait RangeN {
    fn range1(&self, k1: usize) -> Range<'_, [usize; 4]>;
    fn range2(&self, k1: usize, k2: usize) -> Range<'_, [usize; 4]>;
    fn range3(&self, k1: usize, k2: usize, k3: usize) -> Range<'_, [usize; 4]>;
}

impl RangeN for BTreeSet<[usize; 4]> {
    fn range1(&self, k1: usize) -> Range<'_, [usize; 4]> {
        self.range([k1, 0, 0, 0]..=[k1, usize::MAX, usize::MAX, usize::MAX])
    }

    fn range2(&self, k1: usize, k2: usize) -> Range<'_, [usize; 4]> {
        self.range([k1, k2, 0, 0]..=[k1, k2, usize::MAX, usize::MAX])
    }

    fn range3(&self, k1: usize, k2: usize, k3: usize) -> Range<'_, [usize; 4]> {
        self.range([k1, k2, k3, 0]..=[k1, k2, k3, usize::MAX])
    }
}

#[derive(Clone, Debug, Default)]
pub struct QuadIndex {
    spog: BTreeSet<[usize; 4]>,
    posg: BTreeSet<[usize; 4]>,
    ospg: BTreeSet<[usize; 4]>,
    gspo: BTreeSet<[usize; 4]>,
}

impl QuadIndex {
    pub fn len(&self) -> usize {
        self.spog.len()
    }

    pub fn contains(&self, q: &[usize; 4]) -> bool {
        self.spog.contains(q)
    }

    pub fn insert(&mut self, [s, p, o, g]: [usize; 4]) -> bool {
        self.spog.insert([s, p, o, g]) && {
            self.posg.insert([p, o, s, g]);
            self.ospg.insert([o, s, p, g]);
            self.gspo.insert([g, s, p, o]);
            true
        }
    }

    pub fn remove(&mut self, [s, p, o, g]: [usize; 4]) -> bool {
        self.spog.remove(&[s, p, o, g]) && {
            self.posg.remove(&[p, o, s, g]);
            self.ospg.remove(&[o, s, p, g]);
            self.gspo.remove(&[g, s, p, o]);
            true
        }
    }

    /// All distinct graph keys, in index order.
    pub fn graphs(&self) -> Vec<usize> {
        let mut ret = vec![];
        let mut next = Some(0);
        while let Some(start) = next {
            match self.gspo.range([start, 0, 0, 0]..).next() {
                Some(&[g, ..]) => {
                    ret.push(g);
                    next = g.checked_add(1);
                }
                None => next = None,
            }
        }
        ret
    }

    /// Quads (in SPOG order) matching the given bound positions.
    pub fn matching(&self, [s, p, o, g]: [Option<usize>; 4]) -> Vec<[usize; 4]> {
        let keep = move |q: &[usize; 4]| {
            s.map(|s| s == q[0]).unwrap_or(true)
                && p.map(|p| p == q[1]).unwrap_or(true)
                && o.map(|o| o == q[2]).unwrap_or(true)
                && g.map(|g| g == q[3]).unwrap_or(true)
        };
        match (s, p, o, g) {
            (Some(s), Some(p), Some(o), Some(g)) => {
                let q = [s, p, o, g];
                if self.spog.contains(&q) {
                    vec![q]
                } else {
                    vec![]
                }
            }
            (Some(s), Some(p), Some(o), None) => self.spog.range3(s, p, o).copied().collect(),
            (Some(s), Some(p), None, _) => self
                .spog
                .range2(s, p)
                .copied()
                .filter(keep)
                .collect(),
            (Some(s), None, Some(o), _) => self
                .ospg
                .range2(o, s)
                .map(|&[o, s, p, g]| [s, p, o, g])
                .filter(keep)
                .collect(),
            (Some(s), None, None, Some(g)) => self
                .gspo
                .range2(g, s)
                .map(|&[g, s, p, o]| [s, p, o, g])
                .collect(),
            (Some(s), None, None, None) => self.spog.range1(s).copied().collect(),
            (None, Some(p), Some(o), _) => self
                .posg
                .range2(p, o)
                .map(|&[p, o, s, g]| [s, p, o, g])
                .filter(keep)
                .collect(),
            (None, Some(p), None, _) => self
                .posg
                .range1(p)
                .map(|&[p, o, s, g]| [s, p, o, g])
                .filter(keep)
                .collect(),
            (None, None, Some(o), _) => self
                .ospg
                .range1(o)
                .map(|&[o, s, p, g]| [s, p, o, g])
                .filter(keep)
                .collect(),
            (None, None, None, Some(g)) => self
                .gspo
                .range1(g)
                .map(|&[g, s, p, o]| [s, p, o, g])
                .collect(),
            (None, None, None, None) => self.spog.iter().copied().collect(),
        }
    }
}
