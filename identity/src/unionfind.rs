/// Disjoint-set forest over `0..n` with path compression and union by rank.
pub(crate) struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub(crate) fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Point every node on the path straight at the root.
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Merges the sets holding `a` and `b`. Returns false if they were
    /// already in the same set.
    pub(crate) fn union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singletons() {
        let mut set = DisjointSet::new(3);
        assert_ne!(set.find(0), set.find(1));
        assert_ne!(set.find(1), set.find(2));
    }

    #[test]
    fn union_is_transitive() {
        let mut set = DisjointSet::new(4);
        assert!(set.union(0, 1));
        assert!(set.union(1, 2));
        assert!(!set.union(0, 2));
        assert_eq!(set.find(0), set.find(2));
        assert_ne!(set.find(0), set.find(3));
    }

    #[test]
    fn long_chain_compresses() {
        let mut set = DisjointSet::new(1000);
        for i in 0..999 {
            set.union(i, i + 1);
        }
        let root = set.find(0);
        for i in 0..1000 {
            assert_eq!(set.find(i), root);
        }
    }
}
