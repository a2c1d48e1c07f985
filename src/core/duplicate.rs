// Duplicate detection and similarity grouping:
// - Exact duplicates share a content hash
// - Near duplicates are connected components of the "fingerprints within
//   threshold" graph, built with union-find
//
// The near-duplicate scan compares every pair, O(n^2). That is fine for tens of
// thousands of fingerprints; larger collections need bucketing (e.g. by fingerprint
// prefix / multi-index hashing) before the pairwise pass.

use crate::core::perceptual::Fingerprint;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactDuplicateGroup {
    pub content_hash: String,
    pub identifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub identifier: String,
    /// Hamming distance from the cluster seed
    pub distance: u32,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearDuplicateCluster {
    pub seed: String,
    /// Seed first, then by distance and identifier
    pub members: Vec<ClusterMember>,
    pub average_distance: f64,
}

impl NearDuplicateCluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.identifier.as_str()).collect()
    }
}

/// Disjoint-set forest over `0..n`, stored as flat arrays.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Root of `x`'s set. Iterative, compresses the whole path.
    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }

        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Merge the sets of `a` and `b`. Returns false if they were already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
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
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }

    pub fn connected(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }
}

/// Group identifiers sharing a content hash. Groups of one are dropped.
/// Ordered by size (desc) then hash (asc); identifiers within a group are sorted.
pub fn group_exact_duplicates<I>(entries: I) -> Vec<ExactDuplicateGroup>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut by_hash: HashMap<String, Vec<String>> = HashMap::new();
    for (identifier, hash) in entries {
        by_hash.entry(hash).or_default().push(identifier);
    }

    let mut groups: Vec<ExactDuplicateGroup> = by_hash
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(content_hash, mut identifiers)| {
            identifiers.sort();
            identifiers.dedup();
            ExactDuplicateGroup {
                content_hash,
                identifiers,
            }
        })
        .filter(|g| g.identifiers.len() > 1)
        .collect();

    groups.sort_by(|a, b| {
        b.identifiers
            .len()
            .cmp(&a.identifiers.len())
            .then_with(|| a.content_hash.cmp(&b.content_hash))
    });
    groups
}

/// Cluster fingerprints whose Hamming distance is within `threshold`.
///
/// Output does not depend on input order.
pub fn cluster_fingerprints(
    entries: &[(String, Fingerprint)],
    threshold: u32,
) -> Vec<NearDuplicateCluster> {
    let mut sorted: Vec<&(String, Fingerprint)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted.dedup_by(|a, b| a.0 == b.0);

    let n = sorted.len();
    let sorted_ref = &sorted;
    let matching_pairs: Vec<(usize, usize)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| {
            (i + 1..n).filter_map(move |j| {
                if sorted_ref[i].1.distance(&sorted_ref[j].1) <= threshold {
                    Some((i, j))
                } else {
                    None
                }
            })
        })
        .collect();

    let mut sets = UnionFind::new(n);
    for (i, j) in matching_pairs {
        sets.union(i, j);
    }

    // Indices are in identifier order, so the first member of each component is its seed
    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = sets.find(i);
        components.entry(root).or_default().push(i);
    }

    let mut clusters: Vec<NearDuplicateCluster> = components
        .into_values()
        .filter(|indices| indices.len() > 1)
        .map(|indices| {
            let (seed_id, seed_fp) = sorted[indices[0]];
            let mut members: Vec<ClusterMember> = indices
                .iter()
                .map(|&i| {
                    let (identifier, fingerprint) = sorted[i];
                    let distance = seed_fp.distance(fingerprint);
                    ClusterMember {
                        identifier: identifier.clone(),
                        distance,
                        confidence: confidence(distance, threshold),
                    }
                })
                .collect();
            members.sort_by(|a, b| {
                (a.identifier != *seed_id)
                    .cmp(&(b.identifier != *seed_id))
                    .then(a.distance.cmp(&b.distance))
                    .then_with(|| a.identifier.cmp(&b.identifier))
            });

            let others = members.len() - 1;
            let total: u32 = members.iter().map(|m| m.distance).sum();
            NearDuplicateCluster {
                seed: seed_id.clone(),
                members,
                average_distance: total as f64 / others as f64,
            }
        })
        .collect();

    clusters.sort_by(|a, b| {
        b.members
            .len()
            .cmp(&a.members.len())
            .then(a.average_distance.total_cmp(&b.average_distance))
            .then_with(|| a.seed.cmp(&b.seed))
    });
    clusters
}

/// `max(0, 1 - distance / threshold)`; a zero threshold only admits exact matches.
pub fn confidence(distance: u32, threshold: u32) -> f64 {
    if threshold == 0 {
        return if distance == 0 { 1.0 } else { 0.0 };
    }
    (1.0 - distance as f64 / threshold as f64).max(0.0)
}
