//! Approximate nearest-person lookup over the cluster tree.

use std::cmp::Ordering;
use std::collections::HashMap;

use super::tree::{ClusterTree, Member};
use crate::db::ROOT_CLUSTER_ID;
use crate::error::RecognitionResult;
use crate::models::Embedding;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersonHit {
    pub person_id: i64,
    pub distance: f64,
}

fn by_distance<T>(a: &(T, f64), b: &(T, f64)) -> Ordering {
    a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal)
}

/// Walk the tree level by level keeping the `beam` closest members, until
/// only patterns are left. Returns (pattern id, distance), closest first;
/// ties keep tree order.
pub fn beam_search(tree: &ClusterTree, query: &Embedding, beam: usize) -> RecognitionResult<Vec<(i64, f64)>> {
    let mut frontier: Vec<(Member, f64)> = vec![(Member::Cluster(ROOT_CLUSTER_ID), 0.0)];
    while frontier.iter().any(|(m, _)| matches!(m, Member::Cluster(_))) {
        let mut next = Vec::with_capacity(frontier.len() * 4);
        for (member, d) in frontier {
            match member {
                Member::Pattern(_) => next.push((member, d)),
                Member::Cluster(c) => {
                    for child in tree.pool(c)? {
                        if let Some(e) = tree.member_embedding(child) {
                            next.push((child, e.distance(query)));
                        }
                    }
                }
            }
        }
        next.sort_by(by_distance);
        next.truncate(beam);
        frontier = next;
    }
    Ok(frontier
        .into_iter()
        .filter_map(|(m, d)| match m {
            Member::Pattern(p) => Some((p, d)),
            Member::Cluster(_) => None,
        })
        .collect())
}

/// Per-person best distance across several query patterns, in first-seen
/// order so equal distances keep tree order.
#[derive(Debug, Clone)]
pub struct PeopleRanking {
    owner_id: i64,
    person_id: i64,
    order: Vec<(i64, f64)>,
    slot: HashMap<i64, usize>,
}

impl PeopleRanking {
    /// Results skip everyone owned by `owner_id` and `person_id` itself.
    pub fn new(owner_id: i64, person_id: i64) -> Self {
        Self { owner_id, person_id, order: Vec::new(), slot: HashMap::new() }
    }

    pub fn add_pattern(&mut self, tree: &ClusterTree, query: &Embedding, beam: usize) -> RecognitionResult<()> {
        for (pattern, d) in beam_search(tree, query, beam)? {
            let Some(leaf) = tree.leaf(pattern) else { continue };
            if leaf.owner_id == self.owner_id || leaf.person_id == self.person_id {
                continue;
            }
            match self.slot.get(&leaf.person_id) {
                Some(&k) => {
                    if d < self.order[k].1 {
                        self.order[k].1 = d;
                    }
                }
                None => {
                    self.slot.insert(leaf.person_id, self.order.len());
                    self.order.push((leaf.person_id, d));
                }
            }
        }
        Ok(())
    }

    pub fn finish(mut self, limit: usize) -> Vec<PersonHit> {
        self.order.sort_by(by_distance);
        self.order.truncate(limit);
        self.order
            .into_iter()
            .map(|(person_id, distance)| PersonHit { person_id, distance })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tree::{PatternLeaf, TreeSettings};
    use crate::models::EMBEDDING_DIM;

    fn emb(x: f64) -> Embedding {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = x;
        Embedding::new(v).unwrap()
    }

    fn nearest_people(
        tree: &ClusterTree,
        queries: &[&Embedding],
        owner_id: i64,
        person_id: i64,
        limit: usize,
        beam: usize,
    ) -> RecognitionResult<Vec<PersonHit>> {
        let mut ranking = PeopleRanking::new(owner_id, person_id);
        for q in queries {
            ranking.add_pattern(tree, q, beam)?;
        }
        Ok(ranking.finish(limit))
    }

    fn line_tree(n: i64, limit: usize) -> ClusterTree {
        let mut tree = ClusterTree::new(TreeSettings {
            cluster_limit: limit,
            minimal_cluster_to_recalculate: 8,
            unregistered_relevant_limit: 0.25,
        });
        for i in 0..n {
            // person i + 1 owned by user 100 + i
            tree.insert(PatternLeaf::new(i + 1, i + 1, 100 + i, emb(i as f64 / 32.0))).unwrap();
        }
        tree
    }

    #[test]
    fn ordered_by_distance_ties_by_insertion() {
        let tree = line_tree(50, 100);
        let q = emb(0.5);
        let hits = nearest_people(&tree, &[&q], 1, 0, 20, 60).unwrap();
        assert_eq!(hits.len(), 20);
        // 0.5 is pattern 17 (16/32); then 16 before 18 (both 1/32 away)
        let ids: Vec<i64> = hits.iter().map(|h| h.person_id).collect();
        assert_eq!(&ids[..5], &[17, 16, 18, 15, 19]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn excludes_owner_and_query_person() {
        let tree = line_tree(10, 100);
        let q = emb(0.0);
        let hits = nearest_people(&tree, &[&q], 100, 2, 20, 60).unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.person_id).collect();
        assert!(!ids.contains(&1));
        assert!(!ids.contains(&2));
        assert_eq!(ids[0], 3);
    }

    #[test]
    fn descends_into_subclusters() {
        let tree = line_tree(40, 8);
        assert!(tree.nodes().count() > 1);
        let q = emb(20.0 / 32.0);
        let first = nearest_people(&tree, &[&q], 1, 0, 5, 15).unwrap();
        let second = nearest_people(&tree, &[&q], 1, 0, 5, 15).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].person_id, 21);
    }

    #[test]
    fn best_distance_across_patterns_wins() {
        let tree = line_tree(5, 100);
        let (a, b) = (emb(0.0), emb(4.0 / 32.0));
        let hits = nearest_people(&tree, &[&a, &b], 1, 0, 20, 60).unwrap();
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[1].distance, 0.0);
        let mut first_two: Vec<i64> = hits[..2].iter().map(|h| h.person_id).collect();
        first_two.sort();
        assert_eq!(first_two, vec![1, 5]);
    }
}
