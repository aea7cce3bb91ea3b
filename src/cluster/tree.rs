//! Arena form of the cluster tree. Clusters and pattern leaves are addressed
//! by their durable ids; children are kept in id order, the same order a
//! reload from the database produces.

use std::collections::{BTreeMap, BTreeSet};

use crate::db::query::{ClusterRow, PatternLeafRow};
use crate::db::ROOT_CLUSTER_ID;
use crate::error::{RecognitionError, RecognitionResult};
use crate::models::Embedding;
use crate::pipeline::matching::medoid_index;
use crate::utils::config::RecognitionSettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeSettings {
    pub cluster_limit: usize,
    pub minimal_cluster_to_recalculate: usize,
    pub unregistered_relevant_limit: f64,
}

impl From<&RecognitionSettings> for TreeSettings {
    fn from(s: &RecognitionSettings) -> Self {
        Self {
            cluster_limit: s.cluster_limit,
            minimal_cluster_to_recalculate: s.minimal_cluster_to_recalculate,
            unregistered_relevant_limit: s.unregistered_patterns_relevant_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Member {
    Cluster(i64),
    Pattern(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterNode {
    pub id: i64,
    pub parent: Option<i64>,
    /// Pattern id of the subtree medoid at the last recalculation.
    pub center: Option<i64>,
    pub not_recalc_patt_del: i64,
    pub child_clusters: Vec<i64>,
    pub child_patterns: Vec<i64>,
}

impl ClusterNode {
    fn new(id: i64, parent: Option<i64>) -> Self {
        Self {
            id,
            parent,
            center: None,
            not_recalc_patt_del: 0,
            child_clusters: Vec::new(),
            child_patterns: Vec::new(),
        }
    }

    pub fn pool_len(&self) -> usize {
        self.child_clusters.len() + self.child_patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool_len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternLeaf {
    pub id: i64,
    pub person_id: i64,
    pub owner_id: i64,
    pub cluster: i64,
    pub registered: bool,
    /// Encoding of the pattern's central face.
    pub center: Embedding,
}

impl PatternLeaf {
    pub fn new(id: i64, person_id: i64, owner_id: i64, center: Embedding) -> Self {
        Self { id, person_id, owner_id, cluster: ROOT_CLUSTER_ID, registered: false, center }
    }
}

impl From<PatternLeafRow> for PatternLeaf {
    fn from(r: PatternLeafRow) -> Self {
        Self {
            id: r.id,
            person_id: r.person_id,
            owner_id: r.owner_id,
            cluster: r.cluster_id,
            registered: r.registered,
            center: r.center,
        }
    }
}

/// Rows touched since the last flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    pub clusters: BTreeSet<i64>,
    pub removed_clusters: BTreeSet<i64>,
    pub patterns: BTreeSet<i64>,
    pub removed_patterns: BTreeSet<i64>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
            && self.removed_clusters.is_empty()
            && self.patterns.is_empty()
            && self.removed_patterns.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ClusterTree {
    settings: TreeSettings,
    nodes: BTreeMap<i64, ClusterNode>,
    leaves: BTreeMap<i64, PatternLeaf>,
    next_cluster_id: i64,
    changes: Changes,
}

fn invariant(msg: impl Into<String>) -> RecognitionError {
    RecognitionError::InvariantViolation(msg.into())
}

fn insert_sorted(list: &mut Vec<i64>, id: i64) {
    if let Err(at) = list.binary_search(&id) {
        list.insert(at, id);
    }
}

impl ClusterTree {
    pub fn new(settings: TreeSettings) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_CLUSTER_ID, ClusterNode::new(ROOT_CLUSTER_ID, None));
        Self {
            settings,
            nodes,
            leaves: BTreeMap::new(),
            next_cluster_id: ROOT_CLUSTER_ID + 1,
            changes: Changes::default(),
        }
    }

    /// Rebuild from durable rows.
    pub fn from_rows(
        settings: TreeSettings,
        clusters: Vec<ClusterRow>,
        leaves: Vec<PatternLeafRow>,
    ) -> RecognitionResult<Self> {
        let mut tree = Self::new(settings);
        for (id, parent, center, not_recalc) in &clusters {
            let node = tree.nodes.entry(*id).or_insert_with(|| ClusterNode::new(*id, *parent));
            node.parent = *parent;
            node.center = *center;
            node.not_recalc_patt_del = *not_recalc;
            tree.next_cluster_id = tree.next_cluster_id.max(id + 1);
        }
        for (id, parent, _, _) in &clusters {
            if *id == ROOT_CLUSTER_ID {
                if parent.is_some() {
                    return Err(invariant("root cluster has a parent"));
                }
                continue;
            }
            let parent = parent.ok_or_else(|| invariant(format!("cluster {} has no parent", id)))?;
            tree.nodes
                .get_mut(&parent)
                .ok_or_else(|| invariant(format!("cluster {} points at missing parent {}", id, parent)))?
                .child_clusters
                .push(*id);
        }
        for node in tree.nodes.values_mut() {
            node.child_clusters.sort_unstable();
        }
        for row in leaves {
            let leaf = PatternLeaf::from(row);
            tree.nodes
                .get_mut(&leaf.cluster)
                .ok_or_else(|| invariant(format!("pattern {} points at missing cluster {}", leaf.id, leaf.cluster)))?
                .child_patterns
                .push(leaf.id);
            tree.leaves.insert(leaf.id, leaf);
        }
        for node in tree.nodes.values_mut() {
            node.child_patterns.sort_unstable();
        }
        Ok(tree)
    }

    pub fn settings(&self) -> &TreeSettings {
        &self.settings
    }

    pub fn node(&self, id: i64) -> RecognitionResult<&ClusterNode> {
        self.nodes.get(&id).ok_or_else(|| invariant(format!("cluster {} missing", id)))
    }

    fn node_mut(&mut self, id: i64) -> RecognitionResult<&mut ClusterNode> {
        self.nodes.get_mut(&id).ok_or_else(|| invariant(format!("cluster {} missing", id)))
    }

    pub fn root(&self) -> RecognitionResult<&ClusterNode> {
        self.node(ROOT_CLUSTER_ID)
    }

    pub fn leaf(&self, pattern_id: i64) -> Option<&PatternLeaf> {
        self.leaves.get(&pattern_id)
    }

    pub fn contains(&self, pattern_id: i64) -> bool {
        self.leaves.contains_key(&pattern_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &PatternLeaf> {
        self.leaves.values()
    }

    pub fn take_changes(&mut self) -> Changes {
        std::mem::take(&mut self.changes)
    }

    /// Encoding a pool member is compared by: a pattern's central face, or
    /// the central face of a child cluster's center pattern.
    pub fn member_embedding(&self, member: Member) -> Option<&Embedding> {
        match member {
            Member::Pattern(p) => self.leaves.get(&p).map(|l| &l.center),
            Member::Cluster(c) => {
                let center = self.nodes.get(&c)?.center?;
                self.leaves.get(&center).map(|l| &l.center)
            }
        }
    }

    /// Direct children, clusters first, each group in id order.
    pub fn pool(&self, cluster_id: i64) -> RecognitionResult<Vec<Member>> {
        let node = self.node(cluster_id)?;
        Ok(node
            .child_clusters
            .iter()
            .map(|c| Member::Cluster(*c))
            .chain(node.child_patterns.iter().map(|p| Member::Pattern(*p)))
            .collect())
    }

    /// Number of patterns anywhere below `cluster_id`.
    pub fn subtree_size(&self, cluster_id: i64) -> RecognitionResult<usize> {
        let mut total = 0;
        let mut stack = vec![cluster_id];
        while let Some(id) = stack.pop() {
            let node = self.node(id)?;
            total += node.child_patterns.len();
            stack.extend(node.child_clusters.iter().copied());
        }
        Ok(total)
    }

    fn subtree_contains(&self, cluster_id: i64, pattern_id: i64) -> bool {
        let mut current = self.leaves.get(&pattern_id).map(|l| l.cluster);
        while let Some(id) = current {
            if id == cluster_id {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// The root may fill up to the limit before it subdivides; any other
    /// cluster must stay strictly below it after the attach.
    fn has_room(&self, node: &ClusterNode) -> bool {
        match node.parent {
            None => node.pool_len() < self.settings.cluster_limit,
            Some(_) => node.pool_len() + 1 < self.settings.cluster_limit,
        }
    }

    fn nearest_member(&self, cluster_id: i64, target: &Embedding) -> RecognitionResult<Option<Member>> {
        let mut best: Option<(Member, f64)> = None;
        for member in self.pool(cluster_id)? {
            let Some(e) = self.member_embedding(member) else { continue };
            let d = e.distance(target);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((member, d));
            }
        }
        Ok(best.map(|(m, _)| m))
    }

    fn alloc_cluster(&mut self, parent: i64) -> i64 {
        let id = self.next_cluster_id;
        self.next_cluster_id += 1;
        self.nodes.insert(id, ClusterNode::new(id, Some(parent)));
        self.changes.clusters.insert(id);
        id
    }

    fn mark_pattern(&mut self, pattern_id: i64, cluster: i64, registered: bool) {
        if let Some(leaf) = self.leaves.get_mut(&pattern_id) {
            leaf.cluster = cluster;
            leaf.registered = registered;
            self.changes.patterns.insert(pattern_id);
        }
    }

    /// Replace child pattern `q` of `parent` with a new cluster holding `q`.
    fn wrap_pattern(&mut self, parent: i64, q: i64) -> RecognitionResult<i64> {
        let child = self.alloc_cluster(parent);
        {
            let node = self.node_mut(parent)?;
            node.child_patterns.retain(|p| *p != q);
            insert_sorted(&mut node.child_clusters, child);
        }
        {
            let node = self.node_mut(child)?;
            node.center = Some(q);
            node.child_patterns.push(q);
        }
        self.mark_pattern(q, child, false);
        Ok(child)
    }

    /// Place a pattern in the tree; returns the cluster it landed in.
    pub fn insert(&mut self, mut leaf: PatternLeaf) -> RecognitionResult<i64> {
        if self.leaves.contains_key(&leaf.id) {
            return Err(invariant(format!("pattern {} is already indexed", leaf.id)));
        }
        let mut current = ROOT_CLUSTER_ID;
        let mut split_at = None;
        while !self.has_room(self.node(current)?) {
            match self.nearest_member(current, &leaf.center)? {
                Some(Member::Cluster(c)) => current = c,
                Some(Member::Pattern(q)) => {
                    split_at = Some(current);
                    current = self.wrap_pattern(current, q)?;
                    break;
                }
                None => return Err(invariant(format!("cluster {} is full but has no comparable member", current))),
            }
        }

        leaf.cluster = current;
        leaf.registered = false;
        let id = leaf.id;
        self.leaves.insert(id, leaf);
        insert_sorted(&mut self.node_mut(current)?.child_patterns, id);
        self.changes.patterns.insert(id);
        self.changes.removed_patterns.remove(&id);

        self.recalculate(current, true)?;
        if let Some(parent) = split_at {
            self.recalculate(parent, false)?;
        }
        Ok(current)
    }

    /// Drop a pattern and restructure its cluster by the first rule that applies.
    pub fn remove(&mut self, pattern_id: i64) -> RecognitionResult<()> {
        let leaf = self
            .leaves
            .remove(&pattern_id)
            .ok_or_else(|| RecognitionError::NotFound(format!("pattern {} in cluster index", pattern_id)))?;
        self.changes.patterns.remove(&pattern_id);
        self.changes.removed_patterns.insert(pattern_id);
        self.node_mut(leaf.cluster)?.child_patterns.retain(|p| *p != pattern_id);

        let survivor = self.restructure_after_delete(leaf.cluster, pattern_id)?;

        // Any ancestor still centered on the removed pattern needs a fresh center.
        let mut current = Some(survivor);
        while let Some(id) = current {
            let node = self.node(id)?;
            let parent = node.parent;
            if node.center == Some(pattern_id) {
                self.recalculate(id, false)?;
            }
            current = parent;
        }
        Ok(())
    }

    fn restructure_after_delete(&mut self, c: i64, deleted: i64) -> RecognitionResult<i64> {
        let limit = self.settings.cluster_limit;
        let (parent, c_pool, has_clusters, n_patterns) = {
            let n = self.node(c)?;
            (n.parent, n.pool_len(), !n.child_clusters.is_empty(), n.child_patterns.len())
        };

        // 1. fold C into its parent when both fit
        if let Some(p) = parent {
            if self.node(p)?.pool_len() + c_pool < limit {
                self.dissolve_into(c, p)?;
                self.recalculate_after_delete(p, deleted)?;
                return Ok(p);
            }
        }

        // 2. absorb the smallest child cluster
        let smallest = {
            let n = self.node(c)?;
            let mut best: Option<(usize, i64)> = None;
            for d in &n.child_clusters {
                let size = self.node(*d)?.pool_len();
                if best.map_or(true, |(s, _)| size < s) {
                    best = Some((size, *d));
                }
            }
            best
        };
        if let Some((d_pool, d)) = smallest {
            if d_pool + c_pool < limit {
                self.dissolve_into(d, c)?;
                self.recalculate_after_delete(c, deleted)?;
                return Ok(c);
            }
        }

        if let Some(p) = parent {
            // 3. a lone remaining pattern moves up
            if !has_clusters && n_patterns == 1 {
                self.dissolve_into(c, p)?;
                self.recalculate_after_delete(p, deleted)?;
                return Ok(p);
            }
            // a non-root cluster never stays empty
            if c_pool == 0 {
                self.dissolve_into(c, p)?;
                self.recalculate_after_delete(p, deleted)?;
                return Ok(p);
            }
        } else if c_pool == 0 {
            // 4. empty root
            let node = self.node_mut(c)?;
            node.not_recalc_patt_del = 0;
            node.center = None;
            self.changes.clusters.insert(c);
            return Ok(c);
        }

        // 5. plain deletion
        self.node_mut(c)?.not_recalc_patt_del += 1;
        self.changes.clusters.insert(c);
        self.recalculate_after_delete(c, deleted)?;
        Ok(c)
    }

    fn recalculate_after_delete(&mut self, cluster_id: i64, deleted: i64) -> RecognitionResult<()> {
        let need_check = self.node(cluster_id)?.center != Some(deleted);
        self.recalculate(cluster_id, need_check)
    }

    /// Move every child of `from` into its parent `to` and delete `from`.
    fn dissolve_into(&mut self, from: i64, to: i64) -> RecognitionResult<()> {
        let node = self
            .nodes
            .remove(&from)
            .ok_or_else(|| invariant(format!("cluster {} missing", from)))?;
        if node.parent != Some(to) {
            return Err(invariant(format!("cluster {} is not a child of {}", from, to)));
        }
        for p in &node.child_patterns {
            self.mark_pattern(*p, to, false);
        }
        for c in &node.child_clusters {
            self.node_mut(*c)?.parent = Some(to);
            self.changes.clusters.insert(*c);
        }
        let target = self.node_mut(to)?;
        target.child_clusters.retain(|c| *c != from);
        for c in &node.child_clusters {
            insert_sorted(&mut target.child_clusters, *c);
        }
        for p in &node.child_patterns {
            insert_sorted(&mut target.child_patterns, *p);
        }
        target.not_recalc_patt_del += node.child_clusters.len() as i64;
        self.changes.clusters.insert(to);
        self.changes.clusters.remove(&from);
        self.changes.removed_clusters.insert(from);
        Ok(())
    }

    fn recalculation_due(&self, cluster_id: i64) -> RecognitionResult<bool> {
        let node = self.node(cluster_id)?;
        if node.center.is_none() {
            return Ok(true);
        }
        let size = self.subtree_size(cluster_id)?;
        if size <= self.settings.minimal_cluster_to_recalculate {
            return Ok(false);
        }
        let unregistered = node
            .child_patterns
            .iter()
            .filter(|p| self.leaves.get(*p).map_or(false, |l| !l.registered))
            .count();
        let share = (unregistered as f64 + node.not_recalc_patt_del as f64) / size as f64;
        Ok(share >= self.settings.unregistered_relevant_limit)
    }

    /// Recompute the center of `cluster_id`. With `need_check` the guard
    /// decides whether the work is worth it. A changed center propagates to
    /// the parent unconditionally.
    pub fn recalculate(&mut self, cluster_id: i64, need_check: bool) -> RecognitionResult<()> {
        let mut current = Some(cluster_id);
        let mut check = need_check;
        while let Some(id) = current {
            if check && !self.recalculation_due(id)? {
                return Ok(());
            }
            let new_center = {
                let node = self.node(id)?;
                let mut ids = Vec::with_capacity(node.pool_len());
                let mut faces = Vec::with_capacity(node.pool_len());
                for p in &node.child_patterns {
                    let leaf = self
                        .leaves
                        .get(p)
                        .ok_or_else(|| invariant(format!("cluster {} lists missing pattern {}", id, p)))?;
                    ids.push(*p);
                    faces.push(&leaf.center);
                }
                for c in &node.child_clusters {
                    let Some(center) = self.node(*c)?.center else { continue };
                    let Some(leaf) = self.leaves.get(&center) else { continue };
                    ids.push(center);
                    faces.push(&leaf.center);
                }
                medoid_index(&faces).map(|i| ids[i])
            };

            let node = self.node_mut(id)?;
            let changed = node.center != new_center;
            node.center = new_center;
            node.not_recalc_patt_del = 0;
            let parent = node.parent;
            let patterns = node.child_patterns.clone();
            self.changes.clusters.insert(id);
            for p in patterns {
                if let Some(leaf) = self.leaves.get_mut(&p) {
                    if !leaf.registered {
                        leaf.registered = true;
                        self.changes.patterns.insert(p);
                    }
                }
            }

            current = if changed { parent } else { None };
            check = false;
        }
        Ok(())
    }

    /// The pattern's central face changed.
    pub fn update_center(&mut self, pattern_id: i64, center: Embedding) -> RecognitionResult<()> {
        let leaf = self
            .leaves
            .get_mut(&pattern_id)
            .ok_or_else(|| RecognitionError::NotFound(format!("pattern {} in cluster index", pattern_id)))?;
        leaf.center = center;
        leaf.registered = false;
        let cluster = leaf.cluster;
        self.changes.patterns.insert(pattern_id);
        self.recalculate(cluster, true)
    }

    /// Structural checks: parent links, fan-out, centers inside their subtree.
    pub fn check_invariants(&self) -> RecognitionResult<()> {
        let limit = self.settings.cluster_limit;
        let root = self.root()?;
        if root.parent.is_some() {
            return Err(invariant("root cluster has a parent"));
        }
        for node in self.nodes.values() {
            if node.id != ROOT_CLUSTER_ID {
                let parent = node
                    .parent
                    .ok_or_else(|| invariant(format!("cluster {} has no parent", node.id)))?;
                if !self.node(parent)?.child_clusters.contains(&node.id) {
                    return Err(invariant(format!("cluster {} not listed by parent {}", node.id, parent)));
                }
                if node.pool_len() >= limit {
                    return Err(invariant(format!(
                        "cluster {} has {} children, limit is {}",
                        node.id,
                        node.pool_len(),
                        limit
                    )));
                }
                if node.is_empty() {
                    return Err(invariant(format!("cluster {} is empty", node.id)));
                }
            }
            for p in &node.child_patterns {
                match self.leaves.get(p) {
                    Some(l) if l.cluster == node.id => {}
                    _ => return Err(invariant(format!("pattern {} misfiled under cluster {}", p, node.id))),
                }
            }
            let subtree = self.subtree_size(node.id)?;
            match node.center {
                Some(c) if !self.subtree_contains(node.id, c) => {
                    return Err(invariant(format!("cluster {} centered on foreign pattern {}", node.id, c)));
                }
                None if subtree > 0 => {
                    return Err(invariant(format!("cluster {} has no center", node.id)));
                }
                _ => {}
            }
        }
        for leaf in self.leaves.values() {
            if !self.node(leaf.cluster)?.child_patterns.contains(&leaf.id) {
                return Err(invariant(format!("pattern {} not listed by cluster {}", leaf.id, leaf.cluster)));
            }
        }
        Ok(())
    }

    /// Pattern -> cluster and cluster -> (parent, center) maps.
    pub fn assignments(&self) -> (BTreeMap<i64, i64>, BTreeMap<i64, (Option<i64>, Option<i64>)>) {
        let patterns = self.leaves.values().map(|l| (l.id, l.cluster)).collect();
        let clusters = self.nodes.values().map(|n| (n.id, (n.parent, n.center))).collect();
        (patterns, clusters)
    }
}
