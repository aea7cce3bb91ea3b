//! Global cluster index over patterns. The tree lives in memory behind a
//! mutex and every mutation is written through to the `clusters` and
//! `patterns` tables on the caller's connection (usually inside the
//! caller's transaction). Lock order: database connection first, then the
//! index.

pub mod search;
pub mod tree;

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::db::{query, writer};
use crate::error::RecognitionResult;
use crate::models::Embedding;
use crate::utils::config::RecognitionSettings;

pub use search::PersonHit;
pub use tree::{ClusterNode, ClusterTree, Member, PatternLeaf, TreeSettings};

pub struct ClusterIndex {
    settings: TreeSettings,
    tree: Mutex<ClusterTree>,
}

impl std::fmt::Debug for ClusterIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.tree.lock();
        f.debug_struct("ClusterIndex")
            .field("clusters", &tree.nodes().count())
            .field("patterns", &tree.leaves().count())
            .finish()
    }
}

fn flush(tree: &mut ClusterTree, conn: &Connection) -> Result<()> {
    let changes = tree.take_changes();
    for id in &changes.removed_clusters {
        writer::delete_cluster_row(conn, *id)?;
    }
    for id in &changes.clusters {
        if let Ok(n) = tree.node(*id) {
            writer::upsert_cluster(conn, n.id, n.parent, n.center, n.not_recalc_patt_del)?;
        }
    }
    for id in &changes.patterns {
        if let Some(l) = tree.leaf(*id) {
            writer::set_pattern_cluster(conn, l.id, Some(l.cluster), l.registered)?;
        }
    }
    for id in &changes.removed_patterns {
        writer::set_pattern_cluster(conn, *id, None, false)?;
    }
    debug!(
        "cluster index flushed: {} clusters, {} removed, {} patterns",
        changes.clusters.len(),
        changes.removed_clusters.len(),
        changes.patterns.len() + changes.removed_patterns.len()
    );
    Ok(())
}

impl ClusterIndex {
    /// Empty index with only the root.
    pub fn new(settings: &RecognitionSettings) -> Self {
        let settings = TreeSettings::from(settings);
        Self { settings, tree: Mutex::new(ClusterTree::new(settings)) }
    }

    pub fn load(conn: &Connection, settings: &RecognitionSettings) -> Result<Self> {
        let index = Self::new(settings);
        index.reload(conn)?;
        Ok(index)
    }

    /// Replace the in-memory tree with what the database holds. Used at
    /// startup and after a rolled back mutation.
    pub fn reload(&self, conn: &Connection) -> Result<()> {
        let clusters = query::load_clusters(conn)?;
        let leaves = query::load_pattern_leaves(conn)?;
        let fresh = ClusterTree::from_rows(self.settings, clusters, leaves)?;
        *self.tree.lock() = fresh;
        Ok(())
    }

    fn mutate<T>(
        &self,
        conn: &Connection,
        op: impl FnOnce(&mut ClusterTree) -> RecognitionResult<T>,
    ) -> RecognitionResult<T> {
        let mut tree = self.tree.lock();
        let out = match op(&mut *tree) {
            Ok(v) => v,
            Err(e) => {
                // The tree may be half updated; callers roll back and reload.
                warn!("cluster index operation failed: {}", e);
                tree.take_changes();
                return Err(e);
            }
        };
        flush(&mut *tree, conn)?;
        Ok(out)
    }

    /// Place a pattern; returns the cluster it landed in.
    pub fn insert(&self, conn: &Connection, leaf: PatternLeaf) -> RecognitionResult<i64> {
        let id = leaf.id;
        let cluster = self.mutate(conn, |t| t.insert(leaf))?;
        debug!("pattern {} indexed under cluster {}", id, cluster);
        Ok(cluster)
    }

    pub fn remove(&self, conn: &Connection, pattern_id: i64) -> RecognitionResult<()> {
        self.mutate(conn, |t| t.remove(pattern_id))?;
        debug!("pattern {} removed from cluster index", pattern_id);
        Ok(())
    }

    pub fn update_center(&self, conn: &Connection, pattern_id: i64, center: Embedding) -> RecognitionResult<()> {
        self.mutate(conn, |t| t.update_center(pattern_id, center))
    }

    pub fn contains(&self, pattern_id: i64) -> bool {
        self.tree.lock().contains(pattern_id)
    }

    /// Run `f` against the tree under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&ClusterTree) -> R) -> R {
        f(&*self.tree.lock())
    }

    pub fn check_invariants(&self) -> RecognitionResult<()> {
        self.tree.lock().check_invariants()
    }
}
