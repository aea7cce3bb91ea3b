mod common;

use common::{emb, emb2, TestEnv};
use nazr_recognition::cluster::{ClusterIndex, PatternLeaf};
use nazr_recognition::db::{query, writer, ROOT_CLUSTER_ID};
use nazr_recognition::error::RecognitionError;
use nazr_recognition::models::Bbox;
use nazr_recognition::utils::config::RecognitionSettings;

fn small_tree() -> TestEnv {
    TestEnv::with_settings(RecognitionSettings { cluster_limit: 5, ..Default::default() })
}

fn assert_reload_matches(env: &TestEnv) {
    let live = env.ctx().index.read(|t| t.assignments());
    let reloaded = env.with_conn(|c| ClusterIndex::load(c, &env.ctx().settings).unwrap());
    reloaded.check_invariants().unwrap();
    assert_eq!(reloaded.read(|t| t.assignments()), live);
}

#[test]
fn full_root_wraps_the_nearest_pattern() {
    let env = small_tree();
    let alice = env.user("alice");
    let album = env.album(alice, "Tree");
    let photo = env.photo(album, "ct1", vec![]);

    let mut ids = Vec::new();
    for i in 0..5 {
        let (_, pattern) = env.seed_person(alice, photo, &format!("p{}", i), emb(i as f64 * 10.0));
        ids.push(pattern);
    }
    env.ctx().index.read(|t| {
        let root = t.root().unwrap();
        assert_eq!(root.child_patterns.len(), 5);
        assert!(root.child_clusters.is_empty());
    });

    let (_, newcomer) = env.seed_person(alice, photo, "near p1", emb(10.5));
    let cluster = env.ctx().index.read(|t| t.leaf(newcomer).unwrap().cluster);
    assert_ne!(cluster, ROOT_CLUSTER_ID);
    env.ctx().index.read(|t| {
        let node = t.node(cluster).unwrap();
        assert_eq!(node.parent, Some(ROOT_CLUSTER_ID));
        let mut members = node.child_patterns.clone();
        members.sort();
        assert_eq!(members, vec![ids[1], newcomer]);
        let root = t.root().unwrap();
        assert_eq!(root.child_clusters, vec![cluster]);
        assert_eq!(root.pool_len(), 5);
    });
    env.ctx().index.check_invariants().unwrap();

    let stored = env.with_conn(|c| query::get_pattern(c, newcomer).unwrap().unwrap());
    assert_eq!(stored.cluster_id, Some(cluster));
    assert_reload_matches(&env);
}

#[test]
fn tree_survives_inserts_and_deletes() {
    let env = small_tree();
    let alice = env.user("alice");
    let album = env.album(alice, "Churn");
    let photo = env.photo(album, "ch1", vec![]);

    let mut patterns = Vec::new();
    for i in 0..40 {
        let at = emb2(((i * 37) % 23) as f64, ((i * 11) % 7) as f64 * 2.5);
        let (_, pattern) = env.seed_person(alice, photo, &format!("c{}", i), at);
        patterns.push(pattern);
        env.ctx().index.check_invariants().unwrap();
    }
    assert_eq!(env.ctx().index.read(|t| t.leaves().count()), 40);
    assert_reload_matches(&env);

    for (n, pattern) in patterns.iter().enumerate() {
        if n % 3 == 0 {
            env.recognizer.delete_pattern(*pattern).unwrap();
            assert!(!env.ctx().index.contains(*pattern));
            env.ctx().index.check_invariants().unwrap();
        }
    }
    assert_eq!(env.ctx().index.read(|t| t.leaves().count()), 26);
    assert_reload_matches(&env);

    for i in 0..10 {
        env.seed_person(alice, photo, &format!("d{}", i), emb2(i as f64 * 1.7, 3.0));
        env.ctx().index.check_invariants().unwrap();
    }
    assert_reload_matches(&env);
}

#[test]
fn failed_transaction_restores_the_index() {
    let env = small_tree();
    let alice = env.user("alice");
    let album = env.album(alice, "Rollback");
    let photo = env.photo(album, "rb1", vec![]);
    for i in 0..7 {
        env.seed_person(alice, photo, &format!("r{}", i), emb(i as f64));
    }
    let before = env.ctx().index.read(|t| t.assignments());

    let ctx = env.ctx();
    let err = ctx
        .write_txn(|conn| {
            let person = writer::insert_person(conn, alice, "doomed")?;
            let pattern = writer::insert_pattern(conn, person)?;
            let at = emb(3.5);
            let face = writer::insert_face(conn, photo, 1, &Bbox::new(8, 40, 40, 8), &at, pattern)?;
            writer::set_pattern_central_face(conn, pattern, face)?;
            ctx.index.insert(conn, PatternLeaf::new(pattern, person, alice, at))?;
            Err::<(), _>(RecognitionError::InvariantViolation("abort".into()))
        })
        .unwrap_err();
    assert!(matches!(err, RecognitionError::InvariantViolation(_)));

    assert_eq!(env.ctx().index.read(|t| t.assignments()), before);
    assert_eq!(env.count("persons"), 7);
    assert_reload_matches(&env);
}

#[test]
fn unregistered_patterns_are_counted_per_cluster() {
    let env = small_tree();
    let alice = env.user("alice");
    let album = env.album(alice, "Count");
    let photo = env.photo(album, "cc1", vec![]);
    for i in 0..12 {
        env.seed_person(alice, photo, &format!("u{}", i), emb2((i % 4) as f64 * 20.0, (i / 4) as f64 * 0.2));
    }
    env.ctx().index.check_invariants().unwrap();
    let (total, clusters) = env.ctx().index.read(|t| {
        let total = t.subtree_size(ROOT_CLUSTER_ID).unwrap();
        (total, t.nodes().count())
    });
    assert_eq!(total, 12);
    assert!(clusters > 1);
}
