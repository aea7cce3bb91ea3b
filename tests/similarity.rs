mod common;

use common::{emb, TestEnv};
use nazr_recognition::error::RecognitionError;
use nazr_recognition::pipeline::SearchStatus;
use nazr_recognition::staging::StagingStore;

#[test]
fn closest_people_of_other_owners_ties_by_insertion() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let bob = env.user("bob");
    let alices = env.album(alice, "Alice");
    let bobs = env.album(bob, "Bob");
    let ap = env.photo(alices, "sa1", vec![]);
    let bp = env.photo(bobs, "sb1", vec![]);

    let mut line = Vec::new();
    for i in 0..50 {
        let (person, _) = env.seed_person(bob, bp, &format!("line{}", i), emb(i as f64 / 32.0));
        line.push(person);
    }
    let (query, _) = env.seed_person(alice, ap, "query", emb(0.5));
    // Same owner, same spot: never a result.
    env.seed_person(alice, ap, "twin", emb(0.5));

    let mut expected = vec![line[16]];
    for k in 1..=9 {
        expected.push(line[16 - k]);
        expected.push(line[16 + k]);
    }
    expected.push(line[6]);

    match env.recognizer.search(query).unwrap() {
        SearchStatus::Done { people } => assert_eq!(people, expected),
        other => panic!("search not finished: {:?}", other),
    }
    // Served from the staging store the second time.
    assert_eq!(env.recognizer.search(query).unwrap(), SearchStatus::Done { people: expected });
}

#[test]
fn every_pattern_of_the_person_counts() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let bob = env.user("bob");
    let alices = env.album(alice, "Alice");
    let bobs = env.album(bob, "Bob");
    let ap = env.photo(alices, "sm1", vec![]);
    let bp = env.photo(bobs, "sm2", vec![]);

    let (near_first, _) = env.seed_person(bob, bp, "near first", emb(0.05));
    let (far, _) = env.seed_person(bob, bp, "far", emb(5.0));
    let (near_second, _) = env.seed_person(bob, bp, "near second", emb(0.9));

    let (query, _) = env.seed_person(alice, ap, "query", emb(0.0));
    env.seed_pattern(alice, query, ap, emb(1.0));

    assert_eq!(
        env.recognizer.search(query).unwrap(),
        SearchStatus::Done { people: vec![near_first, near_second, far] }
    );
    let processed = env
        .staging
        .get_i64(&format!("person_{}_processed_patterns_amount", query))
        .unwrap();
    assert_eq!(processed, Some(2));
}

#[test]
fn results_are_capped() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let bob = env.user("bob");
    let ap = env.photo(env.album(alice, "A"), "sc1", vec![]);
    let bp = env.photo(env.album(bob, "B"), "sc2", vec![]);
    for i in 0..30 {
        env.seed_person(bob, bp, &format!("b{}", i), emb(i as f64));
    }
    let (query, _) = env.seed_person(alice, ap, "query", emb(0.0));
    match env.recognizer.search(query).unwrap() {
        SearchStatus::Done { people } => assert_eq!(people.len(), env.ctx().settings.search_people_limit),
        other => panic!("search not finished: {:?}", other),
    }
}

#[test]
fn lonely_owner_finds_nobody() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let ap = env.photo(env.album(alice, "A"), "sl1", vec![]);
    let (query, _) = env.seed_person(alice, ap, "query", emb(0.0));
    env.seed_person(alice, ap, "sibling", emb(0.1));
    assert_eq!(env.recognizer.search(query).unwrap(), SearchStatus::Done { people: vec![] });
}

#[test]
fn unknown_person_is_not_found() {
    let env = TestEnv::new();
    assert!(matches!(env.recognizer.search(77), Err(RecognitionError::NotFound(_))));
}
