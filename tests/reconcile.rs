mod common;

use common::{face, TestEnv};
use nazr_recognition::db::query;
use nazr_recognition::error::RecognitionError;
use nazr_recognition::models::{Stage, StoredPerson};
use nazr_recognition::pipeline::AlbumStatus;
use serde_json::json;

/// Run an album of one-face photos through review with every face as its
/// own person. Returns the status after grouping.
fn review_as_separate_people(env: &TestEnv, album: i64, slugs: &[&str]) -> AlbumStatus {
    env.recognizer.start(album).unwrap();
    let frames: serde_json::Map<String, serde_json::Value> =
        slugs.iter().map(|s| (s.to_string(), json!([]))).collect();
    env.recognizer.submit(album, 2, &json!(frames)).unwrap();
    let patterns: serde_json::Map<String, serde_json::Value> =
        (1..=slugs.len()).map(|i| (format!("pattern_{}", i), json!([]))).collect();
    env.recognizer.submit(album, 4, &json!(patterns)).unwrap();
    let groups: Vec<Vec<String>> = (1..=slugs.len()).map(|i| vec![format!("pattern_{}", i)]).collect();
    env.recognizer.submit(album, 5, &json!(groups)).unwrap()
}

fn persons(env: &TestEnv, owner: i64) -> Vec<StoredPerson> {
    env.with_conn(|c| query::owner_persons(c, owner, None).unwrap())
}

#[test]
fn confirmed_match_merges_into_existing_pattern() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let first = env.album(alice, "First");
    env.photo(first, "cm1", vec![face(0.0)]);
    env.recognizer.start(first).unwrap();
    let known = persons(&env, alice)[0].id;

    let second = env.album(alice, "Second");
    env.photo(second, "cm2", vec![face(0.2)]);
    let status = env.recognizer.start(second).unwrap();
    assert_eq!(status.current_stage, Some(Stage::Reconcile.as_i64()));
    assert_eq!(status.status.as_deref(), Some("completed"));
    let staged = env.state(second).person(1).unwrap().unwrap();
    assert_eq!(staged.tech_pair, Some(known));
    assert_eq!(staged.real_pair, None);

    let status = env
        .recognizer
        .submit(second, 7, &json!({"pair_1": ["person_1", known]}))
        .unwrap();
    assert_eq!(status.finished.as_deref(), Some("1"));

    let people = persons(&env, alice);
    assert_eq!(people.len(), 1);
    assert_eq!(people[0].id, known);
    assert_eq!(people[0].patterns.len(), 1);
    let pattern = &people[0].patterns[0];
    assert_eq!(pattern.faces.len(), 2);
    let central = pattern.central_face().unwrap();
    assert!(pattern.faces.iter().any(|f| f.id == central.id));
    assert_eq!(env.ctx().index.read(|t| t.leaves().count()), 1);
    env.ctx().index.check_invariants().unwrap();
}

#[test]
fn person_ref_form_is_accepted_for_existing_people() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let first = env.album(alice, "First");
    env.photo(first, "pr1", vec![face(0.0)]);
    env.recognizer.start(first).unwrap();
    let known = persons(&env, alice)[0].id;

    let second = env.album(alice, "Second");
    env.photo(second, "pr2", vec![face(0.1)]);
    env.recognizer.start(second).unwrap();
    let status = env
        .recognizer
        .submit(second, 7, &json!({"pair_1": ["person_1", format!("person_{}", known)]}))
        .unwrap();
    assert_eq!(status.finished.as_deref(), Some("1"));
    assert_eq!(persons(&env, alice).len(), 1);
}

#[test]
fn only_suggested_pairs_can_be_confirmed() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let first = env.album(alice, "First");
    env.photo(first, "sg1", vec![face(0.0)]);
    env.recognizer.start(first).unwrap();
    let known = persons(&env, alice)[0].id;

    let second = env.album(alice, "Second");
    env.photo(second, "sg2", vec![face(0.2)]);
    env.recognizer.start(second).unwrap();

    for payload in [
        json!({"pair_1": ["person_1", known + 100]}),
        json!({"pair_1": ["person_2", known]}),
        json!({"match_1": ["person_1", known]}),
    ] {
        let err = env.recognizer.submit(second, 7, &payload).unwrap_err();
        assert!(matches!(err, RecognitionError::InputValidation { .. }), "{:?}", err);
    }
    assert_eq!(env.state(second).current_stage().unwrap(), Some(Stage::Reconcile));
}

#[test]
fn rejected_suggestion_leads_to_manual_match_then_new_person() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let first = env.album(alice, "First");
    env.photo(first, "rj1", vec![face(0.0)]);
    env.recognizer.start(first).unwrap();

    let second = env.album(alice, "Second");
    env.photo(second, "rj2", vec![face(0.2)]);
    env.recognizer.start(second).unwrap();

    let status = env.recognizer.submit(second, 7, &json!({})).unwrap();
    assert_eq!(status.current_stage, Some(Stage::VerifyMatches.as_i64()));

    let status = env.recognizer.submit(second, 8, &json!({})).unwrap();
    assert_eq!(status.finished.as_deref(), Some("1"));

    let mut names: Vec<String> = persons(&env, alice).into_iter().map(|p| p.name).collect();
    names.sort();
    assert_eq!(names, vec!["First__1__alice".to_string(), "Second__1__alice".to_string()]);
}

#[test]
fn manual_match_adds_a_new_pattern_to_the_chosen_person() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let first = env.album(alice, "First");
    env.photo(first, "mm1", vec![face(0.0)]);
    env.photo(first, "mm2", vec![face(10.0)]);
    let status = review_as_separate_people(&env, first, &["mm1", "mm2"]);
    assert_eq!(status.finished.as_deref(), Some("1"));
    let known = persons(&env, alice);
    assert_eq!(known.len(), 2);
    let (x, y) = (known[0].id, known[1].id);

    let second = env.album(alice, "Second");
    env.photo(second, "mm3", vec![face(0.1)]);
    env.photo(second, "mm4", vec![face(20.0)]);
    let status = review_as_separate_people(&env, second, &["mm3", "mm4"]);
    assert_eq!(status.current_stage, Some(Stage::Reconcile.as_i64()));
    let state = env.state(second);
    assert_eq!(state.person(1).unwrap().unwrap().tech_pair, Some(x));
    assert_eq!(state.person(2).unwrap().unwrap().tech_pair, None);

    let status = env
        .recognizer
        .submit(second, 7, &json!({"pair_1": ["person_1", x]}))
        .unwrap();
    assert_eq!(status.current_stage, Some(Stage::VerifyMatches.as_i64()));

    // person_1 is already taken, and so is x.
    let err = env
        .recognizer
        .submit(second, 8, &json!({"m": ["person_1", y]}))
        .unwrap_err();
    assert!(matches!(err, RecognitionError::InputValidation { .. }));
    let err = env
        .recognizer
        .submit(second, 8, &json!({"m": ["person_2", x]}))
        .unwrap_err();
    assert!(matches!(err, RecognitionError::InputValidation { .. }));

    let status = env
        .recognizer
        .submit(second, 8, &json!({"m": ["person_2", y]}))
        .unwrap();
    assert_eq!(status.finished.as_deref(), Some("1"));

    let people = persons(&env, alice);
    assert_eq!(people.len(), 2);
    let px = people.iter().find(|p| p.id == x).unwrap();
    let py = people.iter().find(|p| p.id == y).unwrap();
    assert_eq!(px.patterns.len(), 1);
    assert_eq!(px.patterns[0].faces.len(), 2);
    assert_eq!(py.patterns.len(), 2);
    assert_eq!(env.count("faces"), 4);
    assert_eq!(env.ctx().index.read(|t| t.leaves().count()), 3);
    env.ctx().index.check_invariants().unwrap();
}

#[test]
fn no_match_skips_review_of_matches() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let first = env.album(alice, "First");
    env.photo(first, "nm1", vec![face(0.0)]);
    env.recognizer.start(first).unwrap();

    let second = env.album(alice, "Second");
    env.photo(second, "nm2", vec![face(30.0)]);
    let status = env.recognizer.start(second).unwrap();
    assert_eq!(status.finished.as_deref(), Some("1"));
    assert_eq!(persons(&env, alice).len(), 2);
}

#[test]
fn other_owners_people_are_never_matched() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let bob = env.user("bob");
    let bobs = env.album(bob, "Bob's");
    env.photo(bobs, "oo1", vec![face(0.0)]);
    env.recognizer.start(bobs).unwrap();

    let alices = env.album(alice, "Alice's");
    env.photo(alices, "oo2", vec![face(0.0)]);
    let status = env.recognizer.start(alices).unwrap();
    assert_eq!(status.finished.as_deref(), Some("1"));
    assert_eq!(persons(&env, alice).len(), 1);
    assert_eq!(persons(&env, bob).len(), 1);
}
