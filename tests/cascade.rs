mod common;

use common::{emb, face, TestEnv};
use nazr_recognition::db::{query, writer};
use nazr_recognition::error::RecognitionError;
use nazr_recognition::models::Bbox;
use nazr_recognition::pipeline::cascade;

/// One person whose single pattern holds faces at 0.0, 0.1 and 0.2.
fn three_face_person(env: &TestEnv) -> (i64, i64, Vec<i64>) {
    let alice = env.user("alice");
    let album = env.album(alice, "Cascade");
    let photo = env.photo(album, "cs1", vec![]);
    let (person, pattern) = env.seed_person(alice, photo, "trio", emb(0.0));
    let ctx = env.ctx();
    let conn = ctx.db.lock();
    let mut faces = query::pattern_faces(&conn, pattern).unwrap().iter().map(|f| f.id).collect::<Vec<_>>();
    for (i, x) in [0.1, 0.2].into_iter().enumerate() {
        let id = writer::insert_face(&conn, photo, i as i64 + 2, &Bbox::new(8, 40, 40, 8), &emb(x), pattern).unwrap();
        faces.push(id);
    }
    assert!(cascade::refresh_center(&ctx.index, &conn, pattern).unwrap());
    (person, pattern, faces)
}

fn central_of(env: &TestEnv, pattern: i64) -> Option<i64> {
    env.with_conn(|c| query::get_pattern(c, pattern).unwrap().unwrap().central_face_id)
}

#[test]
fn deleting_the_central_face_moves_the_center() {
    let env = TestEnv::new();
    let (_, pattern, faces) = three_face_person(&env);
    assert_eq!(central_of(&env, pattern), Some(faces[1]));
    assert_eq!(env.ctx().index.read(|t| t.leaf(pattern).unwrap().center.clone()), emb(0.1));

    env.recognizer.delete_face(faces[1]).unwrap();
    assert_eq!(central_of(&env, pattern), Some(faces[0]));
    assert_eq!(env.ctx().index.read(|t| t.leaf(pattern).unwrap().center.clone()), emb(0.0));
    env.ctx().index.check_invariants().unwrap();
}

#[test]
fn deleting_the_last_face_removes_pattern_and_person() {
    let env = TestEnv::new();
    let (person, pattern, faces) = three_face_person(&env);
    for id in &faces {
        env.recognizer.delete_face(*id).unwrap();
    }
    assert!(!env.ctx().index.contains(pattern));
    assert!(env.with_conn(|c| query::get_pattern(c, pattern).unwrap()).is_none());
    assert!(env.with_conn(|c| query::get_person(c, person).unwrap()).is_none());
    assert!(matches!(env.recognizer.delete_face(faces[0]), Err(RecognitionError::NotFound(_))));
}

#[test]
fn deleting_one_pattern_keeps_the_person() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let album = env.album(alice, "Two");
    let photo = env.photo(album, "tp1", vec![]);
    let (person, first) = env.seed_person(alice, photo, "two", emb(0.0));
    let second = env.seed_pattern(alice, person, photo, emb(3.0));

    env.recognizer.delete_pattern(first).unwrap();
    let stored = env.with_conn(|c| query::get_person(c, person).unwrap()).unwrap();
    assert_eq!(stored.patterns.iter().map(|p| p.id).collect::<Vec<_>>(), vec![second]);
    assert!(!env.ctx().index.contains(first));
    assert!(env.ctx().index.contains(second));
}

#[test]
fn deleting_a_person_clears_the_index() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let album = env.album(alice, "Gone");
    let photo = env.photo(album, "gp1", vec![]);
    let (person, first) = env.seed_person(alice, photo, "gone", emb(0.0));
    let second = env.seed_pattern(alice, person, photo, emb(3.0));
    let (other, _) = env.seed_person(alice, photo, "stays", emb(9.0));

    env.recognizer.delete_person(person).unwrap();
    assert!(!env.ctx().index.contains(first));
    assert!(!env.ctx().index.contains(second));
    assert_eq!(env.count("patterns"), 1);
    assert_eq!(env.count("faces"), 1);
    assert!(env.with_conn(|c| query::get_person(c, other).unwrap()).is_some());
    env.ctx().index.check_invariants().unwrap();

    assert!(matches!(env.recognizer.delete_person(person), Err(RecognitionError::NotFound(_))));
}

#[test]
fn deleting_a_photo_takes_its_faces() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let album = env.album(alice, "Photos");
    let keep = env.photo(album, "dp1", vec![]);
    let drop = env.photo(album, "dp2", vec![]);
    let (person, _) = env.seed_person(alice, keep, "kept", emb(0.0));
    let doomed = env.seed_pattern(alice, person, drop, emb(2.0));

    assert_eq!(env.recognizer.delete_photo(drop).unwrap(), 1);
    assert!(!env.ctx().index.contains(doomed));
    assert_eq!(env.count("photos"), 1);
    assert_eq!(env.count("faces"), 1);
    assert!(matches!(env.recognizer.delete_photo(drop), Err(RecognitionError::NotFound(_))));
}

#[test]
fn making_a_photo_private_removes_recognized_faces() {
    let env = TestEnv::new();
    let alice = env.user("alice");
    let album = env.album(alice, "Private");
    let photo = env.photo(album, "mp1", vec![face(0.0)]);
    env.recognizer.start(album).unwrap();
    assert_eq!(env.count("faces"), 1);

    assert_eq!(env.recognizer.set_photo_private(photo, true).unwrap(), 1);
    assert!(env.with_conn(|c| query::get_photo(c, photo).unwrap()).unwrap().is_private);
    assert_eq!(env.count("faces"), 0);
    assert_eq!(env.count("patterns"), 0);
    assert_eq!(env.count("persons"), 0);
    assert_eq!(env.ctx().index.read(|t| t.leaves().count()), 0);
    env.ctx().index.check_invariants().unwrap();

    assert_eq!(env.recognizer.set_photo_private(photo, false).unwrap(), 0);
    assert_eq!(env.count("faces"), 0);
    assert!(matches!(env.recognizer.set_photo_private(999, true), Err(RecognitionError::NotFound(_))));
}
