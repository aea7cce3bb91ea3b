//! Validation of the payloads submitted for the user-driven stages. Nothing
//! here writes; handlers apply the returned intent.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{RecognitionError, RecognitionResult};
use crate::staging::keys;

static PATTERN_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^pattern_[1-9][0-9]*$").expect("failed to build regex"));
static FACE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^face_[1-9][0-9]*$").expect("failed to build regex"));
static PERSON_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^person_[1-9][0-9]*$").expect("failed to build regex"));
static PAIR_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^pair_[1-9][0-9]*$").expect("failed to build regex"));

/// Faces to drop per photo slug, 1-based.
pub type FrameRemovals = BTreeMap<String, BTreeSet<usize>>;

fn invalid(field: &str, message: impl Into<String>) -> RecognitionError {
    RecognitionError::invalid(field, message)
}

fn indexed(name: &str, re: &Regex, prefix: &str) -> Option<usize> {
    if !re.is_match(name) {
        return None;
    }
    keys::parse_indexed(name, prefix)
}

fn as_object<'a>(payload: &'a Value, field: &str) -> RecognitionResult<&'a serde_json::Map<String, Value>> {
    payload.as_object().ok_or_else(|| invalid(field, "expected a JSON object"))
}

/// VERIFY-FRAMES: `{slug: [face numbers the user unticked]}`. Keys must be
/// exactly the staged photos; `photos` pairs each slug with its face count.
pub fn frames(payload: &Value, photos: &[(String, usize)]) -> RecognitionResult<FrameRemovals> {
    let map = as_object(payload, "frames")?;
    let known: BTreeMap<&str, usize> = photos.iter().map(|(s, n)| (s.as_str(), *n)).collect();
    for key in map.keys() {
        if !known.contains_key(key.as_str()) {
            return Err(invalid(key, "unknown photo"));
        }
    }
    let mut out = FrameRemovals::new();
    for (slug, amount) in &known {
        let value = map.get(*slug).ok_or_else(|| invalid(slug, "missing photo"))?;
        let items = value.as_array().ok_or_else(|| invalid(slug, "expected a list of face numbers"))?;
        let mut marked = BTreeSet::new();
        for item in items {
            let n = item
                .as_u64()
                .filter(|n| *n >= 1 && *n as usize <= *amount)
                .ok_or_else(|| invalid(slug, format!("face number {} is not within 1..={}", item, amount)))?;
            marked.insert(n as usize);
        }
        out.insert(slug.to_string(), marked);
    }
    Ok(out)
}

/// VERIFY-PATTERNS: `{"pattern_<i>": [["face_<j>", ..], ..]}`. Returns, per
/// pattern in order, the groups to split off as 1-based face numbers.
/// `face_counts[i]` is the size of pattern `i + 1`.
pub fn pattern_splits(payload: &Value, face_counts: &[usize]) -> RecognitionResult<Vec<Vec<Vec<usize>>>> {
    let map = as_object(payload, "patterns")?;
    let mut out: Vec<Option<Vec<Vec<usize>>>> = vec![None; face_counts.len()];
    for (name, value) in map {
        let i = indexed(name, &PATTERN_NAME, "pattern").ok_or_else(|| invalid(name, "not a pattern name"))?;
        if i > face_counts.len() {
            return Err(invalid(name, format!("only {} patterns exist", face_counts.len())));
        }
        let count = face_counts[i - 1];
        let groups = value.as_array().ok_or_else(|| invalid(name, "expected a list of face lists"))?;
        let mut seen = BTreeSet::new();
        let mut parsed = Vec::with_capacity(groups.len());
        for group in groups {
            let faces = group
                .as_array()
                .filter(|g| !g.is_empty())
                .ok_or_else(|| invalid(name, "each marked group must be a non-empty list"))?;
            let mut members = Vec::with_capacity(faces.len());
            for face in faces {
                let j = face
                    .as_str()
                    .and_then(|s| indexed(s, &FACE_NAME, "face"))
                    .filter(|j| *j <= count)
                    .ok_or_else(|| invalid(name, format!("{} is not a face of this pattern", face)))?;
                if !seen.insert(j) {
                    return Err(invalid(name, format!("face_{} is marked twice", j)));
                }
                members.push(j);
            }
            parsed.push(members);
        }
        if seen.len() >= count && count > 0 {
            return Err(invalid(name, "at least one face must stay in the pattern"));
        }
        out[i - 1] = Some(parsed);
    }
    out.into_iter()
        .enumerate()
        .map(|(i, groups)| groups.ok_or_else(|| invalid(&keys::pattern(i + 1), "missing pattern")))
        .collect()
}

/// GROUP-PATTERNS: `[["pattern_<i>", ..], ..]`, a partition of every staged
/// pattern into persons. Returns 1-based pattern numbers per person.
pub fn groups(payload: &Value, pattern_count: usize) -> RecognitionResult<Vec<Vec<usize>>> {
    let lists = payload.as_array().ok_or_else(|| invalid("groups", "expected a list of pattern lists"))?;
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(lists.len());
    for (k, list) in lists.iter().enumerate() {
        let field = keys::person(k + 1);
        let names = list
            .as_array()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| invalid(&field, "each person needs a non-empty list of patterns"))?;
        let mut members = Vec::with_capacity(names.len());
        for name in names {
            let i = name
                .as_str()
                .and_then(|s| indexed(s, &PATTERN_NAME, "pattern"))
                .filter(|i| *i <= pattern_count)
                .ok_or_else(|| invalid(&field, format!("{} is not a staged pattern", name)))?;
            if !seen.insert(i) {
                return Err(invalid(&field, format!("pattern_{} is used twice", i)));
            }
            members.push(i);
        }
        out.push(members);
    }
    if let Some(missing) = (1..=pattern_count).find(|i| !seen.contains(i)) {
        return Err(invalid(&keys::pattern(missing), "pattern is not assigned to a person"));
    }
    Ok(out)
}

fn parse_pair(field: &str, value: &Value) -> RecognitionResult<(usize, i64)> {
    let items = value
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| invalid(field, "expected [\"person_<i>\", <person id>]"))?;
    let new = items[0]
        .as_str()
        .and_then(|s| indexed(s, &PERSON_NAME, "person"))
        .ok_or_else(|| invalid(field, format!("{} is not a new person name", items[0])))?;
    let existing = match &items[1] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok().or_else(|| keys::parse_person_ref(s)),
        _ => None,
    }
    .filter(|pk| *pk > 0)
    .ok_or_else(|| invalid(field, format!("{} is not a person id", items[1])))?;
    Ok((new, existing))
}

fn check_unique(field: &str, pairs: &[(usize, i64)], pair: (usize, i64)) -> RecognitionResult<()> {
    if pairs.iter().any(|(n, _)| *n == pair.0) {
        return Err(invalid(field, format!("person_{} is paired twice", pair.0)));
    }
    if pairs.iter().any(|(_, e)| *e == pair.1) {
        return Err(invalid(field, format!("person {} is paired twice", pair.1)));
    }
    Ok(())
}

/// VERIFY-MATCHES: `{"pair_<k>": ["person_<i>", <pk>]}`. Only suggested
/// pairs can be confirmed; `tech_pairs` maps new person number to its hint.
pub fn confirmed_matches(payload: &Value, tech_pairs: &BTreeMap<usize, i64>) -> RecognitionResult<Vec<(usize, i64)>> {
    let map = as_object(payload, "matches")?;
    let mut out = Vec::with_capacity(map.len());
    for (name, value) in map {
        if !PAIR_NAME.is_match(name) {
            return Err(invalid(name, "not a pair name"));
        }
        let pair = parse_pair(name, value)?;
        if tech_pairs.get(&pair.0) != Some(&pair.1) {
            return Err(invalid(name, format!("person_{} was not matched with person {}", pair.0, pair.1)));
        }
        check_unique(name, &out, pair)?;
        out.push(pair);
    }
    Ok(out)
}

/// MANUAL-MATCH: `{any: ["person_<i>", <pk>]}` between people neither side
/// has paired yet.
pub fn manual_matches(
    payload: &Value,
    unpaired_new: &BTreeSet<usize>,
    unpaired_existing: &BTreeSet<i64>,
) -> RecognitionResult<Vec<(usize, i64)>> {
    let map = as_object(payload, "matches")?;
    let mut out = Vec::with_capacity(map.len());
    for (name, value) in map {
        let pair = parse_pair(name, value)?;
        if !unpaired_new.contains(&pair.0) {
            return Err(invalid(name, format!("person_{} is not an unpaired new person", pair.0)));
        }
        if !unpaired_existing.contains(&pair.1) {
            return Err(invalid(name, format!("person {} is not an unpaired person of this owner", pair.1)));
        }
        check_unique(name, &out, pair)?;
        out.push(pair);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field_of(err: RecognitionError) -> String {
        match err {
            RecognitionError::InputValidation { field, .. } => field,
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn frames_require_exact_photo_set() {
        let photos = vec![("a".to_string(), 2), ("b".to_string(), 1)];
        let ok = frames(&json!({"a": [2, 2], "b": []}), &photos).unwrap();
        assert_eq!(ok["a"], BTreeSet::from([2]));
        assert!(ok["b"].is_empty());

        assert_eq!(field_of(frames(&json!({"a": []}), &photos).unwrap_err()), "b");
        assert_eq!(field_of(frames(&json!({"a": [], "b": [], "c": []}), &photos).unwrap_err()), "c");
        assert_eq!(field_of(frames(&json!({"a": [3], "b": []}), &photos).unwrap_err()), "a");
        assert_eq!(field_of(frames(&json!({"a": [0], "b": []}), &photos).unwrap_err()), "a");
    }

    #[test]
    fn pattern_splits_rules() {
        let counts = [2, 3];
        let ok = pattern_splits(&json!({"pattern_1": [["face_2"]], "pattern_2": []}), &counts).unwrap();
        assert_eq!(ok, vec![vec![vec![2]], vec![]]);

        let err = pattern_splits(&json!({"pattern_1": []}), &counts).unwrap_err();
        assert_eq!(field_of(err), "pattern_2");
        let err = pattern_splits(&json!({"pattern_1": [], "pattern_2": [], "pattern_3": []}), &counts).unwrap_err();
        assert_eq!(field_of(err), "pattern_3");
        let err = pattern_splits(&json!({"pattern_01": [], "pattern_2": []}), &counts).unwrap_err();
        assert_eq!(field_of(err), "pattern_01");
        // every face marked
        assert!(pattern_splits(&json!({"pattern_1": [["face_1"], ["face_2"]], "pattern_2": []}), &counts).is_err());
        // repeated face
        assert!(pattern_splits(&json!({"pattern_1": [], "pattern_2": [["face_1"], ["face_1"]]}), &counts).is_err());
        // empty sublist
        assert!(pattern_splits(&json!({"pattern_1": [[]], "pattern_2": []}), &counts).is_err());
        // out of range
        assert!(pattern_splits(&json!({"pattern_1": [["face_3"]], "pattern_2": []}), &counts).is_err());
    }

    #[test]
    fn groups_must_partition_patterns() {
        assert_eq!(
            groups(&json!([["pattern_2"], ["pattern_1", "pattern_3"]]), 3).unwrap(),
            vec![vec![2], vec![1, 3]]
        );
        assert_eq!(field_of(groups(&json!([["pattern_1"]]), 2).unwrap_err()), "pattern_2");
        assert!(groups(&json!([["pattern_1"], ["pattern_1", "pattern_2"]]), 2).is_err());
        assert!(groups(&json!([["pattern_1", "pattern_2"], []]), 2).is_err());
        assert!(groups(&json!([["pattern_3"]]), 2).is_err());
    }

    #[test]
    fn matches_follow_suggestions() {
        let tech = BTreeMap::from([(1, 40), (2, 41)]);
        let ok = confirmed_matches(&json!({"pair_1": ["person_1", 40], "pair_2": ["person_2", "41"]}), &tech).unwrap();
        assert_eq!(ok, vec![(1, 40), (2, 41)]);
        assert!(confirmed_matches(&json!({}), &tech).unwrap().is_empty());
        assert!(confirmed_matches(&json!({"pair_1": ["person_1", 41]}), &tech).is_err());
        assert!(confirmed_matches(&json!({"first": ["person_1", 40]}), &tech).is_err());
        assert!(confirmed_matches(&json!({"pair_1": ["person_1"]}), &tech).is_err());
    }

    #[test]
    fn manual_matches_only_between_unpaired() {
        let new = BTreeSet::from([2, 3]);
        let existing = BTreeSet::from([7, 8]);
        let ok = manual_matches(&json!({"x": ["person_2", 8]}), &new, &existing).unwrap();
        assert_eq!(ok, vec![(2, 8)]);
        assert!(manual_matches(&json!({"x": ["person_1", 8]}), &new, &existing).is_err());
        assert!(manual_matches(&json!({"x": ["person_2", 9]}), &new, &existing).is_err());
        assert!(manual_matches(&json!({"x": ["person_2", 8], "y": ["person_3", 8]}), &new, &existing).is_err());
    }
}
