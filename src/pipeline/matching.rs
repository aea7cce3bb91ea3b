//! Distance math shared by pattern building, reconciliation, persistence and
//! the cluster tree.

use crate::models::Embedding;
use crate::utils::config::RecognitionSettings;

/// Fraction of `members` within `tolerance` of `face`. Empty input scores 0.
pub fn match_fraction(face: &Embedding, members: &[&Embedding], tolerance: f64) -> f64 {
    if members.is_empty() {
        return 0.0;
    }
    let hits = members.iter().filter(|m| face.distance(m) <= tolerance).count();
    hits as f64 / members.len() as f64
}

/// Two face sets are the same pattern when more than the equality share of
/// all cross pairs match.
pub fn patterns_equal(a: &[&Embedding], b: &[&Embedding], settings: &RecognitionSettings) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let mut hits = 0usize;
    for x in a {
        for y in b {
            if x.distance(y) <= settings.face_recognition_tolerance {
                hits += 1;
            }
        }
    }
    hits as f64 / (a.len() * b.len()) as f64 > settings.pattern_equality_tolerance
}

/// Index of the member with the smallest summed distance to the rest.
/// Ties resolve to the earliest member.
pub fn medoid_index(items: &[&Embedding]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, x) in items.iter().enumerate() {
        let total: f64 = items.iter().map(|y| x.distance(y)).sum();
        match best {
            Some((_, b)) if total >= b => {}
            _ => best = Some((i, total)),
        }
    }
    best.map(|(i, _)| i)
}

/// One pattern as the reconciler compares it.
#[derive(Debug, Clone, Copy)]
pub struct PatternView<'a> {
    pub central: &'a Embedding,
    pub faces: &'a [&'a Embedding],
}

/// Person distance: pick the pattern pair with the closest central faces,
/// then take the smallest face-to-face distance within that pair.
pub fn person_distance(a: &[PatternView<'_>], b: &[PatternView<'_>]) -> Option<f64> {
    let mut best: Option<(f64, usize, usize)> = None;
    for (i, p) in a.iter().enumerate() {
        for (j, q) in b.iter().enumerate() {
            let d = p.central.distance(q.central);
            if best.map_or(true, |(bd, _, _)| d < bd) {
                best = Some((d, i, j));
            }
        }
    }
    let (_, i, j) = best?;
    a[i].faces
        .iter()
        .flat_map(|x| b[j].faces.iter().map(move |y| x.distance(y)))
        .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |m| m.min(d))))
}
