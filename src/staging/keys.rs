//! Key and field names of the staging schema. Deployed data depends on these
//! exact strings; build them here and nowhere else.

pub const CURRENT_STAGE: &str = "current_stage";
pub const STATUS: &str = "status";
pub const PROCESSED_PHOTOS: &str = "number_of_processed_photos";
pub const VERIFIED_PATTERNS: &str = "number_of_verified_patterns";
pub const PEOPLE_AMOUNT: &str = "people_amount";
pub const FACES_AMOUNT: &str = "faces_amount";
pub const CENTRAL_FACE: &str = "central_face";
pub const PERSON: &str = "person";
pub const TECH_PAIR: &str = "tech_pair";
pub const REAL_PAIR: &str = "real_pair";

/// `album_<A>` hash.
pub fn album(album_id: i64) -> String {
    format!("album_{}", album_id)
}

/// Prefix shared by every per-album record other than the album hash itself.
pub fn album_prefix(album_id: i64) -> String {
    format!("album_{}_", album_id)
}

pub fn album_finished(album_id: i64) -> String {
    format!("album_{}_finished", album_id)
}

pub fn album_photos(album_id: i64) -> String {
    format!("album_{}_photos", album_id)
}

pub fn album_pattern(album_id: i64, pattern: usize) -> String {
    format!("album_{}_pattern_{}", album_id, pattern)
}

pub fn album_person(album_id: i64, person: usize) -> String {
    format!("album_{}_person_{}", album_id, person)
}

pub fn photo(slug: &str) -> String {
    format!("photo_{}", slug)
}

pub fn nearest_people(person_id: i64) -> String {
    format!("nearest_people_to_{}", person_id)
}

pub fn processed_patterns(person_id: i64) -> String {
    format!("person_{}_processed_patterns_amount", person_id)
}

pub fn face_location(face: usize) -> String {
    format!("face_{}_location", face)
}

pub fn face_encoding(face: usize) -> String {
    format!("face_{}_encoding", face)
}

pub fn face(face: usize) -> String {
    format!("face_{}", face)
}

pub fn pattern(pattern: usize) -> String {
    format!("pattern_{}", pattern)
}

pub fn person(person: usize) -> String {
    format!("person_{}", person)
}

/// `photo_<slug>_face_<k>`: a pattern member's pointer back into its photo hash.
pub fn photo_face_ref(slug: &str, face: usize) -> String {
    format!("photo_{}_face_{}", slug, face)
}

/// Inverse of [`photo_face_ref`]. Slugs may contain underscores, so the face
/// number is taken from the last `_face_` marker.
pub fn parse_photo_face_ref(value: &str) -> Option<(String, usize)> {
    let rest = value.strip_prefix("photo_")?;
    let (slug, face) = rest.rsplit_once("_face_")?;
    if slug.is_empty() {
        return None;
    }
    Some((slug.to_string(), parse_ordinal(face)?))
}

/// `person_<pk>` pair value.
pub fn person_ref(person_id: i64) -> String {
    format!("person_{}", person_id)
}

pub fn parse_person_ref(value: &str) -> Option<i64> {
    value.strip_prefix("person_")?.parse().ok().filter(|v: &i64| *v > 0)
}

/// Parse `<prefix>_<n>` with `n >= 1` and no leading zeros.
pub fn parse_indexed(name: &str, prefix: &str) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    parse_ordinal(rest)
}

fn parse_ordinal(s: &str) -> Option<usize> {
    if s.is_empty() || s.starts_with('0') || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
