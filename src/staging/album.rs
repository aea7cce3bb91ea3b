//! Typed view over one album's staging records. Stage handlers go through
//! this instead of touching raw keys.

use std::collections::HashMap;
use std::fmt;

use super::codec;
use super::keys;
use super::{StagingError, StagingResult, StagingStore};
use crate::models::{DetectedFace, Finished, Stage, Status};

/// Pointer from a pattern member to `face_<index>` of photo `slug`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StagedFaceRef {
    pub slug: String,
    pub index: usize,
}

impl fmt::Display for StagedFaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&keys::photo_face_ref(&self.slug, self.index))
    }
}

/// `album_<A>_pattern_<i>`: members in order, 1-based central face.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedPattern {
    pub faces: Vec<StagedFaceRef>,
    pub central: usize,
    pub person: Option<usize>,
}

/// `album_<A>_person_<i>`: global pattern indexes plus pairing hints.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StagedPerson {
    pub patterns: Vec<usize>,
    pub tech_pair: Option<i64>,
    pub real_pair: Option<i64>,
}

pub struct AlbumState<'a> {
    store: &'a dyn StagingStore,
    album_id: i64,
}

impl<'a> AlbumState<'a> {
    pub fn new(store: &'a dyn StagingStore, album_id: i64) -> Self {
        Self { store, album_id }
    }

    pub fn album_id(&self) -> i64 {
        self.album_id
    }

    pub fn store(&self) -> &'a dyn StagingStore {
        self.store
    }

    fn malformed(key: &str, field: &str, message: impl Into<String>) -> StagingError {
        StagingError::Malformed {
            key: key.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }

    // -- album hash ---------------------------------------------------------

    pub fn exists(&self) -> StagingResult<bool> {
        self.store.exists(&keys::album(self.album_id))
    }

    pub fn current_stage(&self) -> StagingResult<Option<Stage>> {
        let key = keys::album(self.album_id);
        match self.store.hget_i64(&key, keys::CURRENT_STAGE)? {
            None => Ok(None),
            Some(v) => Stage::from_i64(v)
                .map(Some)
                .ok_or_else(|| Self::malformed(&key, keys::CURRENT_STAGE, format!("unknown stage {}", v))),
        }
    }

    pub fn status(&self) -> StagingResult<Option<Status>> {
        let key = keys::album(self.album_id);
        match self.store.hget_str(&key, keys::STATUS)? {
            None => Ok(None),
            Some(s) => Status::parse(&s)
                .map(Some)
                .ok_or_else(|| Self::malformed(&key, keys::STATUS, format!("unknown status {:?}", s))),
        }
    }

    pub fn set_stage(&self, stage: Stage, status: Status) -> StagingResult<()> {
        let key = keys::album(self.album_id);
        self.store.hset_i64(&key, keys::CURRENT_STAGE, stage.as_i64())?;
        self.store.hset_str(&key, keys::STATUS, status.as_str())
    }

    pub fn finished(&self) -> StagingResult<Option<Finished>> {
        let key = keys::album_finished(self.album_id);
        match self.store.get_str(&key)? {
            None => Ok(None),
            Some(s) => Finished::parse(&s)
                .map(Some)
                .ok_or_else(|| Self::malformed(&key, "", format!("unknown finished marker {:?}", s))),
        }
    }

    pub fn set_finished(&self, finished: Finished) -> StagingResult<()> {
        self.store.set(&keys::album_finished(self.album_id), finished.as_str().as_bytes())
    }

    pub fn incr_processed_photos(&self) -> StagingResult<i64> {
        self.store.hincr_by(&keys::album(self.album_id), keys::PROCESSED_PHOTOS, 1)
    }

    pub fn processed_photos(&self) -> StagingResult<i64> {
        Ok(self.store.hget_i64(&keys::album(self.album_id), keys::PROCESSED_PHOTOS)?.unwrap_or(0))
    }

    pub fn set_verified_patterns(&self, n: usize) -> StagingResult<()> {
        self.store.hset_i64(&keys::album(self.album_id), keys::VERIFIED_PATTERNS, n as i64)
    }

    pub fn verified_patterns(&self) -> StagingResult<Option<i64>> {
        self.store.hget_i64(&keys::album(self.album_id), keys::VERIFIED_PATTERNS)
    }

    pub fn set_people_amount(&self, n: usize) -> StagingResult<()> {
        self.store.hset_i64(&keys::album(self.album_id), keys::PEOPLE_AMOUNT, n as i64)
    }

    pub fn people_amount(&self) -> StagingResult<usize> {
        Ok(self
            .store
            .hget_i64(&keys::album(self.album_id), keys::PEOPLE_AMOUNT)?
            .unwrap_or(0)
            .max(0) as usize)
    }

    // -- photos -------------------------------------------------------------

    pub fn photos(&self) -> StagingResult<Vec<String>> {
        Ok(self
            .store
            .lrange(&keys::album_photos(self.album_id))?
            .into_iter()
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .collect())
    }

    pub fn push_photo(&self, slug: &str) -> StagingResult<()> {
        self.store.rpush(&keys::album_photos(self.album_id), slug.as_bytes())?;
        Ok(())
    }

    pub fn remove_photo(&self, slug: &str) -> StagingResult<()> {
        self.store.lrem(&keys::album_photos(self.album_id), slug.as_bytes())?;
        self.store.delete(&keys::photo(slug))?;
        Ok(())
    }

    pub fn photo_faces(&self, slug: &str) -> StagingResult<Vec<DetectedFace>> {
        let key = keys::photo(slug);
        let fields: HashMap<String, Vec<u8>> = self.store.hgetall(&key)?.into_iter().collect();
        let amount = match fields.get(keys::FACES_AMOUNT) {
            None => return Ok(Vec::new()),
            Some(v) => String::from_utf8_lossy(v)
                .parse::<usize>()
                .map_err(|_| Self::malformed(&key, keys::FACES_AMOUNT, "not an integer"))?,
        };
        let mut out = Vec::with_capacity(amount);
        for i in 1..=amount {
            let loc_field = keys::face_location(i);
            let enc_field = keys::face_encoding(i);
            let loc = fields
                .get(&loc_field)
                .ok_or_else(|| Self::malformed(&key, &loc_field, "missing"))?;
            let enc = fields
                .get(&enc_field)
                .ok_or_else(|| Self::malformed(&key, &enc_field, "missing"))?;
            out.push(DetectedFace {
                location: codec::decode_bbox(loc).map_err(|m| Self::malformed(&key, &loc_field, m))?,
                encoding: codec::decode_embedding(enc).map_err(|m| Self::malformed(&key, &enc_field, m))?,
            });
        }
        Ok(out)
    }

    /// Replace the photo hash with `faces`, numbered 1..N in order.
    pub fn write_photo_faces(&self, slug: &str, faces: &[DetectedFace]) -> StagingResult<()> {
        let key = keys::photo(slug);
        self.store.delete(&key)?;
        for (i, face) in faces.iter().enumerate() {
            self.store.hset(&key, &keys::face_location(i + 1), &codec::encode_bbox(&face.location))?;
            self.store.hset(&key, &keys::face_encoding(i + 1), &codec::encode_embedding(&face.encoding))?;
        }
        self.store.hset_i64(&key, keys::FACES_AMOUNT, faces.len() as i64)
    }

    pub fn faces_amount(&self, slug: &str) -> StagingResult<usize> {
        Ok(self.store.hget_i64(&keys::photo(slug), keys::FACES_AMOUNT)?.unwrap_or(0).max(0) as usize)
    }

    /// Every staged face keyed by its photo reference.
    pub fn all_faces(&self) -> StagingResult<HashMap<StagedFaceRef, DetectedFace>> {
        let mut out = HashMap::new();
        for slug in self.photos()? {
            for (i, face) in self.photo_faces(&slug)?.into_iter().enumerate() {
                out.insert(StagedFaceRef { slug: slug.clone(), index: i + 1 }, face);
            }
        }
        Ok(out)
    }

    // -- patterns -----------------------------------------------------------

    /// Patterns are numbered contiguously from 1.
    pub fn patterns_count(&self) -> StagingResult<usize> {
        let mut n = 0;
        while self.store.exists(&keys::album_pattern(self.album_id, n + 1))? {
            n += 1;
        }
        Ok(n)
    }

    pub fn pattern(&self, index: usize) -> StagingResult<Option<StagedPattern>> {
        let key = keys::album_pattern(self.album_id, index);
        let fields: HashMap<String, Vec<u8>> = self.store.hgetall(&key)?.into_iter().collect();
        if fields.is_empty() {
            return Ok(None);
        }
        let text = |field: &str| fields.get(field).map(|v| String::from_utf8_lossy(v).into_owned());
        let amount: usize = text(keys::FACES_AMOUNT)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Self::malformed(&key, keys::FACES_AMOUNT, "missing or not an integer"))?;
        let mut faces = Vec::with_capacity(amount);
        for j in 1..=amount {
            let field = keys::face(j);
            let raw = text(&field).ok_or_else(|| Self::malformed(&key, &field, "missing"))?;
            let (slug, face) = keys::parse_photo_face_ref(&raw)
                .ok_or_else(|| Self::malformed(&key, &field, format!("bad face reference {:?}", raw)))?;
            faces.push(StagedFaceRef { slug, index: face });
        }
        let central = text(keys::CENTRAL_FACE)
            .and_then(|s| keys::parse_indexed(&s, "face"))
            .filter(|c| *c >= 1 && *c <= amount)
            .ok_or_else(|| Self::malformed(&key, keys::CENTRAL_FACE, "missing or out of range"))?;
        let person = text(keys::PERSON).and_then(|s| s.parse().ok());
        Ok(Some(StagedPattern { faces, central, person }))
    }

    pub fn patterns(&self) -> StagingResult<Vec<StagedPattern>> {
        let mut out = Vec::new();
        let mut i = 1;
        while let Some(p) = self.pattern(i)? {
            out.push(p);
            i += 1;
        }
        Ok(out)
    }

    pub fn write_pattern(&self, index: usize, pattern: &StagedPattern) -> StagingResult<()> {
        let key = keys::album_pattern(self.album_id, index);
        self.store.delete(&key)?;
        for (j, face) in pattern.faces.iter().enumerate() {
            self.store.hset_str(&key, &keys::face(j + 1), &face.to_string())?;
        }
        self.store.hset_str(&key, keys::CENTRAL_FACE, &keys::face(pattern.central))?;
        self.store.hset_i64(&key, keys::FACES_AMOUNT, pattern.faces.len() as i64)?;
        if let Some(person) = pattern.person {
            self.store.hset_i64(&key, keys::PERSON, person as i64)?;
        }
        Ok(())
    }

    pub fn set_pattern_person(&self, pattern: usize, person: usize) -> StagingResult<()> {
        self.store
            .hset_i64(&keys::album_pattern(self.album_id, pattern), keys::PERSON, person as i64)
    }

    pub fn delete_patterns(&self) -> StagingResult<()> {
        self.store.delete_prefix(&format!("album_{}_pattern_", self.album_id))?;
        Ok(())
    }

    // -- persons ------------------------------------------------------------

    pub fn person(&self, index: usize) -> StagingResult<Option<StagedPerson>> {
        let key = keys::album_person(self.album_id, index);
        let fields = self.store.hgetall(&key)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut ordered: Vec<(usize, usize)> = Vec::new();
        let mut person = StagedPerson::default();
        for (field, value) in fields {
            let value = String::from_utf8_lossy(&value).into_owned();
            if field == keys::TECH_PAIR || field == keys::REAL_PAIR {
                let pk = keys::parse_person_ref(&value)
                    .ok_or_else(|| Self::malformed(&key, &field, format!("bad person reference {:?}", value)))?;
                if field == keys::TECH_PAIR {
                    person.tech_pair = Some(pk);
                } else {
                    person.real_pair = Some(pk);
                }
            } else if let Some(j) = keys::parse_indexed(&field, "pattern") {
                let p = value
                    .parse()
                    .map_err(|_| Self::malformed(&key, &field, "pattern index is not an integer"))?;
                ordered.push((j, p));
            }
        }
        ordered.sort();
        person.patterns = ordered.into_iter().map(|(_, p)| p).collect();
        Ok(Some(person))
    }

    /// All staged persons, 1..people_amount.
    pub fn persons(&self) -> StagingResult<Vec<StagedPerson>> {
        let amount = self.people_amount()?;
        let mut out = Vec::with_capacity(amount);
        for i in 1..=amount {
            let p = self.person(i)?.ok_or_else(|| {
                Self::malformed(&keys::album_person(self.album_id, i), "", "person record missing")
            })?;
            out.push(p);
        }
        Ok(out)
    }

    pub fn write_person(&self, index: usize, person: &StagedPerson) -> StagingResult<()> {
        let key = keys::album_person(self.album_id, index);
        self.store.delete(&key)?;
        for (j, p) in person.patterns.iter().enumerate() {
            self.store.hset_str(&key, &keys::pattern(j + 1), &p.to_string())?;
        }
        if let Some(pk) = person.tech_pair {
            self.store.hset_str(&key, keys::TECH_PAIR, &keys::person_ref(pk))?;
        }
        if let Some(pk) = person.real_pair {
            self.store.hset_str(&key, keys::REAL_PAIR, &keys::person_ref(pk))?;
        }
        Ok(())
    }

    pub fn set_tech_pair(&self, person: usize, existing: i64) -> StagingResult<()> {
        self.store.hset_str(
            &keys::album_person(self.album_id, person),
            keys::TECH_PAIR,
            &keys::person_ref(existing),
        )
    }

    pub fn set_real_pair(&self, person: usize, existing: i64) -> StagingResult<()> {
        self.store.hset_str(
            &keys::album_person(self.album_id, person),
            keys::REAL_PAIR,
            &keys::person_ref(existing),
        )
    }

    pub fn delete_persons(&self) -> StagingResult<()> {
        self.store.delete_prefix(&format!("album_{}_person_", self.album_id))?;
        Ok(())
    }

    // -- teardown -----------------------------------------------------------

    /// Remove every record of this album (including the finished marker and
    /// the per-photo hashes). Returns the number of keys removed.
    pub fn clear(&self) -> StagingResult<usize> {
        let mut removed = 0;
        for slug in self.photos()? {
            if self.store.delete(&keys::photo(&slug))? {
                removed += 1;
            }
        }
        removed += self.store.delete_prefix(&keys::album_prefix(self.album_id))?;
        if self.store.delete(&keys::album(self.album_id))? {
            removed += 1;
        }
        Ok(removed)
    }
}
