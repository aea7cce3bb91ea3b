use serde::{Deserialize, Serialize};

use super::face::{Bbox, Embedding};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFace {
    pub id: i64,
    pub photo_id: i64,
    /// 1-based position of the face within its photo.
    pub index: i64,
    pub location: Bbox,
    pub encoding: Embedding,
    pub pattern_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPattern {
    pub id: i64,
    pub person_id: i64,
    pub central_face_id: Option<i64>,
    pub cluster_id: Option<i64>,
    pub registered_in_cluster: bool,
    pub faces: Vec<StoredFace>,
}

impl StoredPattern {
    pub fn central_face(&self) -> Option<&StoredFace> {
        let id = self.central_face_id?;
        self.faces.iter().find(|f| f.id == id)
    }

    pub fn encodings(&self) -> Vec<&Embedding> {
        self.faces.iter().map(|f| &f.encoding).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPerson {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub patterns: Vec<StoredPattern>,
}
