pub mod album;
pub mod face;
pub mod person;
pub mod stage;

pub use album::{Album, Photo, User};
pub use face::{Bbox, DetectedFace, Embedding, EMBEDDING_DIM};
pub use person::{StoredFace, StoredPattern, StoredPerson};
pub use stage::{Finished, Stage, Status};
