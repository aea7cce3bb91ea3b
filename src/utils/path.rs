use std::path::{Path, PathBuf};

/// Root of the per-album scratch area: `<temp>/album_<A>`.
pub fn album_temp_dir(temp_root: &Path, album_id: i64) -> PathBuf {
    temp_root.join(format!("album_{}", album_id))
}

/// `<temp>/album_<A>/patterns/<pattern>`; both indexes are 1-based.
pub fn pattern_dir(temp_root: &Path, album_id: i64, pattern: usize) -> PathBuf {
    album_temp_dir(temp_root, album_id)
        .join("patterns")
        .join(pattern.to_string())
}

/// `<temp>/album_<A>/patterns/<pattern>/<face>.jpg`
pub fn face_thumb_path(temp_root: &Path, album_id: i64, pattern: usize, face: usize) -> PathBuf {
    pattern_dir(temp_root, album_id, pattern).join(format!("{}.jpg", face))
}
