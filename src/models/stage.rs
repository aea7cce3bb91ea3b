use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an album in the recognition state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum Stage {
    NotStarted,
    Start,
    FaceSearch,
    VerifyFrames,
    BuildPatterns,
    VerifyPatterns,
    GroupPatterns,
    Reconcile,
    VerifyMatches,
    ManualMatch,
    Commit,
}

impl Stage {
    pub fn as_i64(self) -> i64 {
        match self {
            Stage::NotStarted => -1,
            Stage::Start => 0,
            Stage::FaceSearch => 1,
            Stage::VerifyFrames => 2,
            Stage::BuildPatterns => 3,
            Stage::VerifyPatterns => 4,
            Stage::GroupPatterns => 5,
            Stage::Reconcile => 6,
            Stage::VerifyMatches => 7,
            Stage::ManualMatch => 8,
            Stage::Commit => 9,
        }
    }

    pub fn from_i64(v: i64) -> Option<Stage> {
        Some(match v {
            -1 => Stage::NotStarted,
            0 => Stage::Start,
            1 => Stage::FaceSearch,
            2 => Stage::VerifyFrames,
            3 => Stage::BuildPatterns,
            4 => Stage::VerifyPatterns,
            5 => Stage::GroupPatterns,
            6 => Stage::Reconcile,
            7 => Stage::VerifyMatches,
            8 => Stage::ManualMatch,
            9 => Stage::Commit,
            _ => return None,
        })
    }

    /// Stages run by the worker pool rather than by a user submission.
    pub fn is_background(self) -> bool {
        matches!(self, Stage::FaceSearch | Stage::BuildPatterns | Stage::Reconcile | Stage::Commit)
    }

    /// Stages driven by a user payload.
    pub fn is_user_submitted(self) -> bool {
        matches!(
            self,
            Stage::VerifyFrames | Stage::VerifyPatterns | Stage::GroupPatterns | Stage::VerifyMatches | Stage::ManualMatch
        )
    }
}

impl From<Stage> for i64 {
    fn from(s: Stage) -> i64 {
        s.as_i64()
    }
}

impl TryFrom<i64> for Stage {
    type Error = String;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        Stage::from_i64(v).ok_or_else(|| format!("unknown stage {}", v))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Processing,
    Completed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Processing => "processing",
            Status::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Status> {
        match s {
            "processing" => Some(Status::Processing),
            "completed" => Some(Status::Completed),
            _ => None,
        }
    }
}

/// Terminal marker written to `album_<A>_finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Finished {
    #[serde(rename = "no_faces")]
    NoFaces,
    #[serde(rename = "1")]
    Done,
}

impl Finished {
    pub fn as_str(self) -> &'static str {
        match self {
            Finished::NoFaces => "no_faces",
            Finished::Done => "1",
        }
    }

    pub fn parse(s: &str) -> Option<Finished> {
        match s {
            "no_faces" => Some(Finished::NoFaces),
            "1" => Some(Finished::Done),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_numbers_round_trip() {
        for v in -1..=9 {
            assert_eq!(Stage::from_i64(v).map(Stage::as_i64), Some(v));
        }
        assert_eq!(Stage::from_i64(10), None);
        assert!(Stage::Commit.is_background());
        assert!(!Stage::VerifyFrames.is_background());
    }
}
