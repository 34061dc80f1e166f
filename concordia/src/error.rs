//! Error types for the registration engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors. Recoverable insufficiencies (too few beads, patches or ICP
/// matches) are recorded as status flags instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Missing {what} for tile {tile}, round {round}")]
    MissingEntry {
        what: &'static str,
        tile: usize,
        round: usize,
    },

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0} has not run")]
    MissingStage(&'static str),

    #[error("Failed to access checkpoint '{path}': {source}")]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Checkpoint '{path}' is corrupt: {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("Collaborator failed: {0}")]
    Collaborator(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = Error::ShapeMismatch {
            what: "volume",
            expected: vec![4, 16, 16],
            actual: vec![4, 16],
        };
        let msg = err.to_string();
        assert!(msg.contains("volume"));
        assert!(msg.contains("[4, 16, 16]"));
    }

    #[test]
    fn test_checkpoint_io_has_source() {
        use std::error::Error as StdError;

        let err = Error::CheckpointIo {
            path: PathBuf::from("/out/registration.json"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/out/registration.json"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_collaborator_from_anyhow() {
        let err: Error = anyhow::anyhow!("tile 3 missing on disk").into();
        assert!(err.to_string().contains("tile 3 missing on disk"));
    }
}
