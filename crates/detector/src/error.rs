use std::path::PathBuf;

/// Errors raised while training, persisting, loading or applying a model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// No artifact exists for the requested equipment.
    #[error("no model artifact for '{equipment_id}' at {}", .path.display())]
    NotFound { equipment_id: String, path: PathBuf },

    /// The artifact exists but could not be decoded or is inconsistent.
    #[error("model artifact {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Scaler and detector disagree on the feature count.
    #[error("scaler expects {scaler} features but detector expects {detector}")]
    Inconsistent { scaler: usize, detector: usize },

    /// Fitted parameters that could not have come out of training.
    #[error("invalid model parameters: {0}")]
    InvalidModel(String),

    #[error("invalid training input: {0}")]
    InvalidTraining(String),

    #[error("feature vector {row} has {got} values, model expects {expected}")]
    DimensionMismatch {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("feature vector {row} contains a non-finite value")]
    NonFinite { row: usize },

    #[error("invalid equipment identifier '{0}'")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
