//! On-disk model artifacts, one MessagePack file per equipment.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ModelError, Result};
use crate::lof::LocalOutlierFactor;
use crate::model::EquipmentModel;
use crate::scaler::FeatureScaler;

/// Bumped whenever the artifact layout changes incompatibly.
const FORMAT_VERSION: u32 = 1;

const ARTIFACT_PREFIX: &str = "lof_";
const ARTIFACT_EXTENSION: &str = "mpk";

#[derive(Serialize, Deserialize)]
struct ModelArtifact {
    format_version: u32,
    equipment_id: String,
    detector: LocalOutlierFactor,
    scaler: FeatureScaler,
}

/// Loads and saves [`EquipmentModel`] artifacts under a directory.
///
/// The file name is derived from the equipment identifier
/// (`lof_<equipment>.mpk`), so each equipment has exactly one artifact.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the artifact for `equipment_id`.
    pub fn artifact_path(&self, equipment_id: &str) -> Result<PathBuf> {
        validate_name(equipment_id)?;
        Ok(self
            .dir
            .join(format!("{ARTIFACT_PREFIX}{equipment_id}.{ARTIFACT_EXTENSION}")))
    }

    /// Deserialize the scaler/detector pair persisted for `equipment_id`.
    pub fn load(&self, equipment_id: &str) -> Result<EquipmentModel> {
        let path = self.artifact_path(equipment_id)?;

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ModelError::NotFound {
                    equipment_id: equipment_id.to_string(),
                    path,
                });
            }
            Err(e) => return Err(ModelError::Io(e)),
        };

        let artifact: ModelArtifact = rmp_serde::from_slice(&bytes).map_err(|e| ModelError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if artifact.format_version != FORMAT_VERSION {
            return Err(ModelError::Corrupt {
                path,
                reason: format!(
                    "unsupported format version {} (expected {FORMAT_VERSION})",
                    artifact.format_version
                ),
            });
        }

        if artifact.equipment_id != equipment_id {
            warn!(
                equipment = %equipment_id,
                trained_for = %artifact.equipment_id,
                path = %path.display(),
                "model artifact was trained under a different equipment name"
            );
        }

        let model = EquipmentModel::new(equipment_id, artifact.scaler, artifact.detector).map_err(
            |e| ModelError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            },
        )?;

        info!(
            equipment = %equipment_id,
            path = %path.display(),
            features = model.n_features(),
            samples = model.detector().n_samples(),
            "model loaded"
        );
        Ok(model)
    }

    /// Persist `model` as the artifact for its equipment. Returns the path.
    ///
    /// Writes to a temporary sibling first and renames it into place, so a
    /// concurrently starting service never reads a half-written file.
    pub fn save(&self, model: &EquipmentModel) -> Result<PathBuf> {
        let path = self.artifact_path(model.equipment_id())?;
        fs::create_dir_all(&self.dir)?;

        let (equipment_id, scaler, detector) = model.clone().into_parts();
        let artifact = ModelArtifact {
            format_version: FORMAT_VERSION,
            equipment_id,
            detector,
            scaler,
        };
        let bytes = rmp_serde::to_vec_named(&artifact).map_err(|e| ModelError::Corrupt {
            path: path.clone(),
            reason: format!("encode failed: {e}"),
        })?;

        let tmp = path.with_extension(format!("{ARTIFACT_EXTENSION}.tmp"));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;

        info!(path = %path.display(), bytes = bytes.len(), "model saved");
        Ok(path)
    }
}

fn validate_name(equipment_id: &str) -> Result<()> {
    let valid = !equipment_id.is_empty()
        && equipment_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && equipment_id != "."
        && equipment_id != "..";
    if valid {
        Ok(())
    } else {
        Err(ModelError::InvalidName(equipment_id.to_string()))
    }
}
