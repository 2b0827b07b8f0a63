//! Per-equipment novelty detection: a standardizing feature scaler paired with
//! a Local Outlier Factor detector, trained offline and persisted as one
//! artifact per equipment.

pub mod error;
pub mod lof;
pub mod model;
pub mod scaler;
pub mod store;

pub use error::{ModelError, Result};
pub use lof::LocalOutlierFactor;
pub use model::{train, EquipmentModel, Label, TrainParams};
pub use scaler::FeatureScaler;
pub use store::ModelStore;
