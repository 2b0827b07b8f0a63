pub mod config;
pub mod error;
pub mod store;

pub use config::{ConfigSnapshot, ConfigSource, EquipmentEntry, TomlFileSource};
pub use error::*;
pub use store::ConfigStore;
