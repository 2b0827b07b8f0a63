use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration source is missing, unreadable or malformed.
    #[error("configuration unavailable from {origin}: {reason}")]
    Unavailable { origin: String, reason: String },
}

impl ConfigError {
    pub fn unavailable(origin: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
