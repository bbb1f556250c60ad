use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug)]
pub enum ModelError {
    UnknownPhase(String),
    InvalidKeyVersion(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownPhase(name) => {
                write!(f, "unknown zone phase: {name}")
            }
            ModelError::InvalidKeyVersion(msg) => {
                write!(f, "invalid key version: {msg}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
