//! Application error types.

use std::fmt;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::loader::LoaderError;
use crate::pyramid::PyramidError;
use crate::store::StoreError;

/// Errors that can occur during the application lifecycle.
#[derive(Debug)]
pub enum AppError {
    /// Failed to open the dataset.
    Open(StoreError),

    /// Failed to start the cache hierarchy.
    CacheStart(CacheError),

    /// A viewport load failed as a whole.
    Load(LoaderError),

    /// Pyramid construction failed.
    Pyramid(PyramidError),

    /// Failed to decode or write a dataset on ingest.
    Ingest(String),

    /// Configuration error.
    Config(ConfigError),

    /// Failed to create the Tokio runtime.
    RuntimeCreation(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Open(e) => write!(f, "Failed to open dataset: {}", e),
            AppError::CacheStart(e) => write!(f, "Failed to start cache hierarchy: {}", e),
            AppError::Load(e) => write!(f, "Viewport load failed: {}", e),
            AppError::Pyramid(e) => write!(f, "Pyramid build failed: {}", e),
            AppError::Ingest(msg) => write!(f, "Ingest failed: {}", msg),
            AppError::Config(e) => write!(f, "Configuration error: {}", e),
            AppError::RuntimeCreation(msg) => write!(f, "Failed to create Tokio runtime: {}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Open(e) => Some(e),
            AppError::CacheStart(e) => Some(e),
            AppError::Load(e) => Some(e),
            AppError::Pyramid(e) => Some(e),
            AppError::Config(e) => Some(e),
            AppError::Ingest(_) | AppError::RuntimeCreation(_) => None,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Open(e)
    }
}

impl From<CacheError> for AppError {
    fn from(e: CacheError) -> Self {
        AppError::CacheStart(e)
    }
}

impl From<LoaderError> for AppError {
    fn from(e: LoaderError) -> Self {
        AppError::Load(e)
    }
}

impl From<PyramidError> for AppError {
    fn from(e: PyramidError) -> Self {
        AppError::Pyramid(e)
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Config(e)
    }
}
