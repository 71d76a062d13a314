//! Error types for viewport loading.

use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;
use crate::transform::{BoundingBox, TransformError};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// The request does not overlap the dataset at the selected level.
    #[error("request {bounds:?} does not overlap level {level}")]
    OutsideDataset { bounds: BoundingBox, level: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
