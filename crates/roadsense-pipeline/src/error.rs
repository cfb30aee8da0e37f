//! Cycle-level errors. Anything here aborts the cycle it was raised in.

use roadsense_store::CollisionStoreError;
use std::path::PathBuf;

/// A situation or route snapshot could not be read at all.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{feed} feed unavailable at {path}: {message}")]
    Unavailable {
        feed: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("{feed} feed at {path} is not a GeoJSON FeatureCollection")]
    NotFeatureCollection { feed: &'static str, path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("invalid cycle settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Store(#[from] CollisionStoreError),

    #[error("store worker failed: {0}")]
    Worker(String),
}
