//! Error types for the defect knowledge base
//!
//! This module provides structured error types using thiserror for better
//! error handling and actionable error messages.

use std::path::PathBuf;
use thiserror::Error;

use crate::index::WriteReport;
use crate::types::{Facet, RowId};
use crate::vector::VectorError;

/// Main error type for knowledge base operations
#[derive(Error, Debug)]
pub enum KbError {
    /// Facet index errors
    #[error("Failed to load {facet} index from '{path}': {reason}")]
    IndexLoad {
        facet: Facet,
        path: PathBuf,
        reason: String,
    },

    #[error("Failed to build {facet} index: {reason}")]
    IndexBuild { facet: Facet, reason: String },

    #[error("Failed to replace '{path}' after {attempts} attempt(s): {source}")]
    AtomicSwap {
        path: PathBuf,
        attempts: u32,
        source: std::io::Error,
    },

    /// Metadata errors
    #[error("Metadata file '{path}' is corrupted: {reason}")]
    MetadataCorruption { path: PathBuf, reason: String },

    /// The indices were rebuilt but the records could not be stored.
    #[error("Indexed {} row(s) but failed to store their records: {source}", .report.row_ids.len())]
    MetadataWrite {
        report: Box<WriteReport>,
        source: Box<KbError>,
    },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid weight {value} for '{target}': weights must be finite and non-negative")]
    InvalidWeight { target: String, value: f32 },

    #[error("Embedding generation failed: {reason}")]
    Embedding { reason: String },

    #[error("No embedding generator configured for text operations")]
    NoEmbedder,

    #[error("Record {id} not found in metadata store")]
    RecordNotFound { id: RowId },

    #[error("Staging writer is not running")]
    StagingClosed,

    /// File system errors
    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error(transparent)]
    Vector(VectorError),
}

impl From<VectorError> for KbError {
    fn from(err: VectorError) -> Self {
        match err {
            VectorError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            VectorError::EmbeddingFailed(reason) => Self::Embedding { reason },
            other => Self::Vector(other),
        }
    }
}

impl KbError {
    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::IndexLoad { .. } => "INDEX_LOAD_FAILURE",
            Self::IndexBuild { .. } => "INDEX_BUILD_FAILURE",
            Self::AtomicSwap { .. } => "ATOMIC_SWAP_FAILURE",
            Self::MetadataCorruption { .. } => "METADATA_CORRUPTION",
            Self::MetadataWrite { .. } => "METADATA_WRITE_FAILURE",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::InvalidWeight { .. } => "INVALID_WEIGHT",
            Self::Embedding { .. } => "EMBEDDING_ERROR",
            Self::NoEmbedder => "NO_EMBEDDER",
            Self::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            Self::StagingClosed => "STAGING_CLOSED",
            Self::FileRead { .. } => "FILE_READ_ERROR",
            Self::FileWrite { .. } => "FILE_WRITE_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Vector(_) => "VECTOR_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::IndexLoad { .. } => vec![
                "The facet is ignored by searches until it is rebuilt",
                "Run 'bugscout rebuild --facet <name>' to rebuild it from metadata",
            ],
            Self::IndexBuild { .. } => vec![
                "The previous snapshot is still canonical for this facet",
                "Run 'bugscout verify' to check index and metadata consistency",
            ],
            Self::AtomicSwap { .. } => vec![
                "Check disk space and permissions in the data directory",
                "Ensure the scratch directory is on the same filesystem as the data directory",
            ],
            Self::MetadataCorruption { .. } => vec![
                "Restore metadata.json from a backup if one exists",
                "Set storage.recover_corrupt_metadata = true to start with an empty store",
            ],
            Self::MetadataWrite { .. } => vec![
                "The rows are indexed but have no records; searches skip them",
                "Run 'bugscout verify' to list them, then 'bugscout reindex' to drop them",
            ],
            Self::DimensionMismatch { .. } => vec![
                "Ensure vector.dimension matches the embedding model",
                "Run 'bugscout reindex' after switching embedding models",
            ],
            Self::NoEmbedder | Self::Embedding { .. } => vec![
                "Check the [embedding] section of settings.toml",
                "Ensure you have internet connection for first-time model download",
            ],
            Self::FileRead { .. } => vec![
                "Check that the file exists and you have read permissions",
                "Ensure the file is not locked by another process",
            ],
            Self::Config { .. } => vec!["Run 'bugscout config' to inspect the effective settings"],
            _ => vec![],
        }
    }
}

/// Result type alias for knowledge base operations
pub type KbResult<T> = Result<T, KbError>;
