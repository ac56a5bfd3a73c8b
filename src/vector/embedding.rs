//! Embedding generation for defect facets.
//!
//! The embedding model is an external collaborator: everything above this
//! module only sees the [`EmbeddingGenerator`] trait. [`FastEmbedGenerator`]
//! is the production implementation backed by fastembed.

use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tracing::{debug, info};

use crate::types::{FacetMap, FacetVectors};
use crate::vector::{VectorDimension, VectorError};

/// Trait for generating embeddings from text.
///
/// Implementations of this trait should be thread-safe and
/// capable of handling batch processing efficiently.
pub trait EmbeddingGenerator: Send + Sync {
    /// Generate embeddings for multiple texts.
    ///
    /// # Returns
    /// A vector of embeddings, one for each input text, or an error
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError>;

    /// Get the dimension of embeddings produced by this generator.
    #[must_use]
    fn dimension(&self) -> VectorDimension;
}

/// Resolves a configured model name to a fastembed model and its dimension.
pub fn parse_embedding_model(name: &str) -> Result<(EmbeddingModel, usize), VectorError> {
    let normalized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    match normalized.as_str() {
        "allminilml6v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
        "allminilml12v2" => Ok((EmbeddingModel::AllMiniLML12V2, 384)),
        "bgesmallenv15" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "bgebaseenv15" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        "multilinguale5small" => Ok((EmbeddingModel::MultilingualE5Small, 384)),
        _ => Err(VectorError::EmbeddingFailed(format!(
            "Unknown embedding model '{name}'. Supported: AllMiniLML6V2, AllMiniLML12V2, BGESmallENV15, BGEBaseENV15, MultilingualE5Small"
        ))),
    }
}

/// Default location for downloaded model files.
pub fn default_model_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bugscout")
        .join("models")
}

/// FastEmbed implementation of [`EmbeddingGenerator`].
pub struct FastEmbedGenerator {
    model: Mutex<TextEmbedding>,
    dimension: VectorDimension,
}

impl FastEmbedGenerator {
    /// Create a generator for the named model, downloading it into
    /// `cache_dir` on first use.
    ///
    /// # Errors
    /// Returns an error if the model name is unknown or the model fails to
    /// initialize or download.
    pub fn new(model_name: &str, cache_dir: Option<PathBuf>) -> Result<Self, VectorError> {
        let (model, dim) = parse_embedding_model(model_name)?;
        let cache_dir = cache_dir.unwrap_or_else(default_model_cache_dir);
        debug!(model = model_name, cache_dir = %cache_dir.display(), "initializing embedding model");

        let model = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(false),
        )
        .map_err(|e| VectorError::EmbeddingFailed(
            format!("Failed to initialize embedding model: {e}. Ensure you have internet connection for first-time model download")
        ))?;

        info!(model = model_name, dimension = dim, "embedding model ready");
        Ok(Self {
            model: Mutex::new(model),
            dimension: VectorDimension::new(dim)?,
        })
    }
}

impl EmbeddingGenerator for FastEmbedGenerator {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let text_strings: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();

        let embeddings = self
            .model
            .lock()
            .map_err(|_| {
                VectorError::EmbeddingFailed(
                    "Failed to acquire embedding model lock - model may be poisoned".to_string(),
                )
            })?
            .embed(text_strings, None)
            .map_err(|e| {
                VectorError::EmbeddingFailed(format!("Failed to generate embeddings: {e}"))
            })?;

        for embedding in embeddings.iter() {
            self.dimension.validate_vector(embedding)?;
        }

        Ok(embeddings)
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}

/// Embeds every populated facet text in one batch call.
///
/// Blank texts are skipped, so the result only holds facets that carry
/// signal for this record or query.
pub fn embed_facet_texts(
    generator: &dyn EmbeddingGenerator,
    texts: &FacetMap<String>,
) -> Result<FacetVectors, VectorError> {
    let populated: Vec<_> = texts
        .iter()
        .filter(|(_, text)| !text.trim().is_empty())
        .collect();
    if populated.is_empty() {
        return Ok(FacetVectors::new());
    }

    let inputs: Vec<&str> = populated.iter().map(|(_, text)| text.as_str()).collect();
    let embeddings = generator.generate_embeddings(&inputs)?;
    if embeddings.len() != populated.len() {
        return Err(VectorError::EmbeddingFailed(format!(
            "expected {} embeddings, generator returned {}",
            populated.len(),
            embeddings.len()
        )));
    }

    Ok(populated
        .into_iter()
        .map(|(facet, _)| facet)
        .zip(embeddings)
        .collect())
}

/// Mock embedding generator for testing.
///
/// Produces deterministic unit vectors from keywords in the text.
#[cfg(test)]
pub struct MockEmbeddingGenerator {
    dimension: VectorDimension,
}

#[cfg(test)]
impl MockEmbeddingGenerator {
    #[must_use]
    pub fn with_dimension(dimension: VectorDimension) -> Self {
        Self { dimension }
    }
}

#[cfg(test)]
impl EmbeddingGenerator for MockEmbeddingGenerator {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        let dim = self.dimension.get();
        let keywords = ["crash", "timeout", "login", "null", "android", "ios"];

        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                let mut embedding = vec![0.05; dim];
                for (slot, keyword) in keywords.iter().enumerate() {
                    if slot < dim && lower.contains(keyword) {
                        embedding[slot] = 1.0;
                    }
                }
                super::metric::normalized(&embedding)
            })
            .collect())
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}
