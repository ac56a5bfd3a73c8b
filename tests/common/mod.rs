#![allow(dead_code)]

use std::sync::Arc;

use bugscout::vector::VectorError;
use bugscout::{
    DefectRecord, EmbeddingGenerator, Facet, FacetVectors, KnowledgeBase, Settings,
    VectorDimension,
};
use tempfile::TempDir;

/// Settings for an isolated store with small forests.
pub fn toy_settings(dir: &TempDir, dimension: usize) -> Settings {
    let mut settings = Settings::default();
    settings.data_dir = dir.path().join("data");
    settings.workspace_root = Some(dir.path().to_path_buf());
    settings.vector.dimension = dimension;
    settings.vector.n_trees = 5;
    settings.vector.leaf_size = 8;
    settings.storage.swap_backoff_ms = 1;
    settings
}

/// Opens a knowledge base in a fresh temp dir. Keep the `TempDir` alive for
/// the duration of the test.
pub fn create_test_kb(dimension: usize) -> (KnowledgeBase, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let kb = KnowledgeBase::open(toy_settings(&temp_dir, dimension))
        .expect("Failed to open knowledge base");
    (kb, temp_dir)
}

pub fn create_text_kb() -> (KnowledgeBase, TempDir) {
    let (kb, temp_dir) = create_test_kb(KEYWORDS.len() + 2);
    let kb = kb
        .with_embedder(Arc::new(KeywordEmbedder::new(KEYWORDS.len() + 2)))
        .expect("embedder dimension matches");
    (kb, temp_dir)
}

pub fn record(identifier: &str, summary: &str) -> DefectRecord {
    DefectRecord::new(identifier, summary)
}

pub fn vectors(entries: &[(Facet, &[f32])]) -> FacetVectors {
    entries
        .iter()
        .map(|(facet, v)| (*facet, v.to_vec()))
        .collect()
}

pub const KEYWORDS: [&str; 8] = [
    "crash", "timeout", "login", "null", "android", "ios", "payment", "upload",
];

/// Deterministic embedder: one slot per keyword plus two constant slots, then
/// normalized.
pub struct KeywordEmbedder {
    dimension: VectorDimension,
}

impl KeywordEmbedder {
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > KEYWORDS.len());
        Self {
            dimension: VectorDimension::new(dimension).expect("non-zero dimension"),
        }
    }
}

impl EmbeddingGenerator for KeywordEmbedder {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                let mut v = vec![0.0f32; self.dimension.get()];
                for (slot, keyword) in KEYWORDS.iter().enumerate() {
                    if lower.contains(keyword) {
                        v[slot] = 1.0;
                    }
                }
                v[KEYWORDS.len()] = 0.1;
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                v.iter().map(|x| x / norm).collect()
            })
            .collect())
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}
