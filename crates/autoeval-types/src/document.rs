//! Corpus document records.

use serde::{Deserialize, Serialize};

use crate::eval::Difficulty;

/// An enriched corpus document as held in the documents table.
///
/// `text` is usually empty in stored records; the body lives on disk at
/// `content_path`, relative to the configured data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub word_count: u64,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub entity_density: f64,
    pub difficulty_tag: Difficulty,
    #[serde(default)]
    pub category_tag: String,
    #[serde(default)]
    pub content_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

impl Document {
    /// Build a document whose body is carried inline.
    pub fn inline(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let word_count = text.split_whitespace().count() as u64;
        Self {
            doc_id: doc_id.into(),
            url: String::new(),
            word_count,
            // Rough 4/3 tokens-per-word estimate.
            token_count: word_count * 4 / 3,
            entity_density: 0.0,
            difficulty_tag: Difficulty::Medium,
            category_tag: "general".into(),
            content_path: String::new(),
            text,
        }
    }
}
