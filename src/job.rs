//! Typed job payloads for the translation pipeline.
//!
//! The queue engine itself is payload-agnostic; these types live at the
//! producer/consumer boundary so call sites publish and match on a tagged
//! union instead of duck-typed JSON blobs.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    DocumentTranslation(DocumentTranslationJob),
    TextTranslation(TextTranslationJob),
    Improvement(ImprovementJob),
}

/// Translate a whole stored document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DocumentTranslationJob {
    pub document_id: String,
    pub source_language: String,
    pub target_language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

/// Translate a free-standing text fragment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TextTranslationJob {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

/// Re-run an existing translation with improvement instructions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImprovementJob {
    pub document_id: String,
    pub translation_id: String,
    pub instructions: String,
}

impl JobPayload {
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}
