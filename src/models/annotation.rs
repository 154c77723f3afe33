use serde::{Deserialize, Serialize};

/// A single generated annotation on an image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub label: String,
    pub confidence: f64,
    /// Normalized `[x, y, width, height]`, when the model localizes the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
}

/// Everything the provider produced for one image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotationSet {
    pub item_id: String,
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AnnotationSet {
    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }
}
