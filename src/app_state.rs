use std::sync::Arc;

use crate::services::processor::BatchProcessor;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<BatchProcessor>,
}

impl AppState {
    pub fn new(processor: BatchProcessor) -> Self {
        Self {
            processor: Arc::new(processor),
        }
    }
}
