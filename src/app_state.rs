use std::sync::Arc;

use crate::services::{imports::ImportService, queue::TaskQueue, store::StatusStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StatusStore>,
    pub queue: Arc<TaskQueue>,
    pub imports: Arc<ImportService>,
}

impl AppState {
    pub fn new(store: Arc<dyn StatusStore>, queue: Arc<TaskQueue>, imports: ImportService) -> Self {
        Self {
            store,
            queue,
            imports: Arc::new(imports),
        }
    }
}
