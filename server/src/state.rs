//! Shared application state for route handlers.

use leadscout::SearchService;

#[derive(Clone)]
pub struct AppState {
    /// Facade over every orchestration component.
    pub service: SearchService,
}

impl AppState {
    pub fn new(service: SearchService) -> Self {
        Self { service }
    }
}
