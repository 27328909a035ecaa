//! Builders for creating test data programmatically.

#![allow(dead_code)]

use std::sync::Arc;

use leadscout::{NewSearch, Orientation, StageKind, StageRunner, StageSet};

use super::runners::RecordingRunner;

/// Builder for `NewSearch` requests.
pub struct SearchBuilder {
    owner_id: String,
    orientation: Orientation,
    product: String,
    industries: Vec<String>,
    countries: Vec<String>,
}

impl SearchBuilder {
    /// A customer search for CRM software in US technology companies.
    pub fn new() -> Self {
        Self {
            owner_id: "user-1".to_string(),
            orientation: Orientation::Customer,
            product: "CRM software".to_string(),
            industries: vec!["Technology".to_string()],
            countries: vec!["United States".to_string()],
        }
    }

    pub fn owner(mut self, owner_id: &str) -> Self {
        self.owner_id = owner_id.to_string();
        self
    }

    pub fn orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn product(mut self, product: &str) -> Self {
        self.product = product.to_string();
        self
    }

    pub fn industries(mut self, industries: &[&str]) -> Self {
        self.industries = industries.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn countries(mut self, countries: &[&str]) -> Self {
        self.countries = countries.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn build(self) -> NewSearch {
        NewSearch {
            owner_id: self.owner_id,
            orientation: self.orientation,
            product: self.product,
            industries: self.industries,
            countries: self.countries,
        }
    }
}

impl Default for SearchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a `StageSet`. Every stage defaults to a runner that writes
/// two records.
pub struct StagesBuilder {
    runners: Vec<Arc<dyn StageRunner>>,
}

impl StagesBuilder {
    pub fn new() -> Self {
        Self {
            runners: StageKind::ALL
                .into_iter()
                .map(|kind| Arc::new(RecordingRunner::new(kind, 2)) as Arc<dyn StageRunner>)
                .collect(),
        }
    }

    /// Replaces the runner for `runner.kind()`.
    pub fn with(mut self, runner: Arc<dyn StageRunner>) -> Self {
        let kind = runner.kind();
        self.runners.retain(|r| r.kind() != kind);
        self.runners.push(runner);
        self
    }

    pub fn build(self) -> StageSet {
        StageSet::from_runners(self.runners)
    }
}

impl Default for StagesBuilder {
    fn default() -> Self {
        Self::new()
    }
}
