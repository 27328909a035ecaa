//! Test harness for isolated orchestration runs.

#![allow(dead_code)]

use std::time::Duration;

use leadscout::config::{PolicyConfig, WorkersConfig};
use leadscout::db::search_repo;
use leadscout::{
    Database, NewSearch, Search, SearchService, SearchStatus, StageSet, WorkerPool,
};

/// A `SearchService` over a fresh in-memory database.
pub struct TestHarness {
    pub db: Database,
    pub service: SearchService,
}

impl TestHarness {
    /// Default policy, except retries are not delayed.
    pub fn new(stages: StageSet) -> Self {
        let policy = PolicyConfig {
            retry_backoff_secs: 0,
            ..Default::default()
        };
        Self::with_policy(stages, &policy)
    }

    pub fn with_policy(stages: StageSet, policy: &PolicyConfig) -> Self {
        let db = Database::open_in_memory().expect("Failed to create test database");
        let service = SearchService::new(db.clone(), policy, stages);
        Self { db, service }
    }

    pub fn create_search(&self, request: NewSearch) -> Search {
        self.service
            .create_search(request)
            .expect("Failed to create search")
    }

    /// Reads the search straight from the store.
    pub fn search(&self, id: &str) -> Search {
        search_repo::find_by_id(&self.db, id)
            .expect("Failed to read search")
            .expect("Search missing")
    }

    /// Starts a worker pool for the service's job handlers.
    pub fn start_workers(&self, count: usize) -> WorkerPool {
        WorkerPool::start(
            self.service.job_store().clone(),
            self.service.job_handlers(),
            &WorkersConfig {
                count,
                poll_interval_ms: 10,
            },
        )
        .expect("Failed to start workers")
    }

    /// Polls until the search reaches `status` or five seconds pass.
    pub async fn wait_for_status(&self, id: &str, status: SearchStatus) -> Search {
        for _ in 0..500 {
            let search = self.search(id);
            if search.status == status {
                return search;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("search {} never reached {}", id, status);
    }
}
