//! Fake stage runners with scripted behavior.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use leadscout::stage::{RecordSink, StageContext, StageRecord};
use leadscout::{StageError, StageKind, StageRunner};
use serde_json::json;
use tokio::sync::Notify;

/// Writes `records` records per run and counts its runs.
pub struct RecordingRunner {
    kind: StageKind,
    records: usize,
    runs: AtomicUsize,
}

impl RecordingRunner {
    pub fn new(kind: StageKind, records: usize) -> Self {
        Self {
            kind,
            records,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageRunner for RecordingRunner {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn run(&self, ctx: &StageContext, sink: &RecordSink) -> Result<(), StageError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for i in 0..self.records {
            sink.persist(StageRecord::new(
                format!("{} {}", self.kind, i + 1),
                json!({ "product": ctx.product, "industries": ctx.industries }),
            ))?;
        }
        Ok(())
    }
}

/// Fails its first `failures` runs, then writes one record per run.
pub struct FailingRunner {
    kind: StageKind,
    transient: bool,
    failures: usize,
    runs: AtomicUsize,
}

impl FailingRunner {
    /// Fails every run with a terminal error.
    pub fn terminal(kind: StageKind) -> Self {
        Self {
            kind,
            transient: false,
            failures: usize::MAX,
            runs: AtomicUsize::new(0),
        }
    }

    /// Fails the first `failures` runs with a transient error.
    pub fn transient(kind: StageKind, failures: usize) -> Self {
        Self {
            kind,
            transient: true,
            failures,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageRunner for FailingRunner {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn run(&self, _ctx: &StageContext, sink: &RecordSink) -> Result<(), StageError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run < self.failures {
            return Err(if self.transient {
                StageError::transient(self.kind, "provider returned 503 Service Unavailable")
            } else {
                StageError::terminal(self.kind, "provider returned 400 Bad Request")
            });
        }
        sink.persist(StageRecord::new(self.kind.as_str(), json!({})))?;
        Ok(())
    }
}

/// Signals when it starts, then blocks until released.
pub struct GatedRunner {
    kind: StageKind,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GatedRunner {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl StageRunner for GatedRunner {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn run(&self, _ctx: &StageContext, sink: &RecordSink) -> Result<(), StageError> {
        self.entered.notify_one();
        self.release.notified().await;
        sink.persist(StageRecord::new(self.kind.as_str(), json!({})))?;
        Ok(())
    }
}

/// Panics on every run.
pub struct PanickingRunner {
    kind: StageKind,
    runs: AtomicUsize,
}

impl PanickingRunner {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageRunner for PanickingRunner {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn run(&self, _ctx: &StageContext, _sink: &RecordSink) -> Result<(), StageError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        panic!("{} runner hit an unexpected response shape", self.kind);
    }
}
