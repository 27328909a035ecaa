//! Search event broadcaster for real-time progress streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::search::SearchPhase;
use crate::stage::ResultRecord;

/// What happened to a search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchEventKind {
    PhaseChanged {
        phase: SearchPhase,
        #[serde(rename = "progressPct")]
        progress_pct: u8,
    },
    RecordInserted {
        record: ResultRecord,
    },
    Failed {
        phase: SearchPhase,
        error: String,
    },
    Cancelled,
    Completed,
}

impl SearchEventKind {
    /// The serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            SearchEventKind::PhaseChanged { .. } => "phase_changed",
            SearchEventKind::RecordInserted { .. } => "record_inserted",
            SearchEventKind::Failed { .. } => "failed",
            SearchEventKind::Cancelled => "cancelled",
            SearchEventKind::Completed => "completed",
        }
    }
}

/// Progress event for one search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchEvent {
    pub search_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SearchEventKind,
}

impl SearchEvent {
    pub fn new(search_id: &str, kind: SearchEventKind) -> Self {
        Self {
            search_id: search_id.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// True for events after which the search emits nothing more.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            SearchEventKind::Failed { .. } | SearchEventKind::Cancelled | SearchEventKind::Completed
        )
    }
}

/// Broadcasts search events to every subscriber over one channel.
#[derive(Clone)]
pub struct SearchEventBroadcaster {
    sender: Arc<broadcast::Sender<SearchEvent>>,
}

impl SearchEventBroadcaster {
    /// Creates a broadcaster with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: SearchEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribes to the events of a single search.
    pub fn subscribe(&self, search_id: &str) -> SearchSubscription {
        SearchSubscription {
            search_id: search_id.to_string(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Creates a tracker that stamps events with `search_id`.
    pub fn tracker(&self, search_id: &str) -> SearchProgressTracker {
        SearchProgressTracker {
            search_id: search_id.to_string(),
            sender: Arc::clone(&self.sender),
        }
    }
}

impl Default for SearchEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One item read from a [`SearchSubscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(SearchEvent),
    /// The receiver fell behind and this many channel events were dropped.
    /// Some of them may have belonged to this search.
    Lagged(u64),
}

/// Receives the events of one search, skipping everything else.
pub struct SearchSubscription {
    search_id: String,
    receiver: broadcast::Receiver<SearchEvent>,
}

impl SearchSubscription {
    pub fn search_id(&self) -> &str {
        &self.search_id
    }

    /// Waits for the next event of this search, or for a notice that
    /// events were dropped. Returns `None` once the broadcaster is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.search_id == self.search_id => {
                    return Some(Delivery::Event(event))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Subscriber for search {} lagged, skipped {} events",
                        self.search_id,
                        skipped
                    );
                    return Some(Delivery::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Like [`next`](Self::next), but passes over lag notices.
    pub async fn recv(&mut self) -> Option<SearchEvent> {
        loop {
            match self.next().await? {
                Delivery::Event(event) => return Some(event),
                Delivery::Lagged(_) => continue,
            }
        }
    }
}

/// Publishes events for a single search.
#[derive(Clone)]
pub struct SearchProgressTracker {
    search_id: String,
    sender: Arc<broadcast::Sender<SearchEvent>>,
}

impl SearchProgressTracker {
    pub fn search_id(&self) -> &str {
        &self.search_id
    }

    fn emit(&self, kind: SearchEventKind) {
        let _ = self.sender.send(SearchEvent::new(&self.search_id, kind));
    }

    pub fn phase_changed(&self, phase: SearchPhase, progress_pct: u8) {
        self.emit(SearchEventKind::PhaseChanged {
            phase,
            progress_pct,
        });
    }

    pub fn record_inserted(&self, record: ResultRecord) {
        self.emit(SearchEventKind::RecordInserted { record });
    }

    pub fn failed(&self, phase: SearchPhase, error: &str) {
        self.emit(SearchEventKind::Failed {
            phase,
            error: error.to_string(),
        });
    }

    pub fn cancelled(&self) {
        self.emit(SearchEventKind::Cancelled);
    }

    pub fn completed(&self) {
        self.emit(SearchEventKind::Completed);
    }
}
