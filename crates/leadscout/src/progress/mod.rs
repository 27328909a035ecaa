//! Progress snapshots and per-search event streams.

pub mod events;
pub mod reporter;

pub use events::{
    Delivery, SearchEvent, SearchEventBroadcaster, SearchEventKind, SearchProgressTracker,
    SearchSubscription,
};
pub use reporter::{ProgressCounts, ProgressReporter, ProgressSnapshot};
