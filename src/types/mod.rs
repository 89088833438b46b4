//! Core domain types shared across the crate.

pub mod events;
pub mod ids;
pub mod merge_event;
pub mod record;

pub use events::{EventKey, EventKind};
pub use ids::{Branch, ChangeId, ChangeKey, RevisionId, RunId};
pub use merge_event::{parse_pick_to, MergeEvent};
pub use record::{BranchProgress, BranchStatus, ProcessingRecord, RecordState, TerminalOutcome};
