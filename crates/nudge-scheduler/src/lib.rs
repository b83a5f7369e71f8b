//! # Nudge Scheduler
//!
//! Multi-stage direct-message campaign: an initial message, a reminder after
//! 24h and a last one after 72h, stopping as soon as the recipient completes
//! the requested action or turns out to be excluded.
//!
//! ## Architecture
//! ```text
//! Reconciler (tokio interval, one pass at a time)
//!   ├── flush unpersisted writes from earlier passes
//!   ├── RecordStore::load_all
//!   └── per recipient → StageScheduler
//!         ├── EligibilityGate   (oracle, permissive on timeout)
//!         ├── re-read record    (out-of-band completion wins)
//!         ├── ContentResolver   (snapshot, mention substitution)
//!         ├── DeliveryExecutor  (timeout, classify, pacing)
//!         └── guarded RecordPatch write
//!
//! Completion trigger → audit row + guarded move to Completed
//! EventLog → ring buffer + operator log channel
//! ```

pub mod completion;
pub mod content;
pub mod delivery;
pub mod eligibility;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod recovery;
pub mod shutdown;
pub mod stage;

#[cfg(test)]
pub(crate) mod test_support;

pub use completion::CompletionResult;
pub use content::{ContentResolver, ContentSnapshot, spawn_refresher};
pub use delivery::{DeliveryExecutor, Pacing};
pub use eligibility::{Eligibility, EligibilityGate};
pub use engine::{CampaignStatus, Collaborators, PassReport, PassScope, Reconciler, spawn_loop};
pub use notify::{CampaignEvent, EventKind, EventLog, NotifyPriority};
pub use persistence::CampaignDb;
pub use recovery::RebaseReport;
pub use shutdown::Shutdown;
pub use stage::{StagePolicy, StageScheduler, StepOutcome};
