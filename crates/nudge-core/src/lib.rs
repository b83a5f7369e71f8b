//! # Nudge Core
//! Shared configuration, error taxonomy, campaign data model and the traits
//! the scheduler uses to reach its external collaborators.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::NudgeConfig;
pub use error::{DeliveryError, ErrorClass, NudgeError, Result};
pub use types::{
    CellValue, Column, CompletionSubmission, DeliveryOutcome, RecipientRecord, RecordPatch,
    Stage, StageKey, UpdateOutcome,
};
