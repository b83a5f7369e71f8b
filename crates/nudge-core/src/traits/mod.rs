//! Narrow interfaces to the campaign's external collaborators.

pub mod content;
pub mod eligibility;
pub mod log;
pub mod store;
pub mod transport;

pub use content::ContentSource;
pub use eligibility::EligibilityOracle;
pub use log::LogChannel;
pub use store::RecordStore;
pub use transport::Transport;
