//! # Cadence Core
//!
//! Shared configuration, error taxonomy, domain types and the traits through
//! which the scheduler talks to its external collaborators (send providers,
//! the campaign directory, the content source).

pub mod catalog;
pub mod config;
pub mod error;
pub mod lead;
pub mod traits;
pub mod types;

pub use error::{CadenceError, ErrorKind, Result};
pub use lead::{Lead, LeadRecord};
pub use traits::{CampaignDirectory, ContentSource, SendProvider};
