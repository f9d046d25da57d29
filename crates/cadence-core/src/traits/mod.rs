//! Seams to external collaborators.

pub mod directory;
pub mod provider;

pub use directory::{CampaignDirectory, CampaignProfile, ContentSource, ExperimentProfile};
pub use provider::{ConnectivityReport, SendProvider};
