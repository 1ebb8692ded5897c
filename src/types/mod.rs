//! Core domain types.

mod ids;
mod pr;

pub use ids::{DeliveryId, InvalidSha, PrNumber, Sha};
pub use pr::{Approval, CheckState, ChecksStatus, PrState, PrSummary, PullRequest};
