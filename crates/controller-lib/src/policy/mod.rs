//! Policy records, the shared index and instance matching

mod index;
mod matcher;
mod record;
mod status;

pub use index::{PolicyIndex, PolicySnapshot};
pub use matcher::{match_instance, policy_matches};
pub use record::Policy;
pub use status::{Phase, PolicyStatus};
